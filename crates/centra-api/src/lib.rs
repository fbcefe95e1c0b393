// centra-api: Async Rust client for Centra building-automation controllers
// (push stream + stateless invoke endpoint)

pub mod error;
pub mod poll;
pub mod session;
pub mod socket;
pub mod transport;
pub mod wire;

pub use error::Error;
pub use poll::PollClient;
pub use session::{Credentials, SessionManager};
pub use socket::{LinkState, PushEvent, SocketClient, SocketConfig};
