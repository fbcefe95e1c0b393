// centra-core: State synchronization and command dispatch for Centra
// building-automation controllers.

mod aggregate;
pub mod catalog;
pub mod channel;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod store;

// ── Primary re-exports ──────────────────────────────────────────────
pub use catalog::FieldCatalog;
pub use channel::{PushChannel, StatelessChannel};
pub use command::{Command, DispatchRoute};
pub use config::ControllerConfig;
pub use coordinator::Coordinator;
pub use error::CoreError;
pub use model::{DeviceKind, FieldValue, InstanceRecord};
pub use store::Snapshot;
