// ── Snapshot store ──

mod snapshot;

pub use snapshot::Snapshot;
