//! Session persistence and crash recovery

pub mod reconcile;
pub mod snapshot;

pub use reconcile::{reconcile, trust_snapshot, venue_view, Recovered};
pub use snapshot::{InstrumentSnapshot, SessionSnapshot, SnapshotError, SnapshotStore, SNAPSHOT_VERSION};
