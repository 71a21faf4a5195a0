/// Per-replica state machine owning the splice between diff stream & snapshot, the apply
/// loop, and retirement on divergence.
pub mod replicator;

/// Process-wide `(venue, symbol) -> Book` mapping with its outdated-replica sweeper.
pub mod registry;

/// The snapshot use case: serves callers from a live replica when one exists, lazily starts
/// replication otherwise, and answers from the venue while a replica is warming up.
pub mod coordinator;

pub use coordinator::SnapshotCoordinator;
pub use registry::Registry;
pub use replicator::{ReplicaHandle, Replicator};
