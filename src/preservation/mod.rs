//! Context preservation: cheap, verifiable checkpoints of opaque task state.

pub mod codec;
pub mod diff;
mod engine;

pub use diff::{apply_diff, compute_diff, DiffEntry, StateDiff};
pub use engine::{
    CacheStats, ContextPreservationEngine, RestoreOutcome, SnapshotMetadata, SnapshotReceipt,
};
