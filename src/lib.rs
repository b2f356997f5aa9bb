//! Relearn - multi-turn learning coordination
//!
//! Drives an agent's task across repeated iterations and learns from each one:
//! - Checkpoints task state cheaply (compressed, differential, integrity-checked)
//! - Recognizes recurring failure modes and remembers their remediation
//! - Adapts the next iteration's instructions from what worked or failed

pub mod config;
pub mod coordinator;
pub mod events;
pub mod iteration;
pub mod model;
pub mod patterns;
pub mod preservation;
pub mod prompting;
pub mod store;

pub use config::LearningConfig;
pub use coordinator::{
    LearningResult, LearningSummary, LearningTask, MultiTurnLearningCoordinator, SessionOptions,
};
pub use events::{EventHub, EventKind, LearningEvent};
pub use iteration::{BudgetIterationManager, IterationLimits, IterationManager, IterationPermit};
pub use model::{
    ErrorCategory, ErrorPattern, LearningIteration, LearningSession, ModificationType,
    PromptModification, SessionStatus, SessionUpdate,
};
pub use patterns::{ErrorAnalysis, ErrorPatternRecognizer, IterationContext};
pub use preservation::{ContextPreservationEngine, RestoreOutcome, SnapshotReceipt};
pub use prompting::{AdaptivePromptEngineer, PromptAdaptation};
pub use store::{FileLearningStore, InMemoryLearningStore, LearningStore};

/// Result type for Relearn operations
pub type Result<T> = std::result::Result<T, RelearnError>;

/// Errors that can occur in Relearn
#[derive(Debug, thiserror::Error)]
pub enum RelearnError {
    #[error("Snapshot of {size} bytes exceeds limit of {limit} bytes")]
    SnapshotTooLarge { size: u64, limit: u64 },

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Broken diff chain: {0}")]
    BrokenDiffChain(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Iteration manager error: {0}")]
    IterationManager(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
