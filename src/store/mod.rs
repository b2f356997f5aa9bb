//! Persistence of sessions, iterations and error patterns.
//!
//! The coordinator and the recognizer only see the `LearningStore` trait.
//! Every operation is safe to retry.

mod file;
mod memory;

pub use file::FileLearningStore;
pub use memory::InMemoryLearningStore;

use crate::model::{ErrorCategory, ErrorPattern, LearningIteration, LearningSession, SessionUpdate};
use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait LearningStore: Send + Sync {
    async fn create_session(&self, session: &LearningSession) -> Result<()>;

    /// Apply a partial update. Unknown sessions are an error.
    async fn update_session(&self, session_id: &str, update: &SessionUpdate) -> Result<()>;

    async fn get_session(&self, session_id: &str) -> Result<Option<LearningSession>>;

    /// Store an iteration. Re-storing the same iteration id replaces it.
    async fn create_iteration(&self, iteration: &LearningIteration) -> Result<()>;

    /// Iterations of a session in iteration-number order
    async fn list_iterations(&self, session_id: &str) -> Result<Vec<LearningIteration>>;

    async fn get_error_patterns(&self, category: Option<ErrorCategory>)
        -> Result<Vec<ErrorPattern>>;

    async fn upsert_error_pattern(&self, pattern: &ErrorPattern) -> Result<()>;
}
