//! In-process store, the default for tests and short-lived runs.

use super::LearningStore;
use crate::model::{ErrorCategory, ErrorPattern, LearningIteration, LearningSession, SessionUpdate};
use crate::{RelearnError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryLearningStore {
    sessions: RwLock<HashMap<String, LearningSession>>,
    iterations: RwLock<HashMap<String, Vec<LearningIteration>>>,
    patterns: RwLock<HashMap<String, ErrorPattern>>,
}

impl InMemoryLearningStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LearningStore for InMemoryLearningStore {
    async fn create_session(&self, session: &LearningSession) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn update_session(&self, session_id: &str, update: &SessionUpdate) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RelearnError::SessionNotFound(session_id.to_string()))?;
        update.apply_to(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<LearningSession>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn create_iteration(&self, iteration: &LearningIteration) -> Result<()> {
        let mut iterations = self.iterations.write().await;
        let list = iterations.entry(iteration.session_id.clone()).or_default();
        match list.iter_mut().find(|i| i.id == iteration.id) {
            Some(existing) => *existing = iteration.clone(),
            None => list.push(iteration.clone()),
        }
        list.sort_by_key(|i| i.iteration_number);
        Ok(())
    }

    async fn list_iterations(&self, session_id: &str) -> Result<Vec<LearningIteration>> {
        Ok(self
            .iterations
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_error_patterns(
        &self,
        category: Option<ErrorCategory>,
    ) -> Result<Vec<ErrorPattern>> {
        Ok(self
            .patterns
            .read()
            .await
            .values()
            .filter(|p| category.map_or(true, |c| p.category == c))
            .cloned()
            .collect())
    }

    async fn upsert_error_pattern(&self, pattern: &ErrorPattern) -> Result<()> {
        self.patterns
            .write()
            .await
            .insert(pattern.id.clone(), pattern.clone());
        Ok(())
    }
}
