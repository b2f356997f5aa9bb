//! Iteration Manager: decides whether a session may run another iteration
//! and hands out iteration numbers.
//!
//! The coordinator consumes the `IterationManager` contract and re-broadcasts
//! whatever notices the manager queues. `BudgetIterationManager` is the
//! default implementation: a fixed iteration budget plus a cumulative
//! resource warning.

use crate::config::BudgetConfig;
use crate::events::EventKind;
use crate::model::LearningIteration;
use crate::{RelearnError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Per-session limits handed over at initialization
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationLimits {
    pub max_iterations: u32,
}

/// Answer to "may another iteration start?"
#[derive(Debug, Clone, PartialEq)]
pub struct IterationPermit {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl IterationPermit {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait IterationManager: Send + Sync {
    async fn initialize_session(&self, session_id: &str, limits: IterationLimits) -> Result<()>;

    async fn can_start_iteration(&self, session_id: &str) -> Result<IterationPermit>;

    /// Next iteration number: 1-based, strictly increasing per session
    async fn start_iteration(&self, session_id: &str) -> Result<u32>;

    async fn complete_iteration(&self, session_id: &str, iteration: &LearningIteration)
        -> Result<()>;

    async fn cleanup(&self, session_id: &str);

    /// Notices queued for a session since the last drain, oldest first
    fn drain_notices(&self, _session_id: &str) -> Vec<EventKind> {
        Vec::new()
    }
}

#[derive(Debug, Default)]
struct SessionBudget {
    max_iterations: u32,
    started: u32,
    completed: u32,
    in_progress: bool,
    resource_usage_mb: f64,
    warned: bool,
    notices: Vec<EventKind>,
}

/// Iteration budget shared by every session of a coordinator
#[derive(Debug)]
pub struct BudgetIterationManager {
    config: BudgetConfig,
    sessions: Mutex<HashMap<String, SessionBudget>>,
}

impl BudgetIterationManager {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` against a session's budget
    fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionBudget) -> Result<T>,
    ) -> Result<T> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| RelearnError::IterationManager("budget table poisoned".into()))?;
        let budget = sessions.get_mut(session_id).ok_or_else(|| {
            RelearnError::IterationManager(format!("session {} is not initialized", session_id))
        })?;
        f(budget)
    }
}

#[async_trait]
impl IterationManager for BudgetIterationManager {
    async fn initialize_session(&self, session_id: &str, limits: IterationLimits) -> Result<()> {
        // The session's own limit applies, but never beyond the global budget.
        let max_iterations = limits.max_iterations.min(self.config.max_iterations);
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| RelearnError::IterationManager("budget table poisoned".into()))?;
        sessions.insert(
            session_id.to_string(),
            SessionBudget {
                max_iterations,
                ..Default::default()
            },
        );
        debug!("Session {} budget: {} iteration(s)", session_id, max_iterations);
        Ok(())
    }

    async fn can_start_iteration(&self, session_id: &str) -> Result<IterationPermit> {
        self.with_session(session_id, |budget| {
            if budget.in_progress {
                return Ok(IterationPermit::deny(format!(
                    "Iteration {} is still in progress",
                    budget.started
                )));
            }
            if budget.started >= budget.max_iterations {
                return Ok(IterationPermit::deny(format!(
                    "Maximum iterations ({}) reached",
                    budget.max_iterations
                )));
            }
            Ok(IterationPermit::allow())
        })
    }

    async fn start_iteration(&self, session_id: &str) -> Result<u32> {
        self.with_session(session_id, |budget| {
            if budget.in_progress {
                return Err(RelearnError::IterationManager(format!(
                    "iteration {} of session {} has not completed",
                    budget.started, session_id
                )));
            }
            if budget.started >= budget.max_iterations {
                return Err(RelearnError::IterationManager(format!(
                    "session {} exhausted its budget of {}",
                    session_id, budget.max_iterations
                )));
            }
            budget.started += 1;
            budget.in_progress = true;
            budget.notices.push(EventKind::IterationStarted {
                iteration_number: budget.started,
            });
            Ok(budget.started)
        })
    }

    async fn complete_iteration(
        &self,
        session_id: &str,
        iteration: &LearningIteration,
    ) -> Result<()> {
        let warning_mb = self.config.resource_warning_mb;
        self.with_session(session_id, |budget| {
            if !budget.in_progress || iteration.iteration_number != budget.started {
                return Err(RelearnError::IterationManager(format!(
                    "iteration {} of session {} was never started",
                    iteration.iteration_number, session_id
                )));
            }
            budget.in_progress = false;
            budget.completed += 1;
            budget.resource_usage_mb += iteration.resource_usage_mb;
            budget.notices.push(EventKind::IterationCompleted {
                iteration_number: iteration.iteration_number,
                quality_score: iteration.quality_score,
                improvement: iteration.improvement,
                error_detected: iteration.error_detected,
            });

            if !budget.warned && budget.resource_usage_mb > warning_mb {
                budget.warned = true;
                warn!(
                    "Session {} used {:.2}MB, above the {:.2}MB warning level",
                    session_id, budget.resource_usage_mb, warning_mb
                );
                budget.notices.push(EventKind::ResourceWarning {
                    message: format!(
                        "Cumulative state size {:.2}MB exceeds {:.2}MB",
                        budget.resource_usage_mb, warning_mb
                    ),
                    usage_mb: budget.resource_usage_mb,
                });
            }
            Ok(())
        })
    }

    async fn cleanup(&self, session_id: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if let Some(budget) = sessions.remove(session_id) {
                info!(
                    "Released budget for session {} ({} of {} iterations used)",
                    session_id, budget.completed, budget.max_iterations
                );
            }
        }
    }

    fn drain_notices(&self, session_id: &str) -> Vec<EventKind> {
        self.with_session(session_id, |budget| Ok(std::mem::take(&mut budget.notices)))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn iteration(number: u32, usage_mb: f64) -> LearningIteration {
        let now = Utc::now();
        LearningIteration {
            id: format!("it-{}", number),
            session_id: "s1".into(),
            iteration_number: number,
            start_time: now,
            end_time: now,
            duration_ms: 1,
            snapshot_id: "snap".into(),
            error_detected: false,
            error_category: None,
            error_message: None,
            quality_score: 0.5,
            improvement: 0.0,
            resource_usage_mb: usage_mb,
            prompt_modifications: Vec::new(),
        }
    }

    async fn manager(max: u32) -> BudgetIterationManager {
        let manager = BudgetIterationManager::new(BudgetConfig {
            max_iterations: 10,
            resource_warning_mb: 1.0,
        });
        manager
            .initialize_session("s1", IterationLimits { max_iterations: max })
            .await
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn test_numbers_are_contiguous_until_budget() {
        let manager = manager(3).await;
        let mut numbers = Vec::new();
        while manager.can_start_iteration("s1").await.unwrap().allowed {
            let n = manager.start_iteration("s1").await.unwrap();
            manager.complete_iteration("s1", &iteration(n, 0.0)).await.unwrap();
            numbers.push(n);
        }
        assert_eq!(numbers, vec![1, 2, 3]);

        let permit = manager.can_start_iteration("s1").await.unwrap();
        assert_eq!(permit.reason.as_deref(), Some("Maximum iterations (3) reached"));
    }

    #[tokio::test]
    async fn test_no_overlapping_iterations() {
        let manager = manager(3).await;
        manager.start_iteration("s1").await.unwrap();
        assert!(!manager.can_start_iteration("s1").await.unwrap().allowed);
        assert!(manager.start_iteration("s1").await.is_err());
    }

    #[tokio::test]
    async fn test_global_budget_caps_session_limit() {
        let manager = BudgetIterationManager::new(BudgetConfig {
            max_iterations: 2,
            resource_warning_mb: 100.0,
        });
        manager
            .initialize_session("s1", IterationLimits { max_iterations: 50 })
            .await
            .unwrap();
        for _ in 0..2 {
            let n = manager.start_iteration("s1").await.unwrap();
            manager.complete_iteration("s1", &iteration(n, 0.0)).await.unwrap();
        }
        assert!(!manager.can_start_iteration("s1").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_notices_and_resource_warning() {
        let manager = manager(5).await;
        let n = manager.start_iteration("s1").await.unwrap();
        manager.complete_iteration("s1", &iteration(n, 0.6)).await.unwrap();
        let n = manager.start_iteration("s1").await.unwrap();
        manager.complete_iteration("s1", &iteration(n, 0.6)).await.unwrap();

        let notices = manager.drain_notices("s1");
        let types: Vec<&str> = notices.iter().map(|n| n.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "iteration-started",
                "iteration-completed",
                "iteration-started",
                "iteration-completed",
                "resource-warning"
            ]
        );
        assert!(manager.drain_notices("s1").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session_and_cleanup() {
        let manager = manager(2).await;
        assert!(manager.can_start_iteration("other").await.is_err());

        manager.cleanup("s1").await;
        assert!(manager.start_iteration("s1").await.is_err());
        assert!(manager.drain_notices("s1").is_empty());
    }
}
