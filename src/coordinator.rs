//! Multi-Turn Learning Coordinator
//!
//! Runs one task through repeated iterations: checkpoint, execute, evaluate,
//! classify failures, adapt the prompt, and stop once quality converges or
//! the iteration budget runs out.

use crate::config::{LearningConfig, SessionDefaults};
use crate::events::{EventHub, EventKind, LearningEvent};
use crate::iteration::{IterationLimits, IterationManager};
use crate::model::{
    LearningIteration, LearningSession, PromptModification, SessionSettings, SessionStatus,
    SessionUpdate,
};
use crate::patterns::{ErrorPatternRecognizer, IterationContext};
use crate::preservation::{codec, ContextPreservationEngine};
use crate::prompting::AdaptivePromptEngineer;
use crate::store::LearningStore;
use anyhow::Context as _;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Quality multiplier applied when an iteration fails
const ERROR_PENALTY: f64 = 0.9;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub type Executor =
    Box<dyn Fn(Value, u32) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
pub type Evaluator = Box<dyn Fn(&Value) -> f64 + Send + Sync>;

/// A unit of work: initial state, how to advance it, and how to score it
pub struct LearningTask {
    pub task_id: String,
    pub agent_id: String,
    pub initial_state: Value,
    /// `(state, iteration_number) -> new state`; may fail
    pub executor: Executor,
    /// `state -> quality` in `[0, 1]`
    pub evaluator: Evaluator,
}

impl LearningTask {
    pub fn new<E, Fut, Q>(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        initial_state: Value,
        executor: E,
        evaluator: Q,
    ) -> Self
    where
        E: Fn(Value, u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
        Q: Fn(&Value) -> f64 + Send + Sync + 'static,
    {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            initial_state,
            executor: Box::new(move |state, n| executor(state, n).boxed()),
            evaluator: Box::new(evaluator),
        }
    }
}

/// Per-session overrides of the `[session]` defaults
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOptions {
    pub quality_threshold: Option<f64>,
    pub min_iterations: Option<u32>,
    pub max_iterations: Option<u32>,
    pub enable_error_recognition: Option<bool>,
    pub enable_adaptive_prompting: Option<bool>,
}

impl SessionOptions {
    pub fn resolve(&self, defaults: &SessionDefaults) -> SessionSettings {
        SessionSettings {
            quality_threshold: self.quality_threshold.unwrap_or(defaults.quality_threshold),
            min_iterations: self.min_iterations.unwrap_or(defaults.min_iterations),
            max_iterations: self.max_iterations.unwrap_or(defaults.max_iterations),
            enable_error_recognition: self
                .enable_error_recognition
                .unwrap_or(defaults.enable_error_recognition),
            enable_adaptive_prompting: self
                .enable_adaptive_prompting
                .unwrap_or(defaults.enable_adaptive_prompting),
        }
    }
}

/// End-of-session digest
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningSummary {
    pub session_id: String,
    pub task_id: String,
    pub initial_quality: f64,
    pub final_quality: f64,
    pub improvement_rate: f64,
    pub iterations: u32,
    pub total_duration_ms: u64,
    pub distinct_error_patterns: usize,
    pub key_insights: Vec<String>,
}

impl LearningSummary {
    fn build(session: &LearningSession, initial_quality: f64) -> Self {
        let improvement_rate = improvement_rate(initial_quality, session.quality_score);
        let end = session.end_time.unwrap_or_else(Utc::now);
        let total_duration_ms = (end - session.start_time).num_milliseconds().max(0) as u64;

        let mut key_insights = vec![format!(
            "Quality moved from {:.1}% to {:.1}% over {} iteration(s)",
            initial_quality * 100.0,
            session.quality_score * 100.0,
            session.iteration_count
        )];
        key_insights.push(format!(
            "Encountered {} distinct error pattern(s)",
            session.error_patterns.len()
        ));
        if improvement_rate > 0.5 {
            key_insights.push("Strong improvement: quality rose by more than half".to_string());
        } else if improvement_rate < 0.0 {
            key_insights.push("Quality declined; review the executor or the evaluator".to_string());
        }

        Self {
            session_id: session.id.clone(),
            task_id: session.task_id.clone(),
            initial_quality,
            final_quality: session.quality_score,
            improvement_rate,
            iterations: session.iteration_count,
            total_duration_ms,
            distinct_error_patterns: session.error_patterns.len(),
            key_insights,
        }
    }

    pub fn describe(&self) -> String {
        self.key_insights.join("; ")
    }
}

/// Outcome of `start_session`; in-loop failures never surface as `Err`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningResult {
    pub session_id: String,
    /// True exactly when the session ended COMPLETED
    pub success: bool,
    pub status: SessionStatus,
    pub final_quality: f64,
    pub iterations_completed: u32,
    /// `(final - initial) / initial`, 0 when the initial quality is 0
    pub improvement_rate: f64,
    pub threshold_met: bool,
    pub termination_reason: Option<String>,
    pub summary: LearningSummary,
    pub final_state: Option<Value>,
    pub error: Option<String>,
}

enum Termination {
    ThresholdMet,
    Refused(String),
}

impl Termination {
    fn reason(&self) -> String {
        match self {
            Self::ThresholdMet => "Quality threshold met".to_string(),
            Self::Refused(reason) => reason.clone(),
        }
    }
}

pub struct MultiTurnLearningCoordinator {
    config: LearningConfig,
    store: Arc<dyn LearningStore>,
    iteration_manager: Arc<dyn IterationManager>,
    preservation: ContextPreservationEngine,
    recognizer: ErrorPatternRecognizer,
    prompt_engineer: Mutex<AdaptivePromptEngineer>,
    events: EventHub,
    active: RwLock<HashSet<String>>,
}

impl MultiTurnLearningCoordinator {
    pub fn new(
        config: LearningConfig,
        store: Arc<dyn LearningStore>,
        iteration_manager: Arc<dyn IterationManager>,
    ) -> Self {
        let preservation = ContextPreservationEngine::new(config.preservation.clone());
        let recognizer = ErrorPatternRecognizer::new(config.patterns.clone(), store.clone());
        let prompt_engineer = Mutex::new(AdaptivePromptEngineer::new(config.prompting.clone()));
        Self {
            config,
            store,
            iteration_manager,
            preservation,
            recognizer,
            prompt_engineer,
            events: EventHub::new(),
            active: RwLock::new(HashSet::new()),
        }
    }

    /// Load known error patterns. Returns how many were loaded.
    pub async fn initialize(&self) -> usize {
        self.recognizer.initialize().await
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    pub fn subscribe(&self) -> async_channel::Receiver<LearningEvent> {
        self.events.subscribe()
    }

    pub fn recognizer(&self) -> &ErrorPatternRecognizer {
        &self.recognizer
    }

    pub fn preservation(&self) -> &ContextPreservationEngine {
        &self.preservation
    }

    pub async fn get_session(&self, session_id: &str) -> crate::Result<Option<LearningSession>> {
        self.store.get_session(session_id).await
    }

    /// Ids of sessions currently running, sorted
    pub async fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.read().await.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Run a task to completion.
    ///
    /// Always resolves to a `LearningResult`; `success` tells whether the
    /// session completed and `error` carries the reason when it failed.
    pub async fn start_session(&self, task: LearningTask, options: SessionOptions) -> LearningResult {
        let settings = options.resolve(&self.config.session);
        let evaluated = evaluate(&task.evaluator, &task.initial_state);
        let (initial_quality, evaluation_error) = match evaluated {
            Ok(quality) => (quality, None),
            Err(e) => (0.0, Some(e.context("Initial evaluation failed"))),
        };
        let mut session = LearningSession::new(
            Uuid::new_v4().to_string(),
            task.task_id.clone(),
            task.agent_id.clone(),
            settings,
            initial_quality,
        );
        let session_id = session.id.clone();
        self.active.write().await.insert(session_id.clone());
        info!(
            "Starting session {} for task {} (agent {}, threshold {:.2}, max {} iterations)",
            session_id,
            task.task_id,
            task.agent_id,
            session.settings.quality_threshold,
            session.settings.max_iterations
        );

        let outcome = match evaluation_error {
            Some(e) => Err(e),
            None => self.run_session(&task, &mut session).await,
        };
        let result = match outcome {
            Ok((termination, final_state)) => {
                self.complete_session(&mut session, initial_quality, termination, final_state)
                    .await
            }
            Err(e) => self.fail_session(&mut session, initial_quality, e).await,
        };

        self.cleanup(&session_id).await;
        result
    }

    async fn run_session(
        &self,
        task: &LearningTask,
        session: &mut LearningSession,
    ) -> anyhow::Result<(Termination, Value)> {
        let session_id = session.id.clone();
        self.store
            .create_session(session)
            .await
            .context("Failed to persist session")?;
        self.events.emit(
            &session_id,
            EventKind::SessionStarted {
                task_id: task.task_id.clone(),
                agent_id: task.agent_id.clone(),
            },
        );

        self.iteration_manager
            .initialize_session(
                &session_id,
                IterationLimits {
                    max_iterations: session.settings.max_iterations,
                },
            )
            .await?;

        let mut current_state = task.initial_state.clone();
        let mut last_snapshot = self
            .preservation
            .create_snapshot(&session_id, 0, &current_state, None)
            .await
            .context("Initial checkpoint failed")?
            .snapshot_id;

        session.status = SessionStatus::Active;
        self.store
            .update_session(&session_id, &SessionUpdate::status(SessionStatus::Active))
            .await?;

        let prompt_key = self.config.session.prompt_key.as_str();
        let base_prompt = if session.settings.enable_adaptive_prompting {
            task.initial_state
                .get(prompt_key)
                .and_then(Value::as_str)
                .map(str::to_string)
        } else {
            None
        };

        let mut previous_quality = session.quality_score;

        loop {
            let permit = self.iteration_manager.can_start_iteration(&session_id).await?;
            if !permit.allowed {
                let reason = permit
                    .reason
                    .unwrap_or_else(|| "Iteration budget exhausted".to_string());
                info!("Session {} stopping: {}", session_id, reason);
                return Ok((Termination::Refused(reason), current_state));
            }

            let iteration_number = self.iteration_manager.start_iteration(&session_id).await?;
            self.forward_notices(&session_id);

            let mut input = current_state.clone();
            let mut prompt_modifications: Vec<PromptModification> = Vec::new();
            if let Some(base) = &base_prompt {
                let adaptation = self
                    .prompt_engineer
                    .lock()
                    .await
                    .modify_prompt(&session_id, base, iteration_number);
                if !adaptation.modifications.is_empty() {
                    self.events.emit(
                        &session_id,
                        EventKind::PromptModified {
                            iteration_number,
                            modifications: adaptation
                                .modifications
                                .iter()
                                .map(|m| m.modification_type)
                                .collect(),
                        },
                    );
                }
                if let Value::Object(map) = &mut input {
                    map.insert(prompt_key.to_string(), Value::String(adaptation.modified_prompt));
                }
                prompt_modifications = adaptation.modifications;
            }

            let start_time = Utc::now();
            let started = Instant::now();
            let mut error_category = None;
            let mut error_message = None;

            let quality = match execute(&task.executor, input, iteration_number).await {
                Ok(new_state) => {
                    let quality = evaluate(&task.evaluator, &new_state)?;
                    current_state = new_state;
                    quality
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(
                        "Session {} iteration {} failed: {}",
                        session_id, iteration_number, message
                    );
                    self.events.emit(
                        &session_id,
                        EventKind::ErrorDetected {
                            iteration_number,
                            message: message.clone(),
                        },
                    );

                    if session.settings.enable_error_recognition {
                        let context = IterationContext {
                            session_id: session_id.clone(),
                            iteration_number,
                            task_id: Some(task.task_id.clone()),
                        };
                        let causes = error_causes(&e);
                        let analysis = self
                            .recognizer
                            .analyze_error(&context, &message, causes.as_deref())
                            .await;
                        if let Some(pattern_id) = &analysis.pattern_id {
                            session.error_patterns.insert(pattern_id.clone());
                            self.events.emit(
                                &session_id,
                                EventKind::PatternRecognized {
                                    pattern_id: pattern_id.clone(),
                                    category: analysis.category,
                                    is_known_pattern: analysis.is_known_pattern,
                                    confidence: analysis.confidence,
                                },
                            );
                        }
                        error_category = Some(analysis.category);
                    }
                    error_message = Some(message);
                    previous_quality * ERROR_PENALTY
                }
            };

            let usage_bytes = match self
                .preservation
                .create_snapshot(&session_id, iteration_number, &current_state, Some(&last_snapshot))
                .await
            {
                Ok(receipt) => {
                    last_snapshot = receipt.snapshot_id;
                    receipt.original_size
                }
                Err(e) => {
                    warn!(
                        "Checkpoint for session {} iteration {} failed, keeping {}: {}",
                        session_id, iteration_number, last_snapshot, e
                    );
                    codec::encode_state(&current_state)
                        .map(|encoded| encoded.len() as u64)
                        .unwrap_or(0)
                }
            };

            let iteration = LearningIteration {
                id: Uuid::new_v4().to_string(),
                session_id: session_id.clone(),
                iteration_number,
                start_time,
                end_time: Utc::now(),
                duration_ms: started.elapsed().as_millis() as u64,
                snapshot_id: last_snapshot.clone(),
                error_detected: error_message.is_some(),
                error_category,
                error_message,
                quality_score: quality,
                improvement: quality - previous_quality,
                resource_usage_mb: usage_bytes as f64 / BYTES_PER_MB,
                prompt_modifications,
            };
            self.store.create_iteration(&iteration).await?;
            self.iteration_manager
                .complete_iteration(&session_id, &iteration)
                .await?;
            self.forward_notices(&session_id);
            self.prompt_engineer.lock().await.record_iteration(&iteration);

            session.record_quality(quality);
            self.store
                .update_session(&session_id, &SessionUpdate::progress(session))
                .await?;
            debug!(
                "Session {} iteration {}: quality {:.3} ({:+.3})",
                session_id, iteration_number, quality, iteration.improvement
            );
            previous_quality = quality;

            let threshold = session.settings.quality_threshold;
            if quality >= threshold && session.iteration_count >= session.settings.min_iterations {
                self.events.emit(
                    &session_id,
                    EventKind::QualityThresholdMet {
                        quality_score: quality,
                        threshold,
                    },
                );
                return Ok((Termination::ThresholdMet, current_state));
            }
        }
    }

    async fn complete_session(
        &self,
        session: &mut LearningSession,
        initial_quality: f64,
        termination: Termination,
        final_state: Value,
    ) -> LearningResult {
        let reason = termination.reason();
        session.status = SessionStatus::Completed;
        session.end_time = Some(Utc::now());
        let summary = LearningSummary::build(session, initial_quality);

        let update = SessionUpdate {
            status: Some(SessionStatus::Completed),
            end_time: session.end_time,
            final_result: Some(final_state.clone()),
            summary: Some(summary.describe()),
            ..SessionUpdate::progress(session)
        };
        if let Err(e) = self.store.update_session(&session.id, &update).await {
            warn!("Failed to persist completion of session {}: {}", session.id, e);
        }

        self.events.emit(
            &session.id,
            EventKind::SessionCompleted {
                reason: reason.clone(),
                final_quality: session.quality_score,
                iterations: session.iteration_count,
            },
        );
        info!(
            "Session {} completed after {} iteration(s): {} (quality {:.3})",
            session.id, session.iteration_count, reason, session.quality_score
        );

        LearningResult {
            session_id: session.id.clone(),
            success: true,
            status: SessionStatus::Completed,
            final_quality: session.quality_score,
            iterations_completed: session.iteration_count,
            improvement_rate: summary.improvement_rate,
            threshold_met: matches!(termination, Termination::ThresholdMet),
            termination_reason: Some(reason),
            summary,
            final_state: Some(final_state),
            error: None,
        }
    }

    async fn fail_session(
        &self,
        session: &mut LearningSession,
        initial_quality: f64,
        err: anyhow::Error,
    ) -> LearningResult {
        let message = format!("{:#}", err);
        error!("Session {} failed: {}", session.id, message);
        session.status = SessionStatus::Failed;
        session.end_time = Some(Utc::now());
        let summary = LearningSummary::build(session, initial_quality);

        let update = SessionUpdate {
            status: Some(SessionStatus::Failed),
            end_time: session.end_time,
            summary: Some(summary.describe()),
            ..Default::default()
        };
        if let Err(e) = self.store.update_session(&session.id, &update).await {
            warn!("Failed to persist failure of session {}: {}", session.id, e);
        }
        self.events.emit(
            &session.id,
            EventKind::SessionFailed {
                error: message.clone(),
            },
        );

        LearningResult {
            session_id: session.id.clone(),
            success: false,
            status: SessionStatus::Failed,
            final_quality: session.quality_score,
            iterations_completed: session.iteration_count,
            improvement_rate: summary.improvement_rate,
            threshold_met: false,
            termination_reason: None,
            summary,
            final_state: None,
            error: Some(message),
        }
    }

    async fn cleanup(&self, session_id: &str) {
        self.forward_notices(session_id);
        self.iteration_manager.cleanup(session_id).await;
        let evicted = self.preservation.clear_session(session_id).await;
        self.prompt_engineer.lock().await.clear_session(session_id);
        self.active.write().await.remove(session_id);
        debug!("Cleaned up session {} ({} snapshot(s) evicted)", session_id, evicted);
    }

    fn forward_notices(&self, session_id: &str) {
        for kind in self.iteration_manager.drain_notices(session_id) {
            self.events.emit(session_id, kind);
        }
    }
}

fn improvement_rate(initial: f64, final_quality: f64) -> f64 {
    if initial == 0.0 {
        0.0
    } else {
        (final_quality - initial) / initial
    }
}

/// Run the executor, turning a panic into an ordinary executor failure
async fn execute(
    executor: &Executor,
    state: Value,
    iteration_number: u32,
) -> anyhow::Result<Value> {
    let future = panic::catch_unwind(AssertUnwindSafe(|| executor(state, iteration_number)))
        .map_err(|payload| anyhow::anyhow!("Executor panicked: {}", panic_message(&*payload)))?;
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(anyhow::anyhow!("Executor panicked: {}", panic_message(&*payload)))
        })
}

fn evaluate(evaluator: &Evaluator, state: &Value) -> anyhow::Result<f64> {
    panic::catch_unwind(AssertUnwindSafe(|| evaluator(state)))
        .map_err(|payload| anyhow::anyhow!("Evaluator panicked: {}", panic_message(&*payload)))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The error's cause chain, one cause per line, used as its stack text
fn error_causes(err: &anyhow::Error) -> Option<String> {
    let causes: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
    (!causes.is_empty()).then(|| causes.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iteration::BudgetIterationManager;
    use crate::store::InMemoryLearningStore;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn coordinator(config: LearningConfig) -> (MultiTurnLearningCoordinator, Arc<InMemoryLearningStore>) {
        let store = Arc::new(InMemoryLearningStore::new());
        let manager = Arc::new(BudgetIterationManager::new(config.budget.clone()));
        (
            MultiTurnLearningCoordinator::new(config, store.clone(), manager),
            store,
        )
    }

    /// Each iteration adds one step; quality is steps / 5
    fn stepping_task() -> LearningTask {
        LearningTask::new(
            "count",
            "agent",
            json!({"steps": 0}),
            |state: Value, _n: u32| async move {
                let steps = state["steps"].as_u64().unwrap_or(0);
                Ok::<_, anyhow::Error>(json!({"steps": steps + 1}))
            },
            |state: &Value| state["steps"].as_u64().unwrap_or(0) as f64 / 5.0,
        )
    }

    fn failing_task(initial_quality: f64) -> LearningTask {
        LearningTask::new(
            "fail",
            "agent",
            json!({"q": initial_quality}),
            |_state: Value, _n: u32| async move {
                Err::<Value, _>(anyhow::anyhow!("Cannot read property 'x' of undefined"))
            },
            |state: &Value| state["q"].as_f64().unwrap_or(0.0),
        )
    }

    #[tokio::test]
    async fn test_threshold_met_at_fourth_iteration() {
        let (coordinator, store) = coordinator(LearningConfig::default());
        let result = coordinator
            .start_session(stepping_task(), SessionOptions::default())
            .await;

        assert!(result.success);
        assert!(result.threshold_met);
        assert_eq!(result.status, SessionStatus::Completed);
        assert_eq!(result.iterations_completed, 4);
        assert_eq!(result.termination_reason.as_deref(), Some("Quality threshold met"));
        assert_eq!(result.final_state, Some(json!({"steps": 4})));
        // Initial quality 0 means no rate can be computed.
        assert_eq!(result.improvement_rate, 0.0);

        let session = store.get_session(&result.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.improvement_trajectory.len(), 4);
        assert!(session.end_time.is_some());
        assert!(coordinator.active_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_budget_exhaustion_completes() {
        let (coordinator, _) = coordinator(LearningConfig::default());
        let options = SessionOptions {
            quality_threshold: Some(0.99),
            max_iterations: Some(3),
            ..Default::default()
        };
        let result = coordinator.start_session(stepping_task(), options).await;

        assert!(result.success);
        assert!(!result.threshold_met);
        assert_eq!(result.iterations_completed, 3);
        assert_eq!(
            result.termination_reason.as_deref(),
            Some("Maximum iterations (3) reached")
        );
    }

    #[tokio::test]
    async fn test_error_penalty_compounds() {
        let (coordinator, store) = coordinator(LearningConfig::default());
        let options = SessionOptions {
            max_iterations: Some(3),
            ..Default::default()
        };
        let result = coordinator.start_session(failing_task(0.5), options).await;

        assert!(result.success);
        let session = store.get_session(&result.session_id).await.unwrap().unwrap();
        let expected = [0.45, 0.405, 0.3645];
        for (actual, expected) in session.improvement_trajectory.iter().zip(expected) {
            assert!((actual - expected).abs() < 1e-9, "{} vs {}", actual, expected);
        }
        // Same fingerprint every time: one distinct pattern.
        assert_eq!(session.error_patterns.len(), 1);
        assert_eq!(result.final_state, Some(json!({"q": 0.5})));

        let iterations = store.list_iterations(&result.session_id).await.unwrap();
        assert!(iterations.iter().all(|i| i.error_detected));
        assert!(iterations.iter().all(|i| i.improvement < 0.0));
    }

    #[tokio::test]
    async fn test_error_penalty_from_zero_stays_zero() {
        let (coordinator, store) = coordinator(LearningConfig::default());
        let options = SessionOptions {
            max_iterations: Some(2),
            enable_error_recognition: Some(false),
            ..Default::default()
        };
        let result = coordinator.start_session(failing_task(0.0), options).await;

        assert_eq!(result.final_quality, 0.0);
        let iterations = store.list_iterations(&result.session_id).await.unwrap();
        assert!(iterations.iter().all(|i| i.error_category.is_none()));
        let session = store.get_session(&result.session_id).await.unwrap().unwrap();
        assert!(session.error_patterns.is_empty());
    }

    #[tokio::test]
    async fn test_iteration_numbers_are_monotonic() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let recorder = seen.clone();
        let task = LearningTask::new(
            "seq",
            "agent",
            json!({}),
            move |state: Value, n: u32| {
                recorder.lock().unwrap().push(n);
                async move { Ok::<_, anyhow::Error>(state) }
            },
            |_: &Value| 0.1,
        );
        let (coordinator, store) = coordinator(LearningConfig::default());
        let options = SessionOptions {
            max_iterations: Some(4),
            ..Default::default()
        };
        let result = coordinator.start_session(task, options).await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
        let numbers: Vec<u32> = store
            .list_iterations(&result.session_id)
            .await
            .unwrap()
            .iter()
            .map(|i| i.iteration_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_initial_checkpoint_failure_fails_session() {
        let mut config = LearningConfig::default();
        config.preservation.max_snapshot_size_mb = 0;
        let (coordinator, store) = coordinator(config);
        let result = coordinator
            .start_session(stepping_task(), SessionOptions::default())
            .await;

        assert!(!result.success);
        assert_eq!(result.status, SessionStatus::Failed);
        assert_eq!(result.iterations_completed, 0);
        assert!(result.error.unwrap().contains("Initial checkpoint failed"));

        let session = store.get_session(&result.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(coordinator.preservation().cache_stats().await.total_snapshots == 0);
    }

    #[tokio::test]
    async fn test_oversized_checkpoint_keeps_last_good_snapshot() {
        let mut config = LearningConfig::default();
        config.preservation.max_snapshot_size_mb = 1;
        let (coordinator, store) = coordinator(config);
        let task = LearningTask::new(
            "grow",
            "agent",
            json!({"blob": ""}),
            |_state: Value, n: u32| async move {
                let size = if n == 2 { 2 * 1024 * 1024 } else { 16 };
                Ok::<_, anyhow::Error>(json!({"blob": "x".repeat(size), "n": n}))
            },
            |_: &Value| 0.1,
        );
        let options = SessionOptions {
            max_iterations: Some(3),
            ..Default::default()
        };
        let result = coordinator.start_session(task, options).await;

        assert!(result.success);
        assert_eq!(result.iterations_completed, 3);
        let iterations = store.list_iterations(&result.session_id).await.unwrap();
        assert_eq!(iterations.len(), 3);
        assert_eq!(iterations[1].snapshot_id, iterations[0].snapshot_id);
        assert_ne!(iterations[2].snapshot_id, iterations[1].snapshot_id);
        assert!(iterations[0].resource_usage_mb > 0.0);
        assert!(iterations[1].resource_usage_mb > 2.0);
        assert!(iterations.iter().all(|i| !i.error_detected));
    }

    #[tokio::test]
    async fn test_executor_panic_is_an_iteration_failure() {
        let (coordinator, store) = coordinator(LearningConfig::default());
        let task = LearningTask::new(
            "panics",
            "agent",
            json!({"q": 0.5}),
            |_state: Value, n: u32| async move {
                if n > 0 {
                    panic!("executor bug");
                }
                Ok::<_, anyhow::Error>(json!({}))
            },
            |state: &Value| state["q"].as_f64().unwrap_or(0.0),
        );
        let options = SessionOptions {
            max_iterations: Some(2),
            ..Default::default()
        };
        let result = coordinator.start_session(task, options).await;

        assert!(result.success);
        assert_eq!(result.iterations_completed, 2);
        let iterations = store.list_iterations(&result.session_id).await.unwrap();
        assert!(iterations.iter().all(|i| i.error_detected));
        assert!(iterations[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("executor bug"));
        assert!(coordinator.active_sessions().await.is_empty());
        assert_eq!(coordinator.preservation().cache_stats().await.total_snapshots, 0);
    }

    #[tokio::test]
    async fn test_evaluator_panic_fails_session_and_cleans_up() {
        let (coordinator, store) = coordinator(LearningConfig::default());
        let events = coordinator.subscribe();
        let task = LearningTask::new(
            "bad-evaluator",
            "agent",
            json!({"done": false}),
            |_state: Value, _n: u32| async move { Ok::<_, anyhow::Error>(json!({"done": true})) },
            |state: &Value| {
                if state["done"] == json!(true) {
                    panic!("evaluator bug");
                }
                0.2
            },
        );
        let result = coordinator.start_session(task, SessionOptions::default()).await;

        assert!(!result.success);
        assert_eq!(result.status, SessionStatus::Failed);
        assert!(result.error.unwrap().contains("Evaluator panicked: evaluator bug"));
        assert!(coordinator.active_sessions().await.is_empty());
        assert_eq!(coordinator.preservation().cache_stats().await.total_snapshots, 0);

        let session = store.get_session(&result.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event.event_type());
        }
        assert_eq!(last, Some("session-failed"));
    }

    #[tokio::test]
    async fn test_event_sequence() {
        let (coordinator, _) = coordinator(LearningConfig::default());
        let events = coordinator.subscribe();
        let options = SessionOptions {
            max_iterations: Some(1),
            ..Default::default()
        };
        coordinator.start_session(failing_task(0.5), options).await;

        let mut types = Vec::new();
        while let Ok(event) = events.try_recv() {
            types.push(event.event_type());
        }
        assert_eq!(
            types,
            vec![
                "session-started",
                "iteration-started",
                "error-detected",
                "pattern-recognized",
                "iteration-completed",
                "session-completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_prompt_adapts_after_repeated_errors() {
        let prompts = Arc::new(StdMutex::new(Vec::new()));
        let recorder = prompts.clone();
        let task = LearningTask::new(
            "prompted",
            "agent",
            json!({"prompt": "Sum the numbers", "done": false}),
            move |state: Value, n: u32| {
                recorder
                    .lock()
                    .unwrap()
                    .push(state["prompt"].as_str().unwrap_or_default().to_string());
                async move {
                    if n <= 2 {
                        anyhow::bail!("TypeError: value is not a function");
                    }
                    Ok::<_, anyhow::Error>(json!({"prompt": state["prompt"], "done": true}))
                }
            },
            |state: &Value| if state["done"] == json!(true) { 1.0 } else { 0.2 },
        );
        let (coordinator, store) = coordinator(LearningConfig::default());
        let result = coordinator.start_session(task, SessionOptions::default()).await;

        assert!(result.threshold_met);
        let prompts = prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 3);
        assert_eq!(prompts[0], "Sum the numbers");
        assert_eq!(prompts[1], "Sum the numbers");
        assert!(prompts[2].starts_with("Sum the numbers\n\n"));
        assert!(prompts[2].contains("TYPE_ERROR"));

        let iterations = store.list_iterations(&result.session_id).await.unwrap();
        assert!(iterations[0].prompt_modifications.is_empty());
        assert_eq!(
            iterations[2].prompt_modifications[0].modification_type,
            crate::model::ModificationType::AvoidPattern
        );
    }

    #[test]
    fn test_summary_insights() {
        let settings = SessionOptions::default().resolve(&SessionDefaults::default());
        let mut session =
            LearningSession::new("s".into(), "t".into(), "a".into(), settings, 0.2);
        session.record_quality(0.5);
        session.error_patterns.insert("pattern_1".into());

        let summary = LearningSummary::build(&session, 0.2);
        assert!((summary.improvement_rate - 1.5).abs() < 1e-9);
        assert_eq!(summary.distinct_error_patterns, 1);
        assert_eq!(summary.key_insights.len(), 3);
        assert!(summary.key_insights[0].contains("20.0%"));
        assert!(summary.key_insights[0].contains("50.0%"));
    }
}
