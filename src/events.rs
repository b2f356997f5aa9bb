//! Learning event surface.
//!
//! Each coordinator owns an `EventHub`. Subscribers get an unbounded
//! `async_channel` receiver, so emitting never blocks the iteration loop and
//! every subscriber sees every event of a session in emission order.

use crate::model::{ErrorCategory, ModificationType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::debug;

/// Type-specific event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted {
        task_id: String,
        agent_id: String,
    },
    IterationStarted {
        iteration_number: u32,
    },
    IterationCompleted {
        iteration_number: u32,
        quality_score: f64,
        improvement: f64,
        error_detected: bool,
    },
    ErrorDetected {
        iteration_number: u32,
        message: String,
    },
    PatternRecognized {
        pattern_id: String,
        category: ErrorCategory,
        is_known_pattern: bool,
        confidence: f64,
    },
    PromptModified {
        iteration_number: u32,
        modifications: Vec<ModificationType>,
    },
    QualityThresholdMet {
        quality_score: f64,
        threshold: f64,
    },
    SessionCompleted {
        reason: String,
        final_quality: f64,
        iterations: u32,
    },
    SessionFailed {
        error: String,
    },
    ResourceWarning {
        message: String,
        usage_mb: f64,
    },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session-started",
            Self::IterationStarted { .. } => "iteration-started",
            Self::IterationCompleted { .. } => "iteration-completed",
            Self::ErrorDetected { .. } => "error-detected",
            Self::PatternRecognized { .. } => "pattern-recognized",
            Self::PromptModified { .. } => "prompt-modified",
            Self::QualityThresholdMet { .. } => "quality-threshold-met",
            Self::SessionCompleted { .. } => "session-completed",
            Self::SessionFailed { .. } => "session-failed",
            Self::ResourceWarning { .. } => "resource-warning",
        }
    }
}

/// A notification about one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningEvent {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl LearningEvent {
    pub fn new(session_id: &str, kind: EventKind) -> Self {
        Self {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

/// Fan-out of learning events to any number of subscribers
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<async_channel::Sender<LearningEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> async_channel::Receiver<LearningEvent> {
        let (tx, rx) = async_channel::unbounded();
        self.lock().push(tx);
        rx
    }

    pub fn emit(&self, session_id: &str, kind: EventKind) {
        let event = LearningEvent::new(session_id, kind);
        debug!("Event {} for session {}", event.event_type(), session_id);
        self.lock()
            .retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<async_channel::Sender<LearningEvent>>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
