//! Learning data model: sessions, iterations, error patterns and prompt
//! modifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Session lifecycle: `Initializing -> Active -> {Completed, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Initializing,
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        match self {
            Self::Initializing => matches!(next, Self::Active | Self::Failed),
            Self::Active => next.is_terminal(),
            Self::Completed | Self::Failed => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Session-level settings after per-session overrides are applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub quality_threshold: f64,
    pub min_iterations: u32,
    pub max_iterations: u32,
    pub enable_error_recognition: bool,
    pub enable_adaptive_prompting: bool,
}

/// One attempt at solving one task across iterations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningSession {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub status: SessionStatus,
    pub settings: SessionSettings,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub iteration_count: u32,
    pub quality_score: f64,
    /// Quality per iteration; its length always equals `iteration_count`
    pub improvement_trajectory: Vec<f64>,
    pub error_patterns: BTreeSet<String>,
    pub final_result: Option<Value>,
    pub summary: Option<String>,
}

impl LearningSession {
    pub fn new(
        id: String,
        task_id: String,
        agent_id: String,
        settings: SessionSettings,
        initial_quality: f64,
    ) -> Self {
        Self {
            id,
            task_id,
            agent_id,
            status: SessionStatus::Initializing,
            settings,
            start_time: Utc::now(),
            end_time: None,
            iteration_count: 0,
            quality_score: initial_quality,
            improvement_trajectory: Vec::new(),
            error_patterns: BTreeSet::new(),
            final_result: None,
            summary: None,
        }
    }

    /// Append one iteration's quality, keeping count and trajectory in step
    pub fn record_quality(&mut self, quality: f64) {
        self.iteration_count += 1;
        self.quality_score = quality;
        self.improvement_trajectory.push(quality);
    }
}

/// Partial session update, applied field by field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub improvement_trajectory: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_patterns: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl SessionUpdate {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Progress fields of a session after an iteration
    pub fn progress(session: &LearningSession) -> Self {
        Self {
            iteration_count: Some(session.iteration_count),
            quality_score: Some(session.quality_score),
            improvement_trajectory: Some(session.improvement_trajectory.clone()),
            error_patterns: Some(session.error_patterns.clone()),
            ..Default::default()
        }
    }

    /// Apply the set fields to `session`.
    ///
    /// An illegal status change is rejected before anything is written.
    /// Rewriting the current status is allowed.
    pub fn apply_to(&self, session: &mut LearningSession) -> crate::Result<()> {
        if let Some(status) = self.status {
            if status != session.status && !session.status.can_transition_to(status) {
                return Err(crate::RelearnError::Store(format!(
                    "Session {} cannot move from {} to {}",
                    session.id, session.status, status
                )));
            }
            session.status = status;
        }
        if let Some(end_time) = self.end_time {
            session.end_time = Some(end_time);
        }
        if let Some(count) = self.iteration_count {
            session.iteration_count = count;
        }
        if let Some(quality) = self.quality_score {
            session.quality_score = quality;
        }
        if let Some(trajectory) = &self.improvement_trajectory {
            session.improvement_trajectory = trajectory.clone();
        }
        if let Some(patterns) = &self.error_patterns {
            session.error_patterns = patterns.clone();
        }
        if let Some(result) = &self.final_result {
            session.final_result = Some(result.clone());
        }
        if let Some(summary) = &self.summary {
            session.summary = Some(summary.clone());
        }
        Ok(())
    }
}

/// One executor invocation within a session; immutable once persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningIteration {
    pub id: String,
    pub session_id: String,
    /// 1-based, contiguous within a session
    pub iteration_number: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    /// Checkpoint holding the post-iteration state
    pub snapshot_id: String,
    pub error_detected: bool,
    pub error_category: Option<ErrorCategory>,
    pub error_message: Option<String>,
    pub quality_score: f64,
    /// Current minus previous quality
    pub improvement: f64,
    /// Encoded state size in MB
    pub resource_usage_mb: f64,
    pub prompt_modifications: Vec<PromptModification>,
}

/// Fixed failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    SyntaxError,
    TypeError,
    RuntimeError,
    LogicError,
    ValidationError,
    TimeoutError,
    ResourceError,
    DependencyError,
    ConfigurationError,
    Unknown,
}

impl ErrorCategory {
    /// Every category in indicator-matching order
    pub const ALL: [ErrorCategory; 10] = [
        Self::SyntaxError,
        Self::TypeError,
        Self::RuntimeError,
        Self::LogicError,
        Self::ValidationError,
        Self::TimeoutError,
        Self::ResourceError,
        Self::DependencyError,
        Self::ConfigurationError,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::TypeError => "TYPE_ERROR",
            Self::RuntimeError => "RUNTIME_ERROR",
            Self::LogicError => "LOGIC_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::ResourceError => "RESOURCE_ERROR",
            Self::DependencyError => "DEPENDENCY_ERROR",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generalized failure fingerprint plus its remediation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    /// Digest of `pattern`
    pub id: String,
    pub category: ErrorCategory,
    /// Generalized fingerprint text
    pub pattern: String,
    pub frequency: u32,
    pub confidence: f64,
    pub first_detected: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub remediation_strategy: String,
    #[serde(default)]
    pub success_count: u32,
    pub success_rate: f64,
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModificationType {
    AvoidPattern,
    ClarifyInstruction,
    EmphasizePattern,
}

impl std::fmt::Display for ModificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AvoidPattern => write!(f, "AVOID_PATTERN"),
            Self::ClarifyInstruction => write!(f, "CLARIFY_INSTRUCTION"),
            Self::EmphasizePattern => write!(f, "EMPHASIZE_PATTERN"),
        }
    }
}

/// One adaptation applied to an iteration's instructions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptModification {
    pub id: String,
    pub session_id: String,
    pub iteration_number: u32,
    pub modification_type: ModificationType,
    /// Short name for the guidance, used as the success-table key
    pub label: String,
    pub original_prompt: String,
    pub modified_prompt: String,
    pub rationale: String,
    pub success_patterns: Vec<String>,
    pub failure_patterns: Vec<String>,
    pub applied_at: DateTime<Utc>,
}
