//! Configuration for Relearn
//!
//! Loaded from `~/.relearn/config.toml` (or an explicit path). Every field has
//! a default, so a partial or missing file is fine.

use crate::{RelearnError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub session: SessionDefaults,
    pub preservation: PreservationConfig,
    pub patterns: PatternConfig,
    pub prompting: PromptingConfig,
    pub budget: BudgetConfig,
}

/// Session defaults, overridable per session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    /// Quality score at or above which a session has converged
    pub quality_threshold: f64,
    /// The threshold only ends a session after this many iterations
    pub min_iterations: u32,
    pub max_iterations: u32,
    pub enable_error_recognition: bool,
    pub enable_adaptive_prompting: bool,
    /// Top-level state field holding the agent's instructions
    pub prompt_key: String,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            quality_threshold: 0.8,
            min_iterations: 1,
            max_iterations: 10,
            enable_error_recognition: true,
            enable_adaptive_prompting: true,
            prompt_key: "prompt".to_string(),
        }
    }
}

/// Snapshot storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreservationConfig {
    pub enable_compression: bool,
    /// gzip level, 0-9
    pub compression_level: u32,
    pub enable_differential_storage: bool,
    pub checksum_validation: bool,
    /// Ceiling on the encoded (pre-compression) state size
    pub max_snapshot_size_mb: u64,
    /// Longest run of diffs before a full snapshot is forced
    pub max_diff_chain: usize,
}

impl Default for PreservationConfig {
    fn default() -> Self {
        Self {
            enable_compression: true,
            compression_level: 6,
            enable_differential_storage: true,
            checksum_validation: true,
            max_snapshot_size_mb: 50,
            max_diff_chain: 16,
        }
    }
}

impl PreservationConfig {
    pub fn max_snapshot_bytes(&self) -> u64 {
        self.max_snapshot_size_mb.saturating_mul(1024 * 1024)
    }
}

/// Error pattern matching settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Minimum Jaccard similarity for a known-pattern match (exclusive)
    pub similarity_threshold: f64,
    pub initial_confidence: f64,
    pub confidence_step: f64,
    pub max_confidence: f64,
    pub max_examples: usize,
    pub max_fingerprint_len: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            initial_confidence: 0.7,
            confidence_step: 0.01,
            max_confidence: 0.95,
            max_examples: 5,
            max_fingerprint_len: 200,
        }
    }
}

/// Prompt adaptation rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptingConfig {
    /// Number of recent iterations the rules look at
    pub window: usize,
    pub min_errors_in_window: usize,
    /// Mean improvement below this counts as stalled
    pub stall_threshold: f64,
    /// Deltas beyond +/- this count as success or failure
    pub improvement_epsilon: f64,
    pub max_avoid_labels: usize,
    pub max_reinforcements: usize,
}

impl Default for PromptingConfig {
    fn default() -> Self {
        Self {
            window: 3,
            min_errors_in_window: 2,
            stall_threshold: 0.005,
            improvement_epsilon: 0.01,
            max_avoid_labels: 3,
            max_reinforcements: 3,
        }
    }
}

/// Iteration budget enforced by the default iteration manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_iterations: u32,
    /// Cumulative estimated state size that triggers a resource warning
    pub resource_warning_mb: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            resource_warning_mb: 100.0,
        }
    }
}

impl LearningConfig {
    /// Default config location: `~/.relearn/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".relearn").join("config.toml"))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load a config file if it exists, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            Some(path) => {
                debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RelearnError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        if !(0.0..=1.0).contains(&session.quality_threshold) {
            return Err(RelearnError::Config(format!(
                "quality_threshold must be within [0, 1], got {}",
                session.quality_threshold
            )));
        }
        if session.max_iterations == 0 {
            return Err(RelearnError::Config("max_iterations must be at least 1".into()));
        }
        if session.min_iterations > session.max_iterations {
            return Err(RelearnError::Config(format!(
                "min_iterations ({}) exceeds max_iterations ({})",
                session.min_iterations, session.max_iterations
            )));
        }
        if self.preservation.compression_level > 9 {
            return Err(RelearnError::Config(format!(
                "compression_level must be 0-9, got {}",
                self.preservation.compression_level
            )));
        }
        let patterns = &self.patterns;
        if patterns.similarity_threshold <= 0.0 || patterns.similarity_threshold > 1.0 {
            return Err(RelearnError::Config(format!(
                "similarity_threshold must be within (0, 1], got {}",
                patterns.similarity_threshold
            )));
        }
        if patterns.max_confidence < patterns.initial_confidence {
            return Err(RelearnError::Config(
                "max_confidence must not be below initial_confidence".into(),
            ));
        }
        if self.prompting.window == 0 {
            return Err(RelearnError::Config("prompting window must be at least 1".into()));
        }
        if self.budget.max_iterations == 0 {
            return Err(RelearnError::Config(
                "budget max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.session.quality_threshold = threshold;
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.session.max_iterations = max;
        self.budget.max_iterations = max;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.preservation.enable_compression = enabled;
        self
    }

    pub fn with_checksum_validation(mut self, enabled: bool) -> Self {
        self.preservation.checksum_validation = enabled;
        self
    }

    pub fn with_differential_storage(mut self, enabled: bool) -> Self {
        self.preservation.enable_differential_storage = enabled;
        self
    }
}
