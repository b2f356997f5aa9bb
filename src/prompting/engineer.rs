//! Rule-based prompt adaptation.
//!
//! Three rules run in order against a session's recent window:
//! repeated errors add an avoid list, stalled progress adds decomposition
//! guidance, and modifications that kept paying off are reinforced.
//!
//! Two kinds of failure are tracked. The failure table counts failed
//! iterations by error category (`REGRESSION` when there is none) and feeds
//! the avoid list. Separately, every modification label that was applied to
//! a failed iteration gets a failure count; a label is only reinforced while
//! its successes outnumber those failures.

use crate::config::PromptingConfig;
use crate::model::{LearningIteration, ModificationType, PromptModification};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use uuid::Uuid;

const AVOID_LABEL: &str = "avoid-repeated-errors";
const CLARIFY_LABEL: &str = "decompose-and-verify";
const EMPHASIZE_LABEL: &str = "reinforce-successes";

const ERROR_CHECKLIST: &str = "\
Recent attempts kept failing. Before answering:
- Check inputs and types before using them.
- Handle missing or empty values explicitly.
- Re-read the error messages from earlier attempts and do not repeat them.";

const CLARIFY_GUIDANCE: &str = "\
Progress has stalled. Break the problem into smaller steps, solve them one at a time, \
and re-verify each assumption against the current state before building on it.";

/// Hit count and running mean improvement for one label
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    pub count: u32,
    pub mean_improvement: f64,
}

impl PatternStats {
    fn observe(&mut self, improvement: f64) {
        self.count += 1;
        self.mean_improvement += (improvement - self.mean_improvement) / self.count as f64;
    }
}

/// Next prompt plus the modifications that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct PromptAdaptation {
    pub modified_prompt: String,
    pub modifications: Vec<PromptModification>,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    error_detected: bool,
    improvement: f64,
}

/// Proposes prompt edits from the history of recorded iterations.
///
/// History is kept per session; the success and failure tables are shared
/// by every session the engineer has seen.
#[derive(Debug)]
pub struct AdaptivePromptEngineer {
    config: PromptingConfig,
    history: HashMap<String, Vec<Observation>>,
    success: BTreeMap<String, PatternStats>,
    failure: BTreeMap<String, PatternStats>,
    /// Failed iterations per applied modification label
    label_failures: BTreeMap<String, u32>,
}

impl AdaptivePromptEngineer {
    pub fn new(config: PromptingConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
            success: BTreeMap::new(),
            failure: BTreeMap::new(),
            label_failures: BTreeMap::new(),
        }
    }

    pub fn record_iteration(&mut self, iteration: &LearningIteration) {
        let epsilon = self.config.improvement_epsilon;

        if iteration.improvement > epsilon {
            for modification in &iteration.prompt_modifications {
                self.success
                    .entry(modification.label.clone())
                    .or_default()
                    .observe(iteration.improvement);
            }
        }
        if iteration.error_detected || iteration.improvement < -epsilon {
            let label = iteration
                .error_category
                .map(|c| c.as_str().to_string())
                .unwrap_or_else(|| "REGRESSION".to_string());
            self.failure
                .entry(label)
                .or_default()
                .observe(iteration.improvement);
            for modification in &iteration.prompt_modifications {
                *self
                    .label_failures
                    .entry(modification.label.clone())
                    .or_default() += 1;
            }
        }

        self.history
            .entry(iteration.session_id.clone())
            .or_default()
            .push(Observation {
                error_detected: iteration.error_detected,
                improvement: iteration.improvement,
            });
    }

    /// Apply every rule that fires, in order, to `prompt`
    pub fn modify_prompt(
        &self,
        session_id: &str,
        prompt: &str,
        iteration_number: u32,
    ) -> PromptAdaptation {
        let recent = self.recent(session_id);
        let mut current = prompt.to_string();
        let mut modifications = Vec::new();

        let errors = recent.iter().filter(|o| o.error_detected).count();
        if errors >= self.config.min_errors_in_window {
            let avoid = self.top_failures();
            let mut addition = format!("\n\n{}", ERROR_CHECKLIST);
            if !avoid.is_empty() {
                addition.push_str(&format!("\nAvoid these failure types: {}.", avoid.join(", ")));
            }
            let rationale = format!(
                "{} of the last {} iterations failed",
                errors,
                recent.len()
            );
            self.apply(
                &mut current,
                &mut modifications,
                session_id,
                iteration_number,
                ModificationType::AvoidPattern,
                AVOID_LABEL,
                addition,
                rationale,
                Vec::new(),
                avoid,
            );
        }

        // Only judged on a full window, otherwise the first iterations would always look stalled.
        if recent.len() >= self.config.window {
            let mean =
                recent.iter().map(|o| o.improvement).sum::<f64>() / recent.len() as f64;
            if mean < self.config.stall_threshold {
                self.apply(
                    &mut current,
                    &mut modifications,
                    session_id,
                    iteration_number,
                    ModificationType::ClarifyInstruction,
                    CLARIFY_LABEL,
                    format!("\n\n{}", CLARIFY_GUIDANCE),
                    format!("Mean improvement {:.4} over the last {} iterations", mean, recent.len()),
                    Vec::new(),
                    Vec::new(),
                );
            }
        }

        let reinforce = self.reinforcements();
        if !reinforce.is_empty() {
            let list: Vec<String> = reinforce.iter().map(|l| format!("- {}", l)).collect();
            self.apply(
                &mut current,
                &mut modifications,
                session_id,
                iteration_number,
                ModificationType::EmphasizePattern,
                EMPHASIZE_LABEL,
                format!("\n\nKeep doing what worked before:\n{}", list.join("\n")),
                format!("{} adaptation(s) consistently improved quality", reinforce.len()),
                reinforce,
                Vec::new(),
            );
        }

        PromptAdaptation {
            modified_prompt: current,
            modifications,
        }
    }

    /// Drop a session's history; the shared tables are kept
    pub fn clear_session(&mut self, session_id: &str) {
        self.history.remove(session_id);
    }

    pub fn success_table(&self) -> &BTreeMap<String, PatternStats> {
        &self.success
    }

    pub fn failure_table(&self) -> &BTreeMap<String, PatternStats> {
        &self.failure
    }

    pub fn label_failures(&self) -> &BTreeMap<String, u32> {
        &self.label_failures
    }

    fn recent(&self, session_id: &str) -> &[Observation] {
        let history = self.history.get(session_id).map(Vec::as_slice).unwrap_or(&[]);
        &history[history.len().saturating_sub(self.config.window)..]
    }

    fn top_failures(&self) -> Vec<String> {
        let mut failures: Vec<(&String, &PatternStats)> = self.failure.iter().collect();
        failures.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(b.0)));
        failures
            .into_iter()
            .take(self.config.max_avoid_labels)
            .map(|(label, _)| label.clone())
            .collect()
    }

    fn reinforcements(&self) -> Vec<String> {
        let mut candidates: Vec<(&String, f64)> = self
            .success
            .iter()
            .filter(|(label, stats)| {
                let failures = self.label_failures.get(*label).copied().unwrap_or(0);
                stats.count > failures && stats.mean_improvement > 0.0
            })
            .map(|(label, stats)| (label, stats.count as f64 * stats.mean_improvement))
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        candidates
            .into_iter()
            .take(self.config.max_reinforcements)
            .map(|(label, _)| label.clone())
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        current: &mut String,
        modifications: &mut Vec<PromptModification>,
        session_id: &str,
        iteration_number: u32,
        modification_type: ModificationType,
        label: &str,
        addition: String,
        rationale: String,
        success_patterns: Vec<String>,
        failure_patterns: Vec<String>,
    ) {
        let original = current.clone();
        current.push_str(&addition);
        debug!(
            "Session {} iteration {}: {} ({})",
            session_id, iteration_number, modification_type, rationale
        );
        modifications.push(PromptModification {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            iteration_number,
            modification_type,
            label: label.to_string(),
            original_prompt: original,
            modified_prompt: current.clone(),
            rationale,
            success_patterns,
            failure_patterns,
            applied_at: Utc::now(),
        });
    }
}
