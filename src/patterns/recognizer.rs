//! Error Pattern Recognizer.
//!
//! Known patterns are matched by token-set similarity; anything else is
//! categorized by indicator, fingerprinted and learned as a new pattern.
//! The pattern table is shared by all sessions. Every match or insert runs
//! under the table's write lock, including the write-through to the store,
//! so concurrent sessions hitting one fingerprint never lose an update.

use super::fingerprint::{self, Generalizer};
use super::taxonomy::Taxonomy;
use crate::config::PatternConfig;
use crate::model::{ErrorCategory, ErrorPattern};
use crate::store::LearningStore;
use crate::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Where an error happened
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationContext {
    pub session_id: String,
    pub iteration_number: u32,
    pub task_id: Option<String>,
}

/// Classification of one error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorAnalysis {
    pub category: ErrorCategory,
    pub confidence: f64,
    pub remediation_strategy: String,
    pub pattern_id: Option<String>,
    pub is_known_pattern: bool,
}

/// Summary of the learned pattern table
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecognizerStats {
    pub total_patterns: usize,
    pub total_matches: u64,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub most_frequent: Option<String>,
}

pub struct ErrorPatternRecognizer {
    config: PatternConfig,
    store: Arc<dyn LearningStore>,
    taxonomy: Taxonomy,
    generalizer: Generalizer,
    patterns: RwLock<HashMap<String, ErrorPattern>>,
}

impl ErrorPatternRecognizer {
    pub fn new(config: PatternConfig, store: Arc<dyn LearningStore>) -> Self {
        let generalizer = Generalizer::new(config.max_fingerprint_len);
        Self {
            config,
            store,
            taxonomy: Taxonomy::new(),
            generalizer,
            patterns: RwLock::new(HashMap::new()),
        }
    }

    /// Load known patterns from the store. A store failure leaves the table
    /// empty rather than failing. Returns the number of patterns loaded.
    pub async fn initialize(&self) -> usize {
        match self.store.get_error_patterns(None).await {
            Ok(loaded) => {
                let mut patterns = self.patterns.write().await;
                for pattern in loaded {
                    patterns.insert(pattern.id.clone(), pattern);
                }
                info!("Loaded {} known error pattern(s)", patterns.len());
                patterns.len()
            }
            Err(e) => {
                warn!("Failed to load error patterns, starting empty: {}", e);
                0
            }
        }
    }

    pub async fn analyze_error(
        &self,
        context: &IterationContext,
        error_message: &str,
        stack_trace: Option<&str>,
    ) -> ErrorAnalysis {
        let text = match stack_trace {
            Some(stack) if !stack.trim().is_empty() => format!("{}\n{}", error_message, stack),
            _ => error_message.to_string(),
        };
        let tokens = fingerprint::tokenize(&text);

        // The message decides the category; the stack only breaks an Unknown.
        let category = match self.taxonomy.categorize(error_message) {
            ErrorCategory::Unknown => self.taxonomy.categorize(&text),
            category => category,
        };
        let fingerprint = self.generalizer.generalize(error_message);
        let fingerprint_id = fingerprint::pattern_id(category, &fingerprint);

        let mut patterns = self.patterns.write().await;
        // Jaccard first; an exact fingerprint id still counts as a repeat.
        let matched_id = self
            .best_match(&patterns, category, &tokens)
            .or_else(|| patterns.contains_key(&fingerprint_id).then(|| fingerprint_id.clone()));

        let (pattern, is_known) = match matched_id.and_then(|id| patterns.get_mut(&id)) {
            Some(existing) => (self.record_match(existing, error_message), true),
            None => {
                let pattern = self.new_pattern(fingerprint_id, category, fingerprint, error_message);
                patterns.insert(pattern.id.clone(), pattern.clone());
                (pattern, false)
            }
        };

        if is_known {
            debug!(
                "Session {} iteration {}: known pattern {} ({}x, confidence {:.2})",
                context.session_id,
                context.iteration_number,
                pattern.id,
                pattern.frequency,
                pattern.confidence
            );
        } else {
            info!(
                "Session {} iteration {}: learned new {} pattern {}",
                context.session_id, context.iteration_number, pattern.category, pattern.id
            );
        }

        if let Err(e) = self.store.upsert_error_pattern(&pattern).await {
            warn!("Failed to persist error pattern {}: {}", pattern.id, e);
        }

        ErrorAnalysis {
            category: pattern.category,
            confidence: pattern.confidence,
            remediation_strategy: pattern.remediation_strategy.clone(),
            pattern_id: Some(pattern.id),
            is_known_pattern: is_known,
        }
    }

    /// Record whether applying a pattern's remediation worked.
    /// Returns the new success rate, or `None` for an unknown pattern.
    pub async fn update_pattern_success(
        &self,
        pattern_id: &str,
        was_successful: bool,
    ) -> Result<Option<f64>> {
        let mut patterns = self.patterns.write().await;
        let Some(pattern) = patterns.get_mut(pattern_id) else {
            warn!("Success update for unknown pattern {}", pattern_id);
            return Ok(None);
        };

        if was_successful {
            pattern.success_count += 1;
        }
        pattern.success_rate = if pattern.frequency == 0 {
            0.0
        } else {
            (pattern.success_count as f64 / pattern.frequency as f64).min(1.0)
        };
        let rate = pattern.success_rate;
        self.store.upsert_error_pattern(pattern).await?;

        Ok(Some(rate))
    }

    pub async fn pattern(&self, pattern_id: &str) -> Option<ErrorPattern> {
        self.patterns.read().await.get(pattern_id).cloned()
    }

    /// Known patterns, most frequent first
    pub async fn patterns(&self, category: Option<ErrorCategory>) -> Vec<ErrorPattern> {
        let mut result: Vec<ErrorPattern> = self
            .patterns
            .read()
            .await
            .values()
            .filter(|p| category.map_or(true, |c| p.category == c))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.frequency.cmp(&a.frequency).then_with(|| a.id.cmp(&b.id)));
        result
    }

    pub async fn statistics(&self) -> RecognizerStats {
        let patterns = self.patterns.read().await;
        let mut by_category = BTreeMap::new();
        for pattern in patterns.values() {
            *by_category.entry(pattern.category).or_insert(0) += 1;
        }

        RecognizerStats {
            total_patterns: patterns.len(),
            total_matches: patterns.values().map(|p| p.frequency as u64).sum(),
            by_category,
            most_frequent: patterns
                .values()
                .max_by(|a, b| a.frequency.cmp(&b.frequency).then_with(|| b.id.cmp(&a.id)))
                .map(|p| p.id.clone()),
        }
    }

    /// Highest-similarity pattern of `category` strictly above the
    /// threshold. Ties go to the more frequent pattern, then the smaller id.
    fn best_match(
        &self,
        patterns: &HashMap<String, ErrorPattern>,
        category: ErrorCategory,
        tokens: &HashSet<String>,
    ) -> Option<String> {
        let mut best: Option<(f64, &ErrorPattern)> = None;
        for pattern in patterns.values().filter(|p| p.category == category) {
            let score = fingerprint::jaccard(tokens, &fingerprint::tokenize(&pattern.pattern));
            if score <= self.config.similarity_threshold {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_score, current)) => {
                    score > best_score
                        || (score == best_score
                            && (pattern.frequency, std::cmp::Reverse(&pattern.id))
                                > (current.frequency, std::cmp::Reverse(&current.id)))
                }
            };
            if better {
                best = Some((score, pattern));
            }
        }
        best.map(|(_, pattern)| pattern.id.clone())
    }

    fn record_match(&self, pattern: &mut ErrorPattern, example: &str) -> ErrorPattern {
        pattern.frequency += 1;
        pattern.confidence =
            (pattern.confidence + self.config.confidence_step).min(self.config.max_confidence);
        pattern.last_seen = Utc::now();
        if pattern.examples.len() < self.config.max_examples
            && !pattern.examples.iter().any(|e| e == example)
        {
            pattern.examples.push(example.to_string());
        }
        pattern.clone()
    }

    fn new_pattern(
        &self,
        id: String,
        category: ErrorCategory,
        fingerprint: String,
        example: &str,
    ) -> ErrorPattern {
        let now = Utc::now();
        ErrorPattern {
            id,
            category,
            pattern: fingerprint,
            frequency: 1,
            confidence: self.config.initial_confidence,
            first_detected: now,
            last_seen: now,
            remediation_strategy: category.remediation().to_string(),
            success_count: 0,
            success_rate: 0.0,
            examples: vec![example.to_string()],
        }
    }
}
