//! Adaptive prompt engineering: rule-based prompt edits driven by the
//! history of earlier iterations.

mod engineer;

pub use engineer::{AdaptivePromptEngineer, PatternStats, PromptAdaptation};
