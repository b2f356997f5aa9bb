//! Error pattern recognition: a fixed failure taxonomy plus patterns learned
//! from generalized error fingerprints.

pub mod fingerprint;
mod recognizer;
mod taxonomy;

pub use recognizer::{ErrorAnalysis, ErrorPatternRecognizer, IterationContext, RecognizerStats};
pub use taxonomy::Taxonomy;
