//! Failure categories: textual indicators and remediation strategies

use crate::model::ErrorCategory;
use regex::Regex;

impl ErrorCategory {
    /// Fixed remediation advice for the category
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::SyntaxError => {
                "Check brackets, quotes and statement terminators around the reported location; re-read the offending line before editing it."
            }
            Self::TypeError => {
                "Verify the value's type before use: check for null/undefined, confirm the method exists, and align signatures with their callers."
            }
            Self::RuntimeError => {
                "Guard the failing operation: validate indices and references, handle the empty case, and add defensive checks before the crash site."
            }
            Self::LogicError => {
                "Re-derive the expected result by hand, compare it with the actual output, and fix the algorithm rather than the assertion."
            }
            Self::ValidationError => {
                "Re-read the input contract, make every required field present and well-formed, and validate before submitting."
            }
            Self::TimeoutError => {
                "Reduce the work per step: add early exits, avoid unbounded loops or waits, and split long operations into smaller ones."
            }
            Self::ResourceError => {
                "Lower resource use: stream instead of buffering, release handles promptly, and bound caches and batch sizes."
            }
            Self::DependencyError => {
                "Confirm the dependency is installed and the import path and version are correct; prefer what the project already uses."
            }
            Self::ConfigurationError => {
                "Check configuration files and environment variables for missing or misspelled keys and invalid values."
            }
            Self::Unknown => {
                "Read the full error output, reproduce the failure in isolation, and address the first reported problem before anything else."
            }
        }
    }

    fn indicators(&self) -> &'static [&'static str] {
        match self {
            Self::SyntaxError => &[
                r"syntax\s*error",
                r"unexpected token",
                r"unexpected end of (input|file)",
                r"parse error",
                r"unterminated (string|comment)",
                r"missing [;)\]}]",
            ],
            Self::TypeError => &[
                r"type\s*error",
                r"is not a function",
                r"cannot read propert(y|ies)",
                r"undefined is not an object",
                r"mismatched types",
                r"is not assignable to",
            ],
            Self::RuntimeError => &[
                r"reference\s*error",
                r"null pointer",
                r"panicked at",
                r"segmentation fault",
                r"stack overflow",
                r"index out of (bounds|range)",
                r"division by zero",
            ],
            Self::LogicError => &[
                r"assertion (failed|error)",
                r"expected .+ to (equal|be|have)",
                r"wrong (result|answer|output)",
                r"incorrect (result|output|value)",
                r"tests? failed",
            ],
            Self::ValidationError => &[
                r"validation (failed|error)",
                r"invalid (input|argument|value|format|request)",
                r"schema",
                r"required (field|property|parameter)",
                r"must be (a|an|one of|at least|at most)",
            ],
            Self::TimeoutError => &[
                r"timed?\s*out",
                r"deadline exceeded",
                r"etimedout",
                r"took too long",
            ],
            Self::ResourceError => &[
                r"out of memory",
                r"enomem",
                r"heap (limit|out of)",
                r"too many open files",
                r"emfile",
                r"no space left",
                r"enospc",
                r"quota exceeded",
                r"rate limit",
            ],
            Self::DependencyError => &[
                r"cannot find (module|package|crate)",
                r"module not found",
                r"no such (module|package)",
                r"unresolved import",
                r"could not resolve",
                r"failed to (fetch|install)",
                r"dependency",
            ],
            Self::ConfigurationError => &[
                r"config(uration)?\b",
                r"environment variable",
                r"env var",
                r"not configured",
                r"missing (key|setting|option)",
            ],
            Self::Unknown => &[],
        }
    }
}

/// Ordered, case-insensitive indicator matcher over the fixed taxonomy
pub struct Taxonomy {
    rules: Vec<(ErrorCategory, Vec<Regex>)>,
}

impl Taxonomy {
    pub fn new() -> Self {
        let rules = ErrorCategory::ALL
            .iter()
            .filter(|category| **category != ErrorCategory::Unknown)
            .map(|category| {
                let patterns = category
                    .indicators()
                    .iter()
                    .map(|p| Regex::new(&format!("(?i){}", p)).unwrap())
                    .collect();
                (*category, patterns)
            })
            .collect();
        Self { rules }
    }

    /// First category whose indicators match, `Unknown` otherwise
    pub fn categorize(&self, text: &str) -> ErrorCategory {
        self.rules
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| p.is_match(text)))
            .map(|(category, _)| *category)
            .unwrap_or(ErrorCategory::Unknown)
    }
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::new()
    }
}
