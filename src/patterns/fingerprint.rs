//! Error fingerprinting: generalize volatile details, tokenize, compare.

use crate::model::ErrorCategory;
use regex::Regex;
use std::collections::HashSet;

/// Rewrites the volatile parts of an error message into placeholders
pub struct Generalizer {
    quoted: Regex,
    path: Regex,
    hex: Regex,
    number: Regex,
    whitespace: Regex,
    max_len: usize,
}

impl Generalizer {
    pub fn new(max_len: usize) -> Self {
        Self {
            quoted: Regex::new(r#""[^"]*"|'[^']*'|`[^`]*`"#).unwrap(),
            path: Regex::new(r"(?:[A-Za-z]:)?(?:[\w.~-]*[/\\])+[\w.-]+").unwrap(),
            hex: Regex::new(r"\b0[xX][0-9a-fA-F]+\b").unwrap(),
            number: Regex::new(r"\d+").unwrap(),
            whitespace: Regex::new(r"\s+").unwrap(),
            max_len,
        }
    }

    /// Quoted strings become `STR`, paths `PATH`, hex literals `HEX` and
    /// digit runs `NUM`; the result is whitespace-collapsed and truncated.
    pub fn generalize(&self, text: &str) -> String {
        let text = self.quoted.replace_all(text, "STR");
        let text = self.path.replace_all(&text, "PATH");
        let text = self.hex.replace_all(&text, "HEX");
        let text = self.number.replace_all(&text, "NUM");
        let text = self.whitespace.replace_all(text.trim(), " ");
        text.chars().take(self.max_len).collect()
    }
}

/// Deterministic pattern id for a categorized fingerprint
pub fn pattern_id(category: ErrorCategory, fingerprint: &str) -> String {
    let digest = format!("{:x}", md5::compute(format!("{}:{}", category, fingerprint)));
    format!("pattern_{}", &digest[..16])
}

/// Lower-cased alphanumeric words longer than two characters
pub fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

/// |A ∩ B| / |A ∪ B|, 0 when both are empty
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
