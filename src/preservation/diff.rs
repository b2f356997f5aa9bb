//! Shallow structural diff over dynamic values.
//!
//! Only top-level keys of a mapping are compared. A changed nested value is
//! carried whole, never recursed into.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Change to one top-level key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffEntry {
    /// Key added, or its value replaced
    Set(Value),
    /// Key removed
    Deleted,
}

/// Top-level changes from a base mapping to a new one
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    pub entries: BTreeMap<String, DiffEntry>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Diff two mappings. Returns `None` when either side is not a mapping,
/// since only mappings have keys to compare.
pub fn compute_diff(base: &Value, next: &Value) -> Option<StateDiff> {
    let (Value::Object(base), Value::Object(next)) = (base, next) else {
        return None;
    };

    let mut entries = BTreeMap::new();
    for (key, value) in next {
        if base.get(key) != Some(value) {
            entries.insert(key.clone(), DiffEntry::Set(value.clone()));
        }
    }
    for key in base.keys() {
        if !next.contains_key(key) {
            entries.insert(key.clone(), DiffEntry::Deleted);
        }
    }

    Some(StateDiff { entries })
}

/// Apply a diff on top of a base mapping. A non-mapping base is treated as
/// an empty mapping.
pub fn apply_diff(base: &Value, diff: &StateDiff) -> Value {
    let mut result = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    for (key, entry) in &diff.entries {
        match entry {
            DiffEntry::Set(value) => {
                result.insert(key.clone(), value.clone());
            }
            DiffEntry::Deleted => {
                result.remove(key);
            }
        }
    }

    Value::Object(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_then_apply_reproduces_next() {
        let base = json!({"a": 1, "b": "keep", "c": [1, 2], "gone": true});
        let next = json!({"a": 2, "b": "keep", "c": [1, 2, 3], "new": null});

        let diff = compute_diff(&base, &next).unwrap();
        assert_eq!(diff.len(), 4);
        assert_eq!(diff.entries["gone"], DiffEntry::Deleted);
        assert!(!diff.entries.contains_key("b"));
        assert_eq!(apply_diff(&base, &diff), next);
    }

    #[test]
    fn test_nested_change_is_whole_value_replacement() {
        let base = json!({"config": {"depth": 1, "width": 2}});
        let next = json!({"config": {"depth": 1, "width": 3}});

        let diff = compute_diff(&base, &next).unwrap();
        assert_eq!(
            diff.entries["config"],
            DiffEntry::Set(json!({"depth": 1, "width": 3}))
        );
    }

    #[test]
    fn test_identical_states_produce_empty_diff() {
        let state = json!({"x": 1});
        let diff = compute_diff(&state, &state).unwrap();
        assert!(diff.is_empty());
        assert_eq!(apply_diff(&state, &diff), state);
    }

    #[test]
    fn test_non_mapping_states_are_not_diffed() {
        assert!(compute_diff(&json!([1, 2]), &json!({"a": 1})).is_none());
        assert!(compute_diff(&json!({"a": 1}), &json!("text")).is_none());
    }

    #[test]
    fn test_delete_everything() {
        let base = json!({"a": 1, "b": 2});
        let next = json!({});
        let diff = compute_diff(&base, &next).unwrap();
        assert_eq!(apply_diff(&base, &diff), next);
    }
}
