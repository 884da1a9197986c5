//! Array differences between the old and new image of an update.
//!
//! Useful for membership-style arrays where a client needs to know which
//! elements joined, left, or changed. With an identity field, elements are
//! matched by that field regardless of position. Without one, elements are
//! compared position by position.

use crate::document::{get_path, values_equal};
use serde::Serialize;
use serde_json::Value;

/// An element present on both sides whose content changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Modified {
    /// Identity value, or the position for positional diffs.
    pub identity: Value,
    pub old: Value,
    pub new: Value,
}

/// Result of diffing two arrays.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ArrayDiff {
    pub added: Vec<Value>,
    pub removed: Vec<Value>,
    pub modified: Vec<Modified>,
    pub unchanged: usize,
}

impl ArrayDiff {
    /// Whether the two arrays were structurally identical.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Diff `old` against `new`.
///
/// `identity` is a dot path evaluated on each element (`"_id"`, `"user.id"`).
/// Elements without that field are matched by structural equality.
pub fn diff_arrays(old: &[Value], new: &[Value], identity: Option<&str>) -> ArrayDiff {
    match identity {
        Some(path) => identity_diff(old, new, path),
        None => positional_diff(old, new),
    }
}

fn identity_of<'a>(element: &'a Value, path: &str) -> Option<&'a Value> {
    match element {
        Value::Object(map) => get_path(map, path),
        _ => None,
    }
}

fn identity_diff(old: &[Value], new: &[Value], path: &str) -> ArrayDiff {
    let mut diff = ArrayDiff::default();
    let mut matched_old = vec![false; old.len()];

    for element in new {
        let counterpart = match identity_of(element, path) {
            Some(id) => old.iter().enumerate().position(|(i, candidate)| {
                !matched_old[i] && identity_of(candidate, path).is_some_and(|other| values_equal(other, id))
            }),
            None => old.iter().enumerate().position(|(i, candidate)| {
                !matched_old[i] && identity_of(candidate, path).is_none() && values_equal(candidate, element)
            }),
        };
        match counterpart {
            Some(i) => {
                matched_old[i] = true;
                if values_equal(&old[i], element) {
                    diff.unchanged += 1;
                } else {
                    diff.modified.push(Modified {
                        identity: identity_of(element, path).cloned().unwrap_or(Value::Null),
                        old: old[i].clone(),
                        new: element.clone(),
                    });
                }
            }
            None => diff.added.push(element.clone()),
        }
    }

    diff.removed = old
        .iter()
        .zip(&matched_old)
        .filter(|(_, matched)| !**matched)
        .map(|(element, _)| element.clone())
        .collect();
    diff
}

fn positional_diff(old: &[Value], new: &[Value]) -> ArrayDiff {
    let mut diff = ArrayDiff::default();
    for index in 0..old.len().max(new.len()) {
        match (old.get(index), new.get(index)) {
            (Some(before), Some(after)) if values_equal(before, after) => diff.unchanged += 1,
            (Some(before), Some(after)) => diff.modified.push(Modified {
                identity: Value::from(index),
                old: before.clone(),
                new: after.clone(),
            }),
            (Some(before), None) => diff.removed.push(before.clone()),
            (None, Some(after)) => diff.added.push(after.clone()),
            (None, None) => {}
        }
    }
    diff
}
