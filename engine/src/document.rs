//! Documents and dot-path access.
//!
//! A document is a JSON object. Paths use dots to address nested fields
//! (`profile.name`) and numeric segments to address array positions
//! (`members.0`).

use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// A JSON object as it arrives from the source collection.
pub type Document = Map<String, Value>;

/// Split a dot path into its segments.
fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.')
}

/// Get the value at `path` without traversing into arrays of objects.
///
/// Numeric segments index into arrays. Returns `None` when any segment is missing.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segs = segments(path);
    let first = segs.next()?;
    let mut current = doc.get(first)?;
    for seg in segs {
        current = match current {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Collect every value reachable at `path`, traversing arrays the way query
/// predicates do: `tags.name` over `{tags: [{name: a}, {name: b}]}` yields both names.
pub fn resolve_path<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let segs: Vec<&str> = segments(path).collect();
    let mut out = Vec::new();
    if let Some((first, rest)) = segs.split_first() {
        if let Some(value) = doc.get(*first) {
            collect(value, rest, &mut out);
        }
    }
    out
}

fn collect<'a>(value: &'a Value, rest: &[&str], out: &mut Vec<&'a Value>) {
    let Some((seg, tail)) = rest.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*seg) {
                collect(next, tail, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = seg.parse::<usize>() {
                if let Some(next) = items.get(index) {
                    collect(next, tail, out);
                }
            }
            for item in items {
                if let Value::Object(map) = item {
                    if let Some(next) = map.get(*seg) {
                        collect(next, tail, out);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Set `value` at `path`, creating intermediate objects as needed.
///
/// A non-object intermediate value is replaced by an object.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, tail)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                set_path(child, tail, value);
            }
        }
    }
}

/// Remove the value at `path`, returning it if it existed.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, tail)) => match doc.get_mut(head)? {
            Value::Object(child) => remove_path(child, tail),
            _ => None,
        },
    }
}

/// Deep structural equality.
///
/// Numbers compare by value (`1` equals `1.0`), objects ignore key order, and
/// extended-JSON wrappers such as `{"$date": ..}` compare structurally.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    match (x.as_i64(), y.as_i64()) {
        (Some(a), Some(b)) => a == b,
        _ => match (x.as_u64(), y.as_u64()) {
            (Some(a), Some(b)) => a == b,
            _ => x.as_f64() == y.as_f64(),
        },
    }
}

/// Order two values of the same kind.
///
/// Returns `None` for values that are not comparable with each other, which
/// makes range predicates evaluate false rather than guess.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Object(x), Value::Object(y)) => match (date_of(x), date_of(y)) {
            (Some(x), Some(y)) => compare_values(x, y),
            _ => None,
        },
        _ => None,
    }
}

/// The inner value of an extended-JSON date wrapper.
fn date_of(map: &Document) -> Option<&Value> {
    if map.len() != 1 {
        return None;
    }
    match map.get("$date")? {
        Value::Object(inner) => inner.get("$numberLong"),
        other => Some(other),
    }
}

/// Truthiness used by expressions: `false`, `null`, and zero are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

/// The `_id` of a document.
pub fn document_id(doc: &Document) -> Option<&Value> {
    doc.get("_id")
}
