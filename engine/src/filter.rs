//! Query predicates over documents.
//!
//! Supports a safe subset of the MongoDB query language:
//!
//! - implicit equality: `{status: "open"}`, including array membership
//! - dot paths: `{"owner.id": "u1"}`
//! - document operators: `$and`, `$or`, `$nor`, `$not`
//! - field operators: `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`,
//!   `$exists`, `$not`
//!
//! A field condition is either all operators or a literal value. Objects
//! mixing the two are rejected by [`validate`] when rules are loaded.
//!
//! Anything else is unsupported. An unsupported or malformed operator makes
//! the whole filter evaluate `false` and logs a warning. Evaluation never fails.

use crate::document::{compare_values, resolve_path, values_equal, Document};
use crate::error::{Error, Result};
use serde_json::Value;
use std::cmp::Ordering;

/// Why a filter could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rejection {
    Unsupported(String),
    Malformed(String),
}

type Eval = std::result::Result<bool, Rejection>;

/// Evaluate `filter` against `doc`.
pub fn matches(filter: &Value, doc: &Document) -> bool {
    match eval_document(filter, doc) {
        Ok(result) => result,
        Err(Rejection::Unsupported(op)) => {
            tracing::warn!(operator = %op, "unsupported filter operator, treating as non-match");
            false
        }
        Err(Rejection::Malformed(reason)) => {
            tracing::warn!(%reason, "malformed filter, treating as non-match");
            false
        }
    }
}

/// Operators in `filter` that evaluation would reject.
///
/// Used to flag configuration typos when rules are loaded.
pub fn unsupported_operators(filter: &Value) -> Vec<String> {
    let mut found = Vec::new();
    scan(filter, false, &mut found);
    found
}

/// Reject structurally ambiguous filters.
///
/// A field condition such as `{"a": {"$gt": 2, "x": 1}}` is neither an
/// operator expression nor a literal, whatever its key order.
pub fn validate(filter: &Value) -> Result<()> {
    check(filter, None)
}

fn check(filter: &Value, field: Option<&str>) -> Result<()> {
    let Value::Object(map) = filter else {
        return Ok(());
    };
    for (key, value) in map {
        match (key.strip_prefix('$'), field) {
            (Some(_), None) => match value {
                Value::Array(items) => items.iter().try_for_each(|item| check(item, None))?,
                Value::Object(_) => check(value, None)?,
                _ => {}
            },
            (Some("not"), Some(path)) => check_condition(path, value)?,
            (Some(_), Some(_)) => {}
            (None, _) => check_condition(key, value)?,
        }
    }
    Ok(())
}

fn check_condition(path: &str, condition: &Value) -> Result<()> {
    match shape(condition) {
        Shape::Mixed => Err(Error::InvalidFilter(mixed_message(path))),
        Shape::Operators => check(condition, Some(path)),
        Shape::Literal => Ok(()),
    }
}

fn mixed_message(path: &str) -> String {
    format!("condition on '{path}' mixes operators and plain fields")
}

fn scan(filter: &Value, field_level: bool, found: &mut Vec<String>) {
    let Value::Object(map) = filter else {
        return;
    };
    for (key, value) in map {
        if let Some(op) = key.strip_prefix('$') {
            let known = if field_level {
                FIELD_OPERATORS.contains(&op)
            } else {
                DOCUMENT_OPERATORS.contains(&op)
            };
            if !known {
                found.push(key.clone());
                continue;
            }
            match value {
                Value::Array(items) => items.iter().for_each(|item| scan(item, false, found)),
                Value::Object(_) if op == "not" => scan(value, field_level, found),
                _ => {}
            }
        } else if shape(value) == Shape::Operators {
            scan(value, true, found);
        }
    }
}

const DOCUMENT_OPERATORS: &[&str] = &["and", "or", "nor", "not"];
const FIELD_OPERATORS: &[&str] = &[
    "eq", "ne", "gt", "gte", "lt", "lte", "in", "nin", "exists", "not",
];

/// How a field condition is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Literal,
    Operators,
    Mixed,
}

fn shape(condition: &Value) -> Shape {
    let Value::Object(map) = condition else {
        return Shape::Literal;
    };
    match map.keys().filter(|k| k.starts_with('$')).count() {
        0 => Shape::Literal,
        n if n == map.len() => Shape::Operators,
        _ => Shape::Mixed,
    }
}

fn eval_document(filter: &Value, doc: &Document) -> Eval {
    let Value::Object(map) = filter else {
        return Err(Rejection::Malformed("filter must be an object".into()));
    };
    for (key, condition) in map {
        let passed = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, condition)? {
                    all &= eval_document(clause, doc)?;
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(key, condition)? {
                    any |= eval_document(clause, doc)?;
                }
                any
            }
            "$nor" => {
                let mut any = false;
                for clause in clauses(key, condition)? {
                    any |= eval_document(clause, doc)?;
                }
                !any
            }
            "$not" => !eval_document(condition, doc)?,
            op if op.starts_with('$') => return Err(Rejection::Unsupported(op.to_string())),
            path => eval_field(path, condition, doc)?,
        };
        if !passed {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(op: &str, condition: &'a Value) -> std::result::Result<&'a [Value], Rejection> {
    match condition {
        Value::Array(items) if !items.is_empty() => Ok(items),
        _ => Err(Rejection::Malformed(format!(
            "{op} requires a non-empty array"
        ))),
    }
}

fn eval_field(path: &str, condition: &Value, doc: &Document) -> Eval {
    let candidates = resolve_path(doc, path);
    match (shape(condition), condition) {
        (Shape::Operators, Value::Object(ops)) => {
            for (op, operand) in ops {
                if !eval_operator(op, operand, path, &candidates, doc)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (Shape::Mixed, _) => Err(Rejection::Malformed(mixed_message(path))),
        _ => Ok(equals_any(&candidates, condition)),
    }
}

fn eval_operator(op: &str, operand: &Value, path: &str, candidates: &[&Value], doc: &Document) -> Eval {
    match op {
        "$eq" => Ok(equals_any(candidates, operand)),
        "$ne" => Ok(!equals_any(candidates, operand)),
        "$gt" => Ok(compares(candidates, operand, |o| o == Ordering::Greater)),
        "$gte" => Ok(compares(candidates, operand, |o| o != Ordering::Less)),
        "$lt" => Ok(compares(candidates, operand, |o| o == Ordering::Less)),
        "$lte" => Ok(compares(candidates, operand, |o| o != Ordering::Greater)),
        "$in" => Ok(in_list(op, candidates, operand)?),
        "$nin" => Ok(!in_list(op, candidates, operand)?),
        "$exists" => Ok(!candidates.is_empty() == crate::document::is_truthy(operand)),
        "$not" => match operand {
            Value::Object(_) if shape(operand) == Shape::Operators => Ok(!eval_field(path, operand, doc)?),
            _ => Err(Rejection::Malformed("$not requires an operator expression".into())),
        },
        other => Err(Rejection::Unsupported(other.to_string())),
    }
}

/// Equality with query semantics: a candidate array matches if it equals the
/// operand or contains it, and `null` matches a missing field.
fn equals_any(candidates: &[&Value], operand: &Value) -> bool {
    if candidates.is_empty() {
        return operand.is_null();
    }
    candidates.iter().any(|candidate| {
        values_equal(candidate, operand)
            || matches!(candidate, Value::Array(items) if items.iter().any(|item| values_equal(item, operand)))
    })
}

fn compares(candidates: &[&Value], operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let check = |value: &Value| compare_values(value, operand).is_some_and(&accept);
    candidates.iter().any(|candidate| match *candidate {
        Value::Array(items) => items.iter().any(&check),
        other => check(other),
    })
}

fn in_list(op: &str, candidates: &[&Value], operand: &Value) -> std::result::Result<bool, Rejection> {
    match operand {
        Value::Array(options) => Ok(options.iter().any(|option| equals_any(candidates, option))),
        _ => Err(Rejection::Malformed(format!("{op} requires an array"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn implicit_equality() {
        let d = doc(json!({"t": "d", "n": 3}));
        assert!(matches(&json!({"t": "d"}), &d));
        assert!(!matches(&json!({"t": "p"}), &d));
        assert!(matches(&json!({"t": "d", "n": 3.0}), &d));
    }

    #[test]
    fn missing_field_matches_only_null() {
        let d = doc(json!({"name": "general"}));
        assert!(!matches(&json!({"t": "d"}), &d));
        assert!(matches(&json!({"t": null}), &d));
    }

    #[test]
    fn array_membership_and_paths() {
        let d = doc(json!({"tags": ["a", "b"], "owner": {"id": "u1"}, "members": [{"id": "u2"}]}));
        assert!(matches(&json!({"tags": "b"}), &d));
        assert!(matches(&json!({"owner.id": "u1"}), &d));
        assert!(matches(&json!({"members.id": "u2"}), &d));
        assert!(!matches(&json!({"members.id": "u9"}), &d));
    }

    #[test]
    fn comparison_operators() {
        let d = doc(json!({"age": 30, "name": "ada"}));
        assert!(matches(&json!({"age": {"$gt": 18, "$lte": 30}}), &d));
        assert!(!matches(&json!({"age": {"$lt": 30}}), &d));
        assert!(matches(&json!({"name": {"$gte": "a"}}), &d));
        // incomparable types never satisfy a range
        assert!(!matches(&json!({"name": {"$gt": 5}}), &d));
        assert!(matches(&json!({"age": {"$ne": 31}}), &d));
        assert!(matches(&json!({"age": {"$eq": 30}}), &d));
    }

    #[test]
    fn set_membership() {
        let d = doc(json!({"t": "c"}));
        assert!(matches(&json!({"t": {"$in": ["c", "d"]}}), &d));
        assert!(!matches(&json!({"t": {"$nin": ["c", "d"]}}), &d));
        assert!(matches(&json!({"missing": {"$in": [null]}}), &d));
    }

    #[test]
    fn exists() {
        let d = doc(json!({"archived": false}));
        assert!(matches(&json!({"archived": {"$exists": true}}), &d));
        assert!(matches(&json!({"deleted": {"$exists": false}}), &d));
        assert!(!matches(&json!({"deleted": {"$exists": true}}), &d));
    }

    #[test]
    fn logical_operators() {
        let d = doc(json!({"t": "d", "ro": true}));
        assert!(matches(&json!({"$or": [{"t": "p"}, {"t": "d"}]}), &d));
        assert!(!matches(&json!({"$and": [{"t": "d"}, {"ro": false}]}), &d));
        assert!(matches(&json!({"$nor": [{"t": "p"}, {"t": "c"}]}), &d));
        assert!(matches(&json!({"$not": {"t": "p"}}), &d));
        assert!(matches(&json!({"t": {"$not": {"$in": ["p", "c"]}}}), &d));
    }

    #[test]
    fn unsupported_operator_fails_closed() {
        let d = doc(json!({"name": "general", "t": "c"}));
        assert!(!matches(&json!({"name": {"$regex": "^gen"}}), &d));
        // negation does not turn an unsupported clause into a match
        assert!(!matches(&json!({"$nor": [{"name": {"$regex": "x"}}]}), &d));
        assert!(!matches(&json!({"$or": [{"t": "c"}, {"$where": "true"}]}), &d));
    }

    #[test]
    fn malformed_operands_fail_closed() {
        let d = doc(json!({"t": "c"}));
        assert!(!matches(&json!({"t": {"$in": "c"}}), &d));
        assert!(!matches(&json!({"$and": []}), &d));
        assert!(!matches(&json!(["t"]), &d));
    }

    #[test]
    fn mixed_conditions_fail_closed_in_any_key_order() {
        let d = doc(json!({"a": {"x": 1, "$gt": 2}}));
        // the literal equal to the field is still not a literal match
        assert!(!matches(&json!({"a": {"x": 1, "$gt": 2}}), &d));
        assert!(!matches(&json!({"a": {"$gt": 2, "x": 1}}), &d));
        assert!(!matches(&json!({"a": {"$gt": 0, "x": 1}}), &doc(json!({"a": 5}))));
    }

    #[test]
    fn validate_rejects_mixed_conditions() {
        for filter in [
            json!({"a": {"x": 1, "$gt": 2}}),
            json!({"a": {"$gt": 2, "x": 1}}),
            json!({"$or": [{"t": "d"}, {"a": {"$in": [1], "b": 2}}]}),
            json!({"a": {"$not": {"$gt": 1, "x": 1}}}),
        ] {
            assert!(matches!(validate(&filter), Err(Error::InvalidFilter(_))), "{filter}");
        }
    }

    #[test]
    fn validate_accepts_operators_and_literals() {
        assert!(validate(&json!({"a": {"$gt": 2, "$lt": 9}, "b": {"x": 1}})).is_ok());
        assert!(validate(&json!({"$and": [{"t": "d"}], "$not": {"ro": true}})).is_ok());
        // literals inside $in may look like anything
        assert!(validate(&json!({"a": {"$in": [{"x": 1, "$gt": 2}]}})).is_ok());
        assert!(validate(&json!({"a": {}})).is_ok());
    }

    #[test]
    fn scan_reports_unknown_operators() {
        let filter = json!({
            "$or": [{"name": {"$regex": "x"}}, {"t": "d"}],
            "age": {"$gt": 1, "$mod": [2, 0]},
            "$text": {"$search": "hi"}
        });
        let mut found = unsupported_operators(&filter);
        found.sort();
        assert_eq!(found, vec!["$mod", "$regex", "$text"]);
        assert!(unsupported_operators(&json!({"t": {"$in": ["a"]}})).is_empty());
    }
}
