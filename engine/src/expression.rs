//! Expressions computed by `$addFields`.
//!
//! Supported forms:
//!
//! - field references: `"$owner.name"`; a missing field evaluates to missing
//! - literals, arrays and nested objects of expressions
//! - `$literal`, `$concat`, `$ifNull`, `$cond`
//! - comparisons: `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`
//! - arithmetic: `$add`, `$subtract`, `$multiply`, `$divide`
//! - logic: `$and`, `$or`, `$not`

use crate::document::{compare_values, get_path, is_truthy, values_equal, Document};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// Why an expression could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    #[error("unsupported expression operator {0}")]
    Unsupported(String),
    #[error("malformed expression: {0}")]
    Malformed(String),
}

type Eval = std::result::Result<Option<Value>, ExprError>;

/// Evaluate `expr` against `doc`. `Ok(None)` means the result is missing.
pub fn evaluate(expr: &Value, doc: &Document) -> Eval {
    match expr {
        Value::String(s) => match s.strip_prefix('$') {
            Some(path) if !path.starts_with('$') => Ok(get_path(doc, path).cloned()),
            _ => Ok(Some(expr.clone())),
        },
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate(item, doc)?.unwrap_or(Value::Null));
            }
            Ok(Some(Value::Array(out)))
        }
        Value::Object(map) => match single_operator(map) {
            Some((op, args)) => apply(op, args, doc),
            None => {
                let mut out = Map::new();
                for (key, value) in map {
                    if let Some(v) = evaluate(value, doc)? {
                        out.insert(key.clone(), v);
                    }
                }
                Ok(Some(Value::Object(out)))
            }
        },
        _ => Ok(Some(expr.clone())),
    }
}

fn single_operator(map: &Map<String, Value>) -> Option<(&str, &Value)> {
    let (key, value) = map.iter().next()?;
    (map.len() == 1 && key.starts_with('$')).then_some((key.as_str(), value))
}

/// Operators in `expr` that evaluation would reject.
pub fn unsupported_operators(expr: &Value) -> Vec<String> {
    let mut found = Vec::new();
    scan(expr, &mut found);
    found
}

fn scan(expr: &Value, found: &mut Vec<String>) {
    match expr {
        Value::Array(items) => items.iter().for_each(|item| scan(item, found)),
        Value::Object(map) => match single_operator(map) {
            Some(("$literal", _)) => {}
            Some((op, args)) => {
                if !OPERATORS.contains(&op) {
                    found.push(op.to_string());
                }
                scan(args, found);
            }
            None => map.values().for_each(|value| scan(value, found)),
        },
        _ => {}
    }
}

const OPERATORS: &[&str] = &[
    "$literal", "$concat", "$ifNull", "$cond", "$eq", "$ne", "$gt", "$gte", "$lt", "$lte",
    "$add", "$subtract", "$multiply", "$divide", "$and", "$or", "$not",
];

fn apply(op: &str, args: &Value, doc: &Document) -> Eval {
    match op {
        "$literal" => Ok(Some(args.clone())),
        "$concat" => {
            let mut out = String::new();
            for value in evaluate_all(args, doc)? {
                match value {
                    Some(Value::String(s)) => out.push_str(&s),
                    Some(Value::Null) | None => return Ok(Some(Value::Null)),
                    Some(other) => {
                        return Err(ExprError::Malformed(format!(
                            "$concat only supports strings, got {other}"
                        )))
                    }
                }
            }
            Ok(Some(Value::String(out)))
        }
        "$ifNull" => {
            let values = evaluate_all(args, doc)?;
            let [value, fallback] = pair(op, values)?;
            match value {
                Some(Value::Null) | None => Ok(fallback),
                present => Ok(present),
            }
        }
        "$cond" => {
            let (cond, then, otherwise) = cond_branches(args)?;
            let test = evaluate(cond, doc)?.is_some_and(|v| is_truthy(&v));
            evaluate(if test { then } else { otherwise }, doc)
        }
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
            let [left, right] = pair(op, evaluate_all(args, doc)?)?;
            let left = left.unwrap_or(Value::Null);
            let right = right.unwrap_or(Value::Null);
            let result = match op {
                "$eq" => values_equal(&left, &right),
                "$ne" => !values_equal(&left, &right),
                _ => compare_values(&left, &right).is_some_and(|ord| match op {
                    "$gt" => ord == Ordering::Greater,
                    "$gte" => ord != Ordering::Less,
                    "$lt" => ord == Ordering::Less,
                    _ => ord != Ordering::Greater,
                }),
            };
            Ok(Some(Value::Bool(result)))
        }
        "$add" | "$multiply" => {
            let mut numbers = Vec::new();
            for value in evaluate_all(args, doc)? {
                match value {
                    Some(Value::Null) | None => return Ok(Some(Value::Null)),
                    Some(v) => numbers.push(as_number(op, &v)?),
                }
            }
            let identity = if op == "$add" { Num::Int(0) } else { Num::Int(1) };
            let total = numbers.into_iter().fold(identity, |acc, n| {
                if op == "$add" {
                    acc.add(n)
                } else {
                    acc.mul(n)
                }
            });
            Ok(Some(total.into_value()))
        }
        "$subtract" | "$divide" => {
            let [left, right] = pair(op, evaluate_all(args, doc)?)?;
            let (Some(left), Some(right)) = (left, right) else {
                return Ok(Some(Value::Null));
            };
            if left.is_null() || right.is_null() {
                return Ok(Some(Value::Null));
            }
            let (left, right) = (as_number(op, &left)?, as_number(op, &right)?);
            if op == "$subtract" {
                return Ok(Some(left.sub(right).into_value()));
            }
            let divisor = right.as_f64();
            if divisor == 0.0 {
                return Err(ExprError::Malformed("$divide by zero".into()));
            }
            Ok(Some(Num::Float(left.as_f64() / divisor).into_value()))
        }
        "$and" | "$or" => {
            let values = evaluate_all(args, doc)?;
            let truthy = values.iter().map(|v| v.as_ref().is_some_and(is_truthy));
            let result = if op == "$and" {
                truthy.fold(true, |a, b| a && b)
            } else {
                truthy.fold(false, |a, b| a || b)
            };
            Ok(Some(Value::Bool(result)))
        }
        "$not" => {
            let values = evaluate_all(args, doc)?;
            let [value] = <[Option<Value>; 1]>::try_from(values)
                .map_err(|_| ExprError::Malformed("$not takes one argument".into()))?;
            Ok(Some(Value::Bool(!value.as_ref().is_some_and(is_truthy))))
        }
        other => Err(ExprError::Unsupported(other.to_string())),
    }
}

/// Evaluate an operator's argument list. A single non-array argument is
/// treated as a one-element list.
fn evaluate_all(args: &Value, doc: &Document) -> std::result::Result<Vec<Option<Value>>, ExprError> {
    match args {
        Value::Array(items) => items.iter().map(|item| evaluate(item, doc)).collect(),
        single => Ok(vec![evaluate(single, doc)?]),
    }
}

fn pair(op: &str, values: Vec<Option<Value>>) -> std::result::Result<[Option<Value>; 2], ExprError> {
    <[Option<Value>; 2]>::try_from(values)
        .map_err(|_| ExprError::Malformed(format!("{op} takes exactly two arguments")))
}

fn cond_branches(args: &Value) -> std::result::Result<(&Value, &Value, &Value), ExprError> {
    match args {
        Value::Array(items) if items.len() == 3 => Ok((&items[0], &items[1], &items[2])),
        Value::Object(map) => match (map.get("if"), map.get("then"), map.get("else")) {
            (Some(c), Some(t), Some(e)) => Ok((c, t, e)),
            _ => Err(ExprError::Malformed("$cond requires if, then and else".into())),
        },
        _ => Err(ExprError::Malformed("$cond requires three branches".into())),
    }
}

/// Integer-preserving arithmetic.
#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn add(self, other: Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a.checked_add(b).map_or(Num::Float(a as f64 + b as f64), Num::Int),
            (a, b) => Num::Float(a.as_f64() + b.as_f64()),
        }
    }

    fn sub(self, other: Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a.checked_sub(b).map_or(Num::Float(a as f64 - b as f64), Num::Int),
            (a, b) => Num::Float(a.as_f64() - b.as_f64()),
        }
    }

    fn mul(self, other: Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a.checked_mul(b).map_or(Num::Float(a as f64 * b as f64), Num::Int),
            (a, b) => Num::Float(a.as_f64() * b.as_f64()),
        }
    }

    fn into_value(self) -> Value {
        match self {
            Num::Int(i) => Value::Number(i.into()),
            Num::Float(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        }
    }
}

fn as_number(op: &str, value: &Value) -> std::result::Result<Num, ExprError> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Num::Int(i)),
            None => n
                .as_f64()
                .map(Num::Float)
                .ok_or_else(|| ExprError::Malformed(format!("{op}: {n} is out of range"))),
        },
        other => Err(ExprError::Malformed(format!("{op} only supports numbers, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Document {
        json!({"first": "Ada", "last": "Lovelace", "qty": 3, "price": 2.5, "t": "d", "nested": {"v": 1}})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn eval(expr: Value) -> Option<Value> {
        evaluate(&expr, &doc()).unwrap()
    }

    #[test]
    fn field_refs_and_literals() {
        assert_eq!(eval(json!("$first")), Some(json!("Ada")));
        assert_eq!(eval(json!("$nested.v")), Some(json!(1)));
        assert_eq!(eval(json!("$missing")), None);
        assert_eq!(eval(json!("plain")), Some(json!("plain")));
        assert_eq!(eval(json!({"$literal": "$first"})), Some(json!("$first")));
        assert_eq!(eval(json!({"a": "$qty", "b": "$missing"})), Some(json!({"a": 3})));
    }

    #[test]
    fn concat() {
        assert_eq!(eval(json!({"$concat": ["$first", " ", "$last"]})), Some(json!("Ada Lovelace")));
        assert_eq!(eval(json!({"$concat": ["$first", "$missing"]})), Some(Value::Null));
        assert!(evaluate(&json!({"$concat": ["$qty"]}), &doc()).is_err());
    }

    #[test]
    fn arithmetic() {
        assert_eq!(eval(json!({"$add": ["$qty", 2]})), Some(json!(5)));
        assert_eq!(eval(json!({"$multiply": ["$qty", "$price"]})), Some(json!(7.5)));
        assert_eq!(eval(json!({"$subtract": ["$qty", 5]})), Some(json!(-2)));
        assert_eq!(eval(json!({"$divide": ["$qty", 2]})), Some(json!(1.5)));
        assert_eq!(eval(json!({"$add": ["$qty", "$missing"]})), Some(Value::Null));
        assert!(evaluate(&json!({"$divide": ["$qty", 0]}), &doc()).is_err());
    }

    #[test]
    fn comparison_and_cond() {
        assert_eq!(eval(json!({"$gt": ["$qty", 2]})), Some(json!(true)));
        assert_eq!(eval(json!({"$eq": ["$t", "p"]})), Some(json!(false)));
        assert_eq!(
            eval(json!({"$cond": [{"$eq": ["$t", "d"]}, "direct", "other"]})),
            Some(json!("direct"))
        );
        assert_eq!(
            eval(json!({"$cond": {"if": {"$lt": ["$qty", 1]}, "then": "none", "else": "some"}})),
            Some(json!("some"))
        );
        assert_eq!(eval(json!({"$ifNull": ["$missing", "fallback"]})), Some(json!("fallback")));
        assert_eq!(eval(json!({"$and": [true, {"$not": [false]}]})), Some(json!(true)));
    }

    #[test]
    fn unsupported_operator() {
        let err = evaluate(&json!({"$toUpper": "$first"}), &doc()).unwrap_err();
        assert_eq!(err, ExprError::Unsupported("$toUpper".into()));
        assert_eq!(
            unsupported_operators(&json!({"x": {"$toUpper": "$first"}, "y": {"$concat": ["a"]}})),
            vec!["$toUpper"]
        );
    }
}
