//! Field projections.
//!
//! A projection is either an inclusion (`{name: 1, "owner.id": 1}`) or an
//! exclusion (`{secret: 0}`). The two cannot be mixed, except that `_id: 0`
//! may appear in an inclusion. Inclusions keep `_id` unless told otherwise.

use crate::document::{get_path, remove_path, set_path, Document};
use crate::error::{Error, Result};
use serde_json::Value;

const ID: &str = "_id";

/// A parsed projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// Keep only the listed paths.
    Inclusion { fields: Vec<String>, include_id: bool },
    /// Drop the listed paths.
    Exclusion { fields: Vec<String> },
}

impl Projection {
    /// Parse a projection specification.
    pub fn parse(spec: &Value) -> Result<Self> {
        let Value::Object(map) = spec else {
            return Err(Error::InvalidProjection(format!(
                "expected an object, got {spec}"
            )));
        };

        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut id_flag = None;

        for (field, flag) in map {
            let include = match flag {
                Value::Bool(b) => *b,
                Value::Number(n) if n.as_f64() == Some(0.0) => false,
                Value::Number(n) if n.as_f64() == Some(1.0) => true,
                other => {
                    return Err(Error::InvalidProjection(format!(
                        "field '{field}' must be 0, 1, true or false, got {other}"
                    )))
                }
            };
            if field == ID {
                id_flag = Some(include);
            } else if include {
                included.push(field.clone());
            } else {
                excluded.push(field.clone());
            }
        }

        match (included.is_empty(), excluded.is_empty()) {
            (false, false) => Err(Error::InvalidProjection(format!(
                "cannot mix inclusion of {included:?} with exclusion of {excluded:?}"
            ))),
            (false, true) => Ok(Projection::Inclusion {
                fields: included,
                include_id: id_flag.unwrap_or(true),
            }),
            // `{_id: 1}` keeps only the id
            (true, true) if id_flag == Some(true) => Ok(Projection::Inclusion {
                fields: Vec::new(),
                include_id: true,
            }),
            (true, _) => {
                if id_flag == Some(false) {
                    excluded.push(ID.to_string());
                }
                Ok(Projection::Exclusion { fields: excluded })
            }
        }
    }

    /// Apply the projection, producing a new document.
    pub fn apply(&self, doc: &Document) -> Document {
        match self {
            Projection::Inclusion { fields, include_id } => {
                let mut out = Document::new();
                if *include_id {
                    if let Some(id) = doc.get(ID) {
                        out.insert(ID.to_string(), id.clone());
                    }
                }
                for path in fields {
                    if let Some(value) = get_path(doc, path) {
                        set_path(&mut out, path, value.clone());
                    }
                }
                out
            }
            Projection::Exclusion { fields } => {
                let mut out = doc.clone();
                for path in fields {
                    remove_path(&mut out, path);
                }
                out
            }
        }
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
    fn inclusion_without_id() {
        let p = Projection::parse(&json!({"name": 1, "_id": 0})).unwrap();
        let out = p.apply(&doc(json!({"_id": "x", "name": "n", "extra": "e"})));
        assert_eq!(Value::Object(out), json!({"name": "n"}));
    }

    #[test]
    fn inclusion_keeps_id_by_default() {
        let p = Projection::parse(&json!({"name": true})).unwrap();
        let out = p.apply(&doc(json!({"_id": 7, "name": "n", "extra": "e"})));
        assert_eq!(Value::Object(out), json!({"_id": 7, "name": "n"}));
    }

    #[test]
    fn nested_inclusion_builds_nested_output() {
        let p = Projection::parse(&json!({"owner.id": 1, "_id": 0})).unwrap();
        let out = p.apply(&doc(json!({"owner": {"id": "u1", "email": "a@b"}, "t": "d"})));
        assert_eq!(Value::Object(out), json!({"owner": {"id": "u1"}}));
    }

    #[test]
    fn exclusion() {
        let p = Projection::parse(&json!({"secret": 0, "meta.internal": 0})).unwrap();
        let out = p.apply(&doc(json!({"_id": 1, "secret": "s", "meta": {"internal": 1, "v": 2}})));
        assert_eq!(Value::Object(out), json!({"_id": 1, "meta": {"v": 2}}));
    }

    #[test]
    fn only_id_exclusion() {
        let p = Projection::parse(&json!({"_id": 0})).unwrap();
        assert_eq!(p, Projection::Exclusion { fields: vec!["_id".into()] });
    }

    #[test]
    fn only_id_inclusion() {
        for spec in [json!({"_id": 1}), json!({"_id": true})] {
            let p = Projection::parse(&spec).unwrap();
            assert_eq!(p, Projection::Inclusion { fields: vec![], include_id: true });
            let out = p.apply(&doc(json!({"_id": "x", "name": "n"})));
            assert_eq!(Value::Object(out), json!({"_id": "x"}));
        }
    }

    #[test]
    fn empty_projection_keeps_everything() {
        let p = Projection::parse(&json!({})).unwrap();
        let out = p.apply(&doc(json!({"_id": "x", "name": "n"})));
        assert_eq!(Value::Object(out), json!({"_id": "x", "name": "n"}));
    }

    #[test]
    fn mixing_is_rejected() {
        let err = Projection::parse(&json!({"name": 1, "secret": 0})).unwrap_err();
        assert!(matches!(err, Error::InvalidProjection(_)));
        assert!(Projection::parse(&json!({"name": "yes"})).is_err());
        assert!(Projection::parse(&json!(["name"])).is_err());
    }
}
