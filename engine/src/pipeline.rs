//! Short transform pipelines.
//!
//! A pipeline runs its stages in order over a working list that starts as the
//! single input document. Supported stages are `$match`, `$unwind`,
//! `$addFields` (alias `$set`) and `$project`. Once the list is empty the
//! remaining stages are skipped.
//!
//! Unknown stages and unsupported expression operators fail closed: the
//! pipeline yields no documents and a warning is logged.

use crate::document::{get_path, remove_path, set_path, Document};
use crate::error::{Error, Result};
use crate::expression::{self, ExprError};
use crate::filter;
use crate::projection::Projection;
use serde_json::{Map, Value};

/// `$unwind` options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwind {
    /// Path of the array field, without the leading `$`.
    pub path: String,
    /// Field receiving the element's index in the source array.
    pub include_array_index: Option<String>,
    /// Keep documents whose array is missing, null or empty.
    pub preserve_null_and_empty_arrays: bool,
}

/// One pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Value),
    Unwind(Unwind),
    AddFields(Map<String, Value>),
    Project(Projection),
    /// A stage this evaluator does not implement.
    Unsupported(String),
}

/// A parsed pipeline.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Parse a pipeline specification: an array of single-key stage objects.
    ///
    /// Structural problems (a stage that is not a single-key object, a
    /// malformed `$unwind`, an invalid `$project`) are errors. Unknown stage
    /// names are kept as [`Stage::Unsupported`] and fail closed at run time.
    pub fn parse(spec: &Value) -> Result<Self> {
        let Value::Array(items) = spec else {
            return Err(Error::InvalidPipeline("pipeline must be an array".into()));
        };
        let stages = items.iter().map(parse_stage).collect::<Result<Vec<_>>>()?;
        Ok(Self { stages })
    }

    /// The parsed stages.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run the pipeline over one document.
    pub fn run(&self, doc: &Document) -> Vec<Document> {
        let mut docs = vec![doc.clone()];
        for stage in &self.stages {
            if docs.is_empty() {
                break;
            }
            docs = match stage {
                Stage::Match(predicate) => docs
                    .into_iter()
                    .filter(|d| filter::matches(predicate, d))
                    .collect(),
                Stage::Unwind(unwind) => docs.iter().flat_map(|d| unwind.apply(d)).collect(),
                Stage::AddFields(fields) => match add_fields(fields, docs) {
                    Ok(docs) => docs,
                    Err(err) => {
                        tracing::warn!(error = %err, "$addFields failed, dropping documents");
                        return Vec::new();
                    }
                },
                Stage::Project(projection) => docs.iter().map(|d| projection.apply(d)).collect(),
                Stage::Unsupported(name) => {
                    tracing::warn!(stage = %name, "unsupported pipeline stage, dropping documents");
                    return Vec::new();
                }
            };
        }
        docs
    }

    /// Stage and operator names that would make the pipeline fail closed.
    pub fn unsupported_operators(&self) -> Vec<String> {
        let mut found = Vec::new();
        for stage in &self.stages {
            match stage {
                Stage::Match(predicate) => found.extend(filter::unsupported_operators(predicate)),
                Stage::AddFields(fields) => {
                    for expr in fields.values() {
                        found.extend(expression::unsupported_operators(expr));
                    }
                }
                Stage::Unsupported(name) => found.push(name.clone()),
                Stage::Unwind(_) | Stage::Project(_) => {}
            }
        }
        found
    }
}

fn parse_stage(stage: &Value) -> Result<Stage> {
    let (name, body) = match stage {
        Value::Object(map) if map.len() == 1 => map.iter().next().ok_or_else(|| {
            Error::InvalidPipeline("empty stage".into())
        })?,
        other => {
            return Err(Error::InvalidPipeline(format!(
                "each stage must be an object with exactly one key, got {other}"
            )))
        }
    };
    match name.as_str() {
        "$match" => match body {
            Value::Object(_) => {
                filter::validate(body).map_err(|e| Error::InvalidPipeline(format!("$match: {e}")))?;
                Ok(Stage::Match(body.clone()))
            }
            _ => Err(Error::InvalidPipeline("$match requires an object".into())),
        },
        "$unwind" => Unwind::parse(body).map(Stage::Unwind),
        "$addFields" | "$set" => match body {
            Value::Object(fields) => Ok(Stage::AddFields(fields.clone())),
            _ => Err(Error::InvalidPipeline(format!("{name} requires an object"))),
        },
        "$project" => Projection::parse(body).map(Stage::Project),
        other => Ok(Stage::Unsupported(other.to_string())),
    }
}

fn add_fields(
    fields: &Map<String, Value>,
    docs: Vec<Document>,
) -> std::result::Result<Vec<Document>, ExprError> {
    docs.into_iter()
        .map(|mut doc| -> std::result::Result<Document, ExprError> {
            let mut computed = Vec::with_capacity(fields.len());
            for (field, expr) in fields {
                computed.push((field, expression::evaluate(expr, &doc)?));
            }
            for (field, value) in computed {
                match value {
                    Some(value) => set_path(&mut doc, field, value),
                    None => {
                        remove_path(&mut doc, field);
                    }
                }
            }
            Ok(doc)
        })
        .collect()
}

impl Unwind {
    fn parse(body: &Value) -> Result<Self> {
        let field_path = |raw: &str| -> Result<String> {
            raw.strip_prefix('$')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidPipeline(format!("$unwind path must start with '$', got '{raw}'")))
        };
        match body {
            Value::String(raw) => Ok(Self {
                path: field_path(raw)?,
                include_array_index: None,
                preserve_null_and_empty_arrays: false,
            }),
            Value::Object(options) => {
                let path = options
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::InvalidPipeline("$unwind requires a path".into()))?;
                let include_array_index = match options.get("includeArrayIndex") {
                    None => None,
                    Some(Value::String(name)) if !name.is_empty() && !name.starts_with('$') => {
                        Some(name.clone())
                    }
                    Some(other) => {
                        return Err(Error::InvalidPipeline(format!(
                            "includeArrayIndex must be a field name, got {other}"
                        )))
                    }
                };
                let preserve_null_and_empty_arrays = match options.get("preserveNullAndEmptyArrays") {
                    None => false,
                    Some(Value::Bool(b)) => *b,
                    Some(other) => {
                        return Err(Error::InvalidPipeline(format!(
                            "preserveNullAndEmptyArrays must be a boolean, got {other}"
                        )))
                    }
                };
                Ok(Self {
                    path: field_path(path)?,
                    include_array_index,
                    preserve_null_and_empty_arrays,
                })
            }
            other => Err(Error::InvalidPipeline(format!(
                "$unwind requires a path or options object, got {other}"
            ))),
        }
    }

    /// Expand one document.
    pub fn apply(&self, doc: &Document) -> Vec<Document> {
        match get_path(doc, &self.path) {
            Some(Value::Array(items)) if !items.is_empty() => items
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    let mut out = doc.clone();
                    set_path(&mut out, &self.path, item.clone());
                    if let Some(field) = &self.include_array_index {
                        set_path(&mut out, field, Value::from(index));
                    }
                    out
                })
                .collect(),
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if !self.preserve_null_and_empty_arrays {
                    return Vec::new();
                }
                let mut out = doc.clone();
                if matches!(get_path(doc, &self.path), Some(Value::Array(_))) {
                    remove_path(&mut out, &self.path);
                }
                if let Some(field) = &self.include_array_index {
                    set_path(&mut out, field, Value::Null);
                }
                vec![out]
            }
            Some(_) => {
                let mut out = doc.clone();
                if let Some(field) = &self.include_array_index {
                    set_path(&mut out, field, Value::Null);
                }
                vec![out]
            }
        }
    }
}
