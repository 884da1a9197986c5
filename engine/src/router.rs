//! Routing of source documents into logical tables.
//!
//! A routing rule defines one logical table over a source collection. The
//! rule has an optional filter and either a projection or a pipeline. Rules
//! are independent, so one document can land in several tables (discriminated
//! union routing) or in none.

use crate::change::{key_of, ChangeEvent, ChangeKind};
use crate::document::{values_equal, Document};
use crate::error::{Error, Result};
use crate::filter;
use crate::pipeline::Pipeline;
use crate::projection::Projection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One logical-table definition, as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    pub logical_table_name: String,
    pub source_collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Value>,
}

impl RoutingRule {
    /// A rule that copies every document of `source` into `table`.
    pub fn new(table: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            logical_table_name: table.into(),
            source_collection: source.into(),
            filter: None,
            projection: None,
            pipeline: None,
        }
    }

    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_projection(mut self, projection: Value) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_pipeline(mut self, pipeline: Value) -> Self {
        self.pipeline = Some(pipeline);
        self
    }
}

#[derive(Debug, Clone)]
enum Transform {
    Identity,
    Project(Projection),
    Pipeline(Pipeline),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: RoutingRule,
    transform: Transform,
}

impl CompiledRule {
    fn compile(rule: RoutingRule) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidRule {
            table: rule.logical_table_name.clone(),
            reason,
        };
        if let Some(filter) = &rule.filter {
            if !filter.is_object() {
                return Err(invalid(format!("filter must be an object, got {filter}")));
            }
            filter::validate(filter).map_err(|e| invalid(e.to_string()))?;
        }
        let transform = match (&rule.projection, &rule.pipeline) {
            (Some(_), Some(_)) => {
                return Err(invalid("projection and pipeline are mutually exclusive".into()))
            }
            (Some(spec), None) => {
                Transform::Project(Projection::parse(spec).map_err(|e| invalid(e.to_string()))?)
            }
            (None, Some(spec)) => {
                Transform::Pipeline(Pipeline::parse(spec).map_err(|e| invalid(e.to_string()))?)
            }
            (None, None) => Transform::Identity,
        };

        let mut unsupported = rule
            .filter
            .as_ref()
            .map(filter::unsupported_operators)
            .unwrap_or_default();
        if let Transform::Pipeline(pipeline) = &transform {
            unsupported.extend(pipeline.unsupported_operators());
        }
        if !unsupported.is_empty() {
            tracing::warn!(
                table = %rule.logical_table_name,
                operators = ?unsupported,
                "routing rule uses unsupported operators and will never match"
            );
        }

        Ok(Self { rule, transform })
    }

    fn apply(&self, doc: &Document) -> Vec<Document> {
        if let Some(predicate) = &self.rule.filter {
            if !filter::matches(predicate, doc) {
                return Vec::new();
            }
        }
        match &self.transform {
            Transform::Identity => vec![doc.clone()],
            Transform::Project(projection) => vec![projection.apply(doc)],
            Transform::Pipeline(pipeline) => pipeline.run(doc),
        }
    }
}

/// A document routed into one logical table.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedDocument<'a> {
    pub table: &'a str,
    pub document: Document,
}

/// Immutable set of routing rules.
#[derive(Debug, Clone, Default)]
pub struct TableRouter {
    rules: Vec<CompiledRule>,
}

impl TableRouter {
    /// Compile the rules, in configuration order.
    ///
    /// Structural errors are rejected here. Unsupported operators are only
    /// logged, and make the affected rule fail closed when evaluated.
    pub fn new(rules: Vec<RoutingRule>) -> Result<Self> {
        let mut compiled: Vec<CompiledRule> = Vec::with_capacity(rules.len());
        for rule in rules {
            if compiled
                .iter()
                .any(|c| c.rule.logical_table_name == rule.logical_table_name)
            {
                return Err(Error::InvalidRule {
                    table: rule.logical_table_name,
                    reason: "duplicate logical table name".into(),
                });
            }
            compiled.push(CompiledRule::compile(rule)?);
        }
        Ok(Self { rules: compiled })
    }

    /// The configured rules.
    pub fn rules(&self) -> impl Iterator<Item = &RoutingRule> {
        self.rules.iter().map(|c| &c.rule)
    }

    /// Distinct source collections, in first-seen order.
    pub fn source_collections(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for rule in self.rules() {
            if !seen.contains(&rule.source_collection.as_str()) {
                seen.push(&rule.source_collection);
            }
        }
        seen
    }

    /// Logical tables fed by `source`.
    pub fn tables_for<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.rules()
            .filter(move |r| r.source_collection == source)
            .map(|r| r.logical_table_name.as_str())
    }

    /// Route one document of `source` into every matching table.
    pub fn route(&self, doc: &Document, source: &str) -> Vec<RoutedDocument<'_>> {
        self.rules
            .iter()
            .filter(|c| c.rule.source_collection == source)
            .flat_map(|c| {
                c.apply(doc).into_iter().map(|document| RoutedDocument {
                    table: c.rule.logical_table_name.as_str(),
                    document,
                })
            })
            .collect()
    }

    /// Translate one raw change into per-table changes.
    ///
    /// The returned events keep the source event's resume position and have
    /// their namespace rewritten to the logical table. Routed outputs are
    /// keyed by their own `_id`, falling back to the source document key.
    ///
    /// - insert: the new image is routed and each output becomes an insert.
    /// - update: old and new images are routed separately. Outputs present on
    ///   both sides become updates (dropped when the projected images are
    ///   identical), new-only outputs become inserts, and old-only outputs
    ///   become deletes. Fails without a before-image.
    /// - replace: new outputs become replaces. Tables the old image matched
    ///   but the new one does not receive deletes; without a before-image
    ///   every unmatched table of the collection receives a delete.
    /// - delete: the before-image is routed when present; otherwise every
    ///   table of the collection receives the delete.
    /// - drop: every table of the collection is dropped.
    pub fn route_change(&self, event: &ChangeEvent) -> Result<Vec<ChangeEvent>> {
        let source = event.namespace.coll.as_str();
        let mut routed = Vec::new();
        for compiled in self.rules.iter().filter(|c| c.rule.source_collection == source) {
            let table = compiled.rule.logical_table_name.as_str();
            let template = |kind: ChangeKind| ChangeEvent {
                kind,
                namespace: event.namespace.with_collection(table),
                document_key: None,
                full_document: None,
                before: None,
                resume_position: event.resume_position.clone(),
            };
            let key_for = |doc: &Document| key_of(doc).or_else(|| event.document_key.clone());

            match event.kind {
                ChangeKind::Insert => {
                    let after = require_full(event)?;
                    for doc in compiled.apply(after) {
                        let mut out = template(ChangeKind::Insert);
                        out.document_key = key_for(&doc);
                        out.full_document = Some(doc);
                        routed.push(out);
                    }
                }
                ChangeKind::Update => {
                    let before = event.before.as_ref().ok_or_else(|| Error::MissingBeforeImage {
                        namespace: event.namespace.to_string(),
                    })?;
                    let after = require_full(event)?;
                    let mut old_docs = compiled.apply(before);
                    for new_doc in compiled.apply(after) {
                        let key = key_for(&new_doc);
                        let counterpart = old_docs.iter().position(|old| key_for(old) == key);
                        match counterpart.map(|i| old_docs.remove(i)) {
                            Some(old_doc) => {
                                if values_equal(&Value::Object(old_doc.clone()), &Value::Object(new_doc.clone())) {
                                    continue;
                                }
                                let mut out = template(ChangeKind::Update);
                                out.document_key = key;
                                out.before = Some(old_doc);
                                out.full_document = Some(new_doc);
                                routed.push(out);
                            }
                            None => {
                                let mut out = template(ChangeKind::Insert);
                                out.document_key = key;
                                out.full_document = Some(new_doc);
                                routed.push(out);
                            }
                        }
                    }
                    for old_doc in old_docs {
                        let mut out = template(ChangeKind::Delete);
                        out.document_key = key_for(&old_doc);
                        routed.push(out);
                    }
                }
                ChangeKind::Replace => {
                    let after = require_full(event)?;
                    let new_docs = compiled.apply(after);
                    let stale = match &event.before {
                        Some(before) => compiled
                            .apply(before)
                            .iter()
                            .map(|doc| key_for(doc))
                            .filter(|key| !new_docs.iter().any(|doc| key_for(doc) == *key))
                            .collect(),
                        None if new_docs.is_empty() => vec![event.document_key.clone()],
                        None => Vec::new(),
                    };
                    for key in stale {
                        let mut out = template(ChangeKind::Delete);
                        out.document_key = key;
                        routed.push(out);
                    }
                    for doc in new_docs {
                        let mut out = template(ChangeKind::Replace);
                        out.document_key = key_for(&doc);
                        out.full_document = Some(doc);
                        routed.push(out);
                    }
                }
                ChangeKind::Delete => match &event.before {
                    Some(before) => {
                        for doc in compiled.apply(before) {
                            let mut out = template(ChangeKind::Delete);
                            out.document_key = key_for(&doc);
                            routed.push(out);
                        }
                    }
                    None => {
                        let mut out = template(ChangeKind::Delete);
                        out.document_key = event.document_key.clone();
                        routed.push(out);
                    }
                },
                ChangeKind::Drop => routed.push(template(ChangeKind::Drop)),
            }
        }
        Ok(routed)
    }
}

fn require_full(event: &ChangeEvent) -> Result<&Document> {
    event.full_document.as_ref().ok_or_else(|| Error::MissingDocument {
        operation: event.kind.as_str(),
        namespace: event.namespace.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{Namespace, ResumePosition};
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().expect("object")
    }

    fn rooms_router() -> TableRouter {
        TableRouter::new(vec![
            RoutingRule::new("direct_rooms", "rooms").with_filter(json!({"t": "d"})),
            RoutingRule::new("private_rooms", "rooms")
                .with_filter(json!({"t": "p"}))
                .with_projection(json!({"name": 1, "t": 1})),
            RoutingRule::new("users", "users"),
        ])
        .unwrap()
    }

    fn tables(routed: &[RoutedDocument<'_>]) -> Vec<String> {
        routed.iter().map(|r| r.table.to_string()).collect()
    }

    #[test]
    fn discriminated_union_routing() {
        let router = rooms_router();
        assert_eq!(tables(&router.route(&doc(json!({"t": "d"})), "rooms")), vec!["direct_rooms"]);
        assert!(router.route(&doc(json!({"name": "x"})), "rooms").is_empty());
        assert!(router.route(&doc(json!({"t": "d"})), "messages").is_empty());
    }

    #[test]
    fn fan_out_to_many_tables() {
        let router = TableRouter::new(vec![
            RoutingRule::new("all_rooms", "rooms"),
            RoutingRule::new("direct_rooms", "rooms").with_filter(json!({"t": "d"})),
        ])
        .unwrap();
        let routed = router.route(&doc(json!({"_id": 1, "t": "d"})), "rooms");
        assert_eq!(tables(&routed), vec!["all_rooms", "direct_rooms"]);
    }

    #[test]
    fn projection_applies_after_match() {
        let router = rooms_router();
        let routed = router.route(&doc(json!({"_id": "r1", "t": "p", "name": "n", "secret": 1})), "rooms");
        assert_eq!(Value::Object(routed[0].document.clone()), json!({"_id": "r1", "t": "p", "name": "n"}));
    }

    #[test]
    fn invalid_rules_are_rejected() {
        let both = RoutingRule::new("t", "c")
            .with_projection(json!({"a": 1}))
            .with_pipeline(json!([]));
        assert!(TableRouter::new(vec![both]).is_err());

        let mixed = RoutingRule::new("t", "c").with_projection(json!({"a": 1, "b": 0}));
        assert!(TableRouter::new(vec![mixed]).is_err());

        let dup = vec![RoutingRule::new("t", "a"), RoutingRule::new("t", "b")];
        assert!(TableRouter::new(dup).is_err());

        for filter in [json!({"a": {"x": 1, "$gt": 2}}), json!({"a": {"$gt": 2, "x": 1}})] {
            let ambiguous = RoutingRule::new("t", "c").with_filter(filter);
            assert!(matches!(
                TableRouter::new(vec![ambiguous]),
                Err(Error::InvalidRule { .. })
            ));
        }

        let staged = RoutingRule::new("t", "c").with_pipeline(json!([{"$match": {"a": {"$gt": 2, "x": 1}}}]));
        assert!(TableRouter::new(vec![staged]).is_err());
    }

    #[test]
    fn unsupported_operator_rule_loads_but_never_matches() {
        let router = TableRouter::new(vec![
            RoutingRule::new("typo", "rooms").with_filter(json!({"t": {"$equals": "d"}})),
        ])
        .unwrap();
        assert!(router.route(&doc(json!({"t": "d"})), "rooms").is_empty());
    }

    fn ns() -> Namespace {
        Namespace::new("chat", "rooms")
    }

    #[test]
    fn update_moving_between_tables() {
        let router = rooms_router();
        let event = ChangeEvent::update(
            ns(),
            Some(doc(json!({"_id": "r1", "t": "d"}))),
            doc(json!({"_id": "r1", "t": "p", "name": "n"})),
        )
        .at(ResumePosition::new("tok-1"));

        let routed = router.route_change(&event).unwrap();
        assert_eq!(routed.len(), 2);
        assert_eq!(routed[0].kind, ChangeKind::Delete);
        assert_eq!(routed[0].namespace.coll, "direct_rooms");
        assert_eq!(routed[1].kind, ChangeKind::Insert);
        assert_eq!(routed[1].namespace.coll, "private_rooms");
        assert!(routed.iter().all(|e| e.resume_position == Some(ResumePosition::new("tok-1"))));
    }

    #[test]
    fn update_within_table_and_noop_projection() {
        let router = rooms_router();
        let event = ChangeEvent::update(
            ns(),
            Some(doc(json!({"_id": "r1", "t": "p", "name": "a", "secret": 1}))),
            doc(json!({"_id": "r1", "t": "p", "name": "b", "secret": 1})),
        );
        let routed = router.route_change(&event).unwrap();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].kind, ChangeKind::Update);
        assert_eq!(routed[0].before.as_ref().unwrap()["name"], json!("a"));

        // only a projected-away field changed
        let event = ChangeEvent::update(
            ns(),
            Some(doc(json!({"_id": "r1", "t": "p", "name": "a", "secret": 1}))),
            doc(json!({"_id": "r1", "t": "p", "name": "a", "secret": 2})),
        );
        assert!(router.route_change(&event).unwrap().is_empty());
    }

    #[test]
    fn update_without_before_image_fails() {
        let router = rooms_router();
        let event = ChangeEvent::update(ns(), None, doc(json!({"_id": "r1", "t": "d"})));
        let err = router.route_change(&event).unwrap_err();
        assert!(matches!(err, Error::MissingBeforeImage { .. }));
    }

    #[test]
    fn delete_without_before_image_fans_out() {
        let router = rooms_router();
        let event = ChangeEvent::delete(ns(), doc(json!({"_id": "r1"})));
        let routed = router.route_change(&event).unwrap();
        let names: Vec<_> = routed.iter().map(|e| e.namespace.coll.as_str()).collect();
        assert_eq!(names, vec!["direct_rooms", "private_rooms"]);

        let event = event.with_before(doc(json!({"_id": "r1", "t": "d"})));
        let routed = router.route_change(&event).unwrap();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].namespace.coll, "direct_rooms");
    }

    #[test]
    fn replace_without_before_image_clears_other_tables() {
        let router = rooms_router();
        let event = ChangeEvent::replace(ns(), None, doc(json!({"_id": "r1", "t": "d"})));
        let routed = router.route_change(&event).unwrap();
        let kinds: Vec<_> = routed.iter().map(|e| (e.kind, e.namespace.coll.as_str())).collect();
        assert_eq!(
            kinds,
            vec![(ChangeKind::Replace, "direct_rooms"), (ChangeKind::Delete, "private_rooms")]
        );
    }

    #[test]
    fn pipeline_outputs_are_keyed_by_their_own_id() {
        let router = TableRouter::new(vec![RoutingRule::new("room_members", "rooms").with_pipeline(json!([
            {"$unwind": "$members"},
            {"$addFields": {"_id": {"$concat": ["$_id", ":", "$members"]}, "room": "$_id"}},
            {"$project": {"room": 1, "members": 1}}
        ]))])
        .unwrap();
        let event = ChangeEvent::update(
            ns(),
            Some(doc(json!({"_id": "r1", "members": ["u1", "u2"]}))),
            doc(json!({"_id": "r1", "members": ["u2", "u3"]})),
        );
        let routed = router.route_change(&event).unwrap();
        let summary: Vec<_> = routed
            .iter()
            .map(|e| (e.kind, e.document_key.as_ref().unwrap()["_id"].clone()))
            .collect();
        assert_eq!(
            summary,
            vec![(ChangeKind::Insert, json!("r1:u3")), (ChangeKind::Delete, json!("r1:u1"))]
        );
    }

    #[test]
    fn drop_reaches_every_table_of_collection() {
        let router = rooms_router();
        let routed = router.route_change(&ChangeEvent::drop(ns())).unwrap();
        assert_eq!(routed.len(), 2);
        assert!(routed.iter().all(|e| e.kind == ChangeKind::Drop));
    }

    #[test]
    fn source_collections_in_order() {
        assert_eq!(rooms_router().source_collections(), vec!["rooms", "users"]);
        assert_eq!(rooms_router().tables_for("users").collect::<Vec<_>>(), vec!["users"]);
    }
}
