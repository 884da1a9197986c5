//! Mapping from change events to wire messages.
//!
//! Translation is stateless. The relation of every data message comes from
//! the event's own namespace, so routed events (whose namespace names the
//! logical table) translate into messages for that table.

use crate::change::{ChangeEvent, ChangeKind, Namespace};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::protocol::{ChangeMessage, DataChange, IndexSpec, Relation, TableId};
use crate::watermark::Watermark;

/// Stateless change translator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeTranslator;

impl ChangeTranslator {
    pub fn new() -> Self {
        Self
    }

    /// Data messages for one event, without a bracket.
    ///
    /// A replace contributes a delete followed by an insert.
    pub fn data_messages(&self, event: &ChangeEvent) -> Result<Vec<DataChange>> {
        let relation = Relation::from_namespace(&event.namespace);
        let changes = match event.kind {
            ChangeKind::Insert => vec![DataChange::Insert {
                relation,
                new: full_document(event)?.clone(),
            }],
            ChangeKind::Update => {
                let old = event.before.as_ref().ok_or_else(|| Error::MissingBeforeImage {
                    namespace: event.namespace.to_string(),
                })?;
                vec![DataChange::Update {
                    relation,
                    key: document_key(event)?.clone(),
                    old: old.clone(),
                    new: full_document(event)?.clone(),
                }]
            }
            ChangeKind::Replace => {
                let key = document_key(event)?.clone();
                let new = full_document(event)?.clone();
                vec![
                    DataChange::Delete {
                        relation: relation.clone(),
                        key,
                    },
                    DataChange::Insert { relation, new },
                ]
            }
            ChangeKind::Delete => vec![DataChange::Delete {
                relation,
                key: document_key(event)?.clone(),
            }],
            ChangeKind::Drop => vec![DataChange::DropTable {
                id: TableId {
                    schema: event.namespace.db.clone(),
                    name: event.namespace.coll.clone(),
                },
            }],
        };
        Ok(changes)
    }

    /// Messages for one event on its own.
    ///
    /// A replace is bracketed as `[begin, delete, insert, commit]` under
    /// `watermark`, so a subscriber never observes the delete without the
    /// insert. It is rejected when the event carries no resume position.
    /// Every other kind yields bare data messages.
    pub fn translate(&self, event: &ChangeEvent, watermark: &Watermark) -> Result<Vec<ChangeMessage>> {
        if event.kind == ChangeKind::Replace {
            require_position(event)?;
            let data = self.data_messages(event)?;
            let mut messages = Vec::with_capacity(data.len() + 2);
            messages.push(begin(watermark));
            messages.extend(data.into_iter().map(ChangeMessage::Data));
            messages.push(commit(watermark));
            return Ok(messages);
        }
        Ok(self
            .data_messages(event)?
            .into_iter()
            .map(ChangeMessage::Data)
            .collect())
    }

    /// One bracket around the data messages of `events`.
    ///
    /// All events are translated before anything is returned, so a failing
    /// event yields an error and no partial bracket. Replaces are held to the
    /// same resume position requirement as in [`ChangeTranslator::translate`].
    pub fn transaction(&self, watermark: &Watermark, events: &[ChangeEvent]) -> Result<Vec<ChangeMessage>> {
        let mut messages = vec![begin(watermark)];
        for event in events {
            if event.kind == ChangeKind::Replace {
                require_position(event)?;
            }
            messages.extend(self.data_messages(event)?.into_iter().map(ChangeMessage::Data));
        }
        messages.push(commit(watermark));
        Ok(messages)
    }

    /// Primary key index creation for each table, used ahead of a snapshot.
    pub fn create_indexes<'a>(&self, tables: impl IntoIterator<Item = &'a Namespace>) -> Vec<ChangeMessage> {
        tables
            .into_iter()
            .map(|ns| {
                ChangeMessage::Data(DataChange::CreateIndex {
                    spec: IndexSpec::primary_key(ns),
                })
            })
            .collect()
    }

    /// A standalone snapshot insert.
    pub fn snapshot_insert(&self, table: &Namespace, document: Document) -> ChangeMessage {
        ChangeMessage::Data(DataChange::Insert {
            relation: Relation::from_namespace(table),
            new: document,
        })
    }
}

pub fn begin(watermark: &Watermark) -> ChangeMessage {
    ChangeMessage::Begin {
        commit_watermark: watermark.clone(),
    }
}

pub fn commit(watermark: &Watermark) -> ChangeMessage {
    ChangeMessage::Commit {
        watermark: watermark.clone(),
    }
}

pub fn rollback() -> ChangeMessage {
    ChangeMessage::Rollback
}

fn full_document(event: &ChangeEvent) -> Result<&Document> {
    event.full_document.as_ref().ok_or_else(|| Error::MissingDocument {
        operation: event.kind.as_str(),
        namespace: event.namespace.to_string(),
    })
}

fn require_position(event: &ChangeEvent) -> Result<()> {
    match event.resume_position {
        Some(_) => Ok(()),
        None => Err(Error::MissingResumePosition {
            namespace: event.namespace.to_string(),
        }),
    }
}

fn document_key(event: &ChangeEvent) -> Result<&Document> {
    event.document_key.as_ref().ok_or_else(|| Error::MissingDocumentKey {
        operation: event.kind.as_str(),
        namespace: event.namespace.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ResumePosition;
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn ns() -> Namespace {
        Namespace::new("chat", "direct_rooms")
    }

    fn tags(messages: &[ChangeMessage]) -> Vec<&'static str> {
        messages
            .iter()
            .map(|m| match m {
                ChangeMessage::Data(change) => change.tag(),
                other => other.tag(),
            })
            .collect()
    }

    #[test]
    fn insert_uses_event_namespace_as_relation() {
        let event = ChangeEvent::insert(ns(), doc(json!({"_id": "r1", "t": "d"})));
        let messages = ChangeTranslator::new().translate(&event, &Watermark::from_lsn(1)).unwrap();
        assert_eq!(
            serde_json::to_value(&messages[0]).unwrap(),
            json!(["data", {
                "tag": "insert",
                "relation": {"schema": "chat", "name": "direct_rooms", "keyColumns": ["_id"]},
                "new": {"_id": "r1", "t": "d"}
            }])
        );
    }

    #[test]
    fn update_without_before_image_emits_nothing() {
        let event = ChangeEvent::update(ns(), None, doc(json!({"_id": "r1"})));
        let err = ChangeTranslator::new()
            .translate(&event, &Watermark::from_lsn(1))
            .unwrap_err();
        assert!(err.is_precondition());
        assert!(ChangeTranslator::new()
            .transaction(&Watermark::from_lsn(1), &[event])
            .is_err());
    }

    #[test]
    fn update_carries_key_old_and_new() {
        let event = ChangeEvent::update(
            ns(),
            Some(doc(json!({"_id": "r1", "n": 1}))),
            doc(json!({"_id": "r1", "n": 2})),
        );
        let changes = ChangeTranslator::new().data_messages(&event).unwrap();
        match &changes[..] {
            [DataChange::Update { key, old, new, .. }] => {
                assert_eq!(key["_id"], json!("r1"));
                assert_eq!(old["n"], json!(1));
                assert_eq!(new["n"], json!(2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn replace_is_bracketed_delete_insert() {
        let wm = Watermark::from_lsn(7);
        let event = ChangeEvent::replace(ns(), None, doc(json!({"_id": "r1", "v": 2})))
            .at(ResumePosition::new("42"));
        let messages = ChangeTranslator::new().translate(&event, &wm).unwrap();
        assert_eq!(tags(&messages), vec!["begin", "delete", "insert", "commit"]);
        assert_eq!(messages[0], begin(&wm));
        assert_eq!(messages[3], commit(&wm));
    }

    #[test]
    fn replace_requires_resume_position() {
        let event = ChangeEvent::replace(ns(), None, doc(json!({"_id": "r1"})));
        let err = ChangeTranslator::new()
            .translate(&event, &Watermark::from_lsn(1))
            .unwrap_err();
        assert!(matches!(err, Error::MissingResumePosition { .. }));
    }

    #[test]
    fn delete_requires_key_and_drop_names_table() {
        let translator = ChangeTranslator::new();
        let mut event = ChangeEvent::delete(ns(), doc(json!({"_id": "r1"})));
        assert_eq!(tags(&translator.translate(&event, &Watermark::from_lsn(1)).unwrap()), vec!["delete"]);
        event.document_key = None;
        assert!(translator.data_messages(&event).is_err());

        let dropped = translator.data_messages(&ChangeEvent::drop(ns())).unwrap();
        assert_eq!(
            serde_json::to_value(ChangeMessage::Data(dropped[0].clone())).unwrap(),
            json!(["data", {"tag": "drop-table", "id": {"schema": "chat", "name": "direct_rooms"}}])
        );
    }

    #[test]
    fn transaction_flattens_many_tables() {
        let wm = Watermark::from_lsn(3);
        let events = vec![
            ChangeEvent::insert(ns(), doc(json!({"_id": "r1"}))),
            ChangeEvent::replace(ns().with_collection("all_rooms"), None, doc(json!({"_id": "r1"})))
                .at(ResumePosition::new("9")),
        ];
        let messages = ChangeTranslator::new().transaction(&wm, &events).unwrap();
        assert_eq!(tags(&messages), vec!["begin", "insert", "delete", "insert", "commit"]);
    }

    #[test]
    fn bootstrap_messages() {
        let translator = ChangeTranslator::new();
        let tables = [ns(), ns().with_collection("private_rooms")];
        let indexes = translator.create_indexes(&tables);
        assert_eq!(tags(&indexes), vec!["create-index", "create-index"]);
        assert_eq!(
            serde_json::to_value(&indexes[1]).unwrap()[1]["spec"]["name"],
            json!("private_rooms_pkey")
        );
        let insert = translator.snapshot_insert(&tables[0], doc(json!({"_id": "r1"})));
        assert_eq!(tags(&[insert, rollback()]), vec!["insert", "rollback"]);
    }
}
