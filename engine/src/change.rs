//! Upstream change events.
//!
//! A change event describes one write observed on a source collection. The
//! serialized form follows the change-stream event shape (`operationType`,
//! `ns`, `documentKey`, `fullDocument`, `fullDocumentBeforeChange`), with the
//! resume position carried as `_id`.

use crate::document::Document;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Database and collection of a change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// The same database with a different collection.
    pub fn with_collection(&self, coll: impl Into<String>) -> Self {
        Self::new(self.db.clone(), coll)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// The upstream's own opaque position marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumePosition(pub String);

impl ResumePosition {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResumePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Replace => "replace",
            ChangeKind::Delete => "delete",
            ChangeKind::Drop => "drop",
        }
    }
}

/// One upstream change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    #[serde(rename = "operationType")]
    pub kind: ChangeKind,
    #[serde(rename = "ns")]
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Document>,
    /// The document after the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,
    /// The document before the change.
    #[serde(
        default,
        rename = "fullDocumentBeforeChange",
        skip_serializing_if = "Option::is_none"
    )]
    pub before: Option<Document>,
    #[serde(default, rename = "_id", skip_serializing_if = "Option::is_none")]
    pub resume_position: Option<ResumePosition>,
}

impl ChangeEvent {
    fn new(kind: ChangeKind, namespace: Namespace) -> Self {
        Self {
            kind,
            namespace,
            document_key: None,
            full_document: None,
            before: None,
            resume_position: None,
        }
    }

    /// An insert of `document`, keyed by its `_id`.
    pub fn insert(namespace: Namespace, document: Document) -> Self {
        let mut event = Self::new(ChangeKind::Insert, namespace);
        event.document_key = key_of(&document);
        event.full_document = Some(document);
        event
    }

    /// An update from `before` to `after`.
    pub fn update(namespace: Namespace, before: Option<Document>, after: Document) -> Self {
        let mut event = Self::new(ChangeKind::Update, namespace);
        event.document_key = key_of(&after);
        event.before = before;
        event.full_document = Some(after);
        event
    }

    /// A whole-document replacement.
    pub fn replace(namespace: Namespace, before: Option<Document>, after: Document) -> Self {
        let mut event = Self::new(ChangeKind::Replace, namespace);
        event.document_key = key_of(&after);
        event.before = before;
        event.full_document = Some(after);
        event
    }

    /// A delete of the document with `key`.
    pub fn delete(namespace: Namespace, key: Document) -> Self {
        let mut event = Self::new(ChangeKind::Delete, namespace);
        event.document_key = Some(key);
        event
    }

    /// A dropped collection.
    pub fn drop(namespace: Namespace) -> Self {
        Self::new(ChangeKind::Drop, namespace)
    }

    /// Attach the upstream resume position.
    pub fn at(mut self, position: ResumePosition) -> Self {
        self.resume_position = Some(position);
        self
    }

    /// Attach a before-image.
    pub fn with_before(mut self, before: Document) -> Self {
        self.before = Some(before);
        self
    }
}

/// `{_id: ..}` for a document, if it has one.
pub fn key_of(document: &Document) -> Option<Document> {
    document.get("_id").map(|id| {
        let mut key = Document::new();
        key.insert("_id".to_string(), id.clone());
        key
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_change_stream_shape() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "_id": "8263A1",
            "operationType": "update",
            "ns": {"db": "chat", "coll": "rooms"},
            "documentKey": {"_id": "r1"},
            "fullDocument": {"_id": "r1", "t": "d"},
            "fullDocumentBeforeChange": {"_id": "r1", "t": "p"}
        }))
        .unwrap();

        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.namespace.to_string(), "chat.rooms");
        assert_eq!(event.resume_position, Some(ResumePosition::new("8263A1")));
        assert_eq!(event.before.unwrap()["t"], json!("p"));
    }

    #[test]
    fn constructors_derive_key() {
        let doc = json!({"_id": "r1", "t": "d"}).as_object().cloned().unwrap();
        let event = ChangeEvent::insert(Namespace::new("chat", "rooms"), doc);
        assert_eq!(
            serde_json::Value::Object(event.document_key.unwrap()),
            json!({"_id": "r1"})
        );
    }
}
