//! Replication wire protocol.
//!
//! Every frame is a JSON array `[tag, payload, metadata?]`:
//!
//! ```text
//! ["begin",    {"tag": "begin"},             {"commitWatermark": "0a"}]
//! ["data",     {"tag": "insert", "relation": {..}, "new": {..}}]
//! ["commit",   {"tag": "commit"},            {"watermark": "0a"}]
//! ["rollback", {"tag": "rollback"}]
//! ["status",   {"tag": "status"},            {"watermark": "0a"}]   (subscriber → server)
//! ```

use crate::change::Namespace;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::watermark::Watermark;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Primary key column of every replicated table.
pub const KEY_COLUMN: &str = "_id";

/// Identity of a replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub schema: String,
    pub name: String,
    pub key_columns: Vec<String>,
}

impl Relation {
    /// The relation for a namespace: the database is the schema and the
    /// collection is the table.
    pub fn from_namespace(namespace: &Namespace) -> Self {
        Self {
            schema: namespace.db.clone(),
            name: namespace.coll.clone(),
            key_columns: vec![KEY_COLUMN.to_string()],
        }
    }
}

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableId {
    pub schema: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexDirection {
    #[serde(rename = "ASC")]
    Asc,
    #[serde(rename = "DESC")]
    Desc,
}

/// An index to create on the subscriber side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub schema: String,
    pub table_name: String,
    pub name: String,
    pub columns: BTreeMap<String, IndexDirection>,
    pub unique: bool,
}

impl IndexSpec {
    /// The unique primary key index of a table.
    pub fn primary_key(namespace: &Namespace) -> Self {
        Self {
            schema: namespace.db.clone(),
            table_name: namespace.coll.clone(),
            name: format!("{}_pkey", namespace.coll),
            columns: BTreeMap::from([(KEY_COLUMN.to_string(), IndexDirection::Asc)]),
            unique: true,
        }
    }
}

/// Payload of a `data` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "kebab-case")]
pub enum DataChange {
    Insert {
        relation: Relation,
        new: Document,
    },
    Update {
        relation: Relation,
        key: Document,
        old: Document,
        new: Document,
    },
    Delete {
        relation: Relation,
        key: Document,
    },
    CreateIndex {
        spec: IndexSpec,
    },
    DropTable {
        id: TableId,
    },
}

impl DataChange {
    pub fn tag(&self) -> &'static str {
        match self {
            DataChange::Insert { .. } => "insert",
            DataChange::Update { .. } => "update",
            DataChange::Delete { .. } => "delete",
            DataChange::CreateIndex { .. } => "create-index",
            DataChange::DropTable { .. } => "drop-table",
        }
    }
}

/// One frame sent to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeMessage {
    Begin { commit_watermark: Watermark },
    Data(DataChange),
    Commit { watermark: Watermark },
    Rollback,
}

impl ChangeMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            ChangeMessage::Begin { .. } => "begin",
            ChangeMessage::Data(_) => "data",
            ChangeMessage::Commit { .. } => "commit",
            ChangeMessage::Rollback => "rollback",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TagOnly {
    tag: String,
}

impl TagOnly {
    fn new(tag: &str) -> Self {
        Self { tag: tag.to_string() }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BeginMeta {
    commit_watermark: Watermark,
}

#[derive(Serialize, Deserialize)]
struct WatermarkMeta {
    #[serde(default)]
    watermark: Option<Watermark>,
}

impl Serialize for ChangeMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let tag = self.tag();
        match self {
            ChangeMessage::Begin { commit_watermark } => (
                tag,
                TagOnly::new(tag),
                BeginMeta {
                    commit_watermark: commit_watermark.clone(),
                },
            )
                .serialize(serializer),
            ChangeMessage::Data(change) => (tag, change).serialize(serializer),
            ChangeMessage::Commit { watermark } => (
                tag,
                TagOnly::new(tag),
                WatermarkMeta {
                    watermark: Some(watermark.clone()),
                },
            )
                .serialize(serializer),
            ChangeMessage::Rollback => (tag, TagOnly::new(tag)).serialize(serializer),
        }
    }
}

/// Split a frame into its tag, payload and optional metadata.
fn frame_parts(frame: Vec<Value>) -> Result<(String, Value, Option<Value>)> {
    let mut parts = frame.into_iter();
    let tag = match parts.next() {
        Some(Value::String(tag)) => tag,
        _ => return Err(Error::InvalidMessage("frame must start with a string tag".into())),
    };
    let payload = parts
        .next()
        .ok_or_else(|| Error::InvalidMessage(format!("'{tag}' frame has no payload")))?;
    let metadata = parts.next();
    if parts.next().is_some() {
        return Err(Error::InvalidMessage(format!("'{tag}' frame has too many elements")));
    }
    Ok((tag, payload, metadata))
}

fn from_part<T: serde::de::DeserializeOwned>(tag: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::InvalidMessage(format!("'{tag}' frame: {e}")))
}

impl ChangeMessage {
    fn from_frame(frame: Vec<Value>) -> Result<Self> {
        let (tag, payload, metadata) = frame_parts(frame)?;
        let require_metadata = || {
            metadata
                .clone()
                .ok_or_else(|| Error::InvalidMessage(format!("'{tag}' frame has no metadata")))
        };
        match tag.as_str() {
            "begin" => {
                let meta: BeginMeta = from_part(&tag, require_metadata()?)?;
                Ok(ChangeMessage::Begin {
                    commit_watermark: meta.commit_watermark,
                })
            }
            "data" => Ok(ChangeMessage::Data(from_part(&tag, payload)?)),
            "commit" => {
                let meta: WatermarkMeta = from_part(&tag, require_metadata()?)?;
                let watermark = meta
                    .watermark
                    .ok_or_else(|| Error::InvalidMessage("'commit' frame has no watermark".into()))?;
                Ok(ChangeMessage::Commit { watermark })
            }
            "rollback" => Ok(ChangeMessage::Rollback),
            other => Err(Error::InvalidMessage(format!("unknown tag '{other}'"))),
        }
    }
}

impl<'de> Deserialize<'de> for ChangeMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let frame = Vec::<Value>::deserialize(deserializer)?;
        ChangeMessage::from_frame(frame).map_err(de::Error::custom)
    }
}

/// A frame sent by a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberMessage {
    /// Acknowledges consumption up to `watermark`.
    Status { watermark: Option<Watermark> },
}

impl SubscriberMessage {
    /// Parse a text frame. Any tag other than `status` is a protocol violation.
    pub fn parse(text: &str) -> Result<Self> {
        let frame: Vec<Value> = serde_json::from_str(text)
            .map_err(|e| Error::InvalidMessage(format!("frame is not a JSON array: {e}")))?;
        let (tag, _payload, metadata) = frame_parts(frame)?;
        match tag.as_str() {
            "status" => {
                let watermark = match metadata {
                    Some(meta) => from_part::<WatermarkMeta>(&tag, meta)?.watermark,
                    None => None,
                };
                if let Some(watermark) = &watermark {
                    Watermark::parse(watermark.as_str())?;
                }
                Ok(SubscriberMessage::Status { watermark })
            }
            other => Err(Error::InvalidMessage(format!("unexpected tag '{other}'"))),
        }
    }

    /// Serialize as a wire frame.
    pub fn to_frame(&self) -> Value {
        match self {
            SubscriberMessage::Status { watermark } => serde_json::json!([
                "status",
                {"tag": "status"},
                {"watermark": watermark},
            ]),
        }
    }
}
