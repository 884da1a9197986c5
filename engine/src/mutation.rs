//! Push protocol types.
//!
//! A push request carries a batch of mutations from one client group. Each
//! mutation is answered with a result keyed by `(clientID, id)`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incoming push batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    #[serde(rename = "clientGroupID")]
    pub client_group_id: String,
    #[serde(rename = "pushVersion", default = "default_push_version")]
    pub push_version: u32,
    #[serde(rename = "requestID", default)]
    pub request_id: String,
    #[serde(default)]
    pub mutations: Vec<Mutation>,
}

fn default_push_version() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationType {
    #[default]
    Custom,
    Crud,
}

/// One client write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    #[serde(rename = "type", default)]
    pub kind: MutationType,
    pub id: u64,
    #[serde(rename = "clientID")]
    pub client_id: String,
    /// Registry key, `namespace|name`.
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub timestamp: u64,
}

impl Mutation {
    pub fn mutation_id(&self) -> MutationId {
        MutationId {
            client_id: self.client_id.clone(),
            id: self.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationId {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationErrorKind {
    /// The handler failed. The mutation still counts as processed.
    App,
    /// The id skips ahead of the client's counter.
    OooMutation,
    /// The id was already applied.
    AlreadyProcessed,
    /// Storage failed while processing.
    Internal,
}

impl MutationErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationErrorKind::App => "app",
            MutationErrorKind::OooMutation => "oooMutation",
            MutationErrorKind::AlreadyProcessed => "alreadyProcessed",
            MutationErrorKind::Internal => "internal",
        }
    }
}

/// Outcome of one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MutationResult {
    Error {
        error: MutationErrorKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl MutationResult {
    pub fn ok(data: Value) -> Self {
        match data {
            Value::Null => MutationResult::Ok { data: None },
            data => MutationResult::Ok { data: Some(data) },
        }
    }

    pub fn error(kind: MutationErrorKind, details: impl Into<String>) -> Self {
        MutationResult::Error {
            error: kind,
            details: Some(details.into()),
        }
    }

    pub fn error_kind(&self) -> Option<MutationErrorKind> {
        match self {
            MutationResult::Error { error, .. } => Some(*error),
            MutationResult::Ok { .. } => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, MutationResult::Ok { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse {
    pub id: MutationId,
    pub result: MutationResult,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PushResponse {
    pub mutations: Vec<MutationResponse>,
}
