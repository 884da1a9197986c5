//! Error types for the Tributary engine.

use thiserror::Error;

/// All possible errors from the Tributary engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Translation preconditions
    #[error("update on {namespace} has no before-image")]
    MissingBeforeImage { namespace: String },

    #[error("replace on {namespace} has no resume position")]
    MissingResumePosition { namespace: String },

    #[error("{operation} on {namespace} has no document key")]
    MissingDocumentKey {
        operation: &'static str,
        namespace: String,
    },

    #[error("{operation} on {namespace} has no full document")]
    MissingDocument {
        operation: &'static str,
        namespace: String,
    },

    // Configuration errors
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid projection: {0}")]
    InvalidProjection(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("invalid routing rule '{table}': {reason}")]
    InvalidRule { table: String, reason: String },

    // Wire errors
    #[error("invalid watermark: {0}")]
    InvalidWatermark(String),

    #[error("invalid protocol message: {0}")]
    InvalidMessage(String),
}

impl Error {
    /// Whether this error is a per-change precondition violation.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::MissingBeforeImage { .. }
                | Error::MissingResumePosition { .. }
                | Error::MissingDocumentKey { .. }
                | Error::MissingDocument { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
