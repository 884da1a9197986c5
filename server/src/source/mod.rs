//! Upstream change sources.
//!
//! A source hands out cursors over its change stream and full snapshots of
//! its collections. Positions are opaque [`ResumePosition`]s: a cursor opened
//! at a position yields the changes strictly after it.

mod memory;

pub use memory::MemoryChangeSource;

use async_trait::async_trait;
use tributary_engine::{ChangeEvent, Document, ResumePosition};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid resume position '{0}'")]
    InvalidPosition(String),

    #[error("Cannot decode change: {0}")]
    Decode(String),
}

/// A live change stream.
#[async_trait]
pub trait ChangeCursor: Send {
    /// The next change. `None` means the upstream ended the stream.
    async fn next(&mut self) -> Result<Option<ChangeEvent>, SourceError>;

    /// Position of the last change returned, or of the opening point.
    fn position(&self) -> Option<ResumePosition>;
}

/// Source of changes and snapshots (Strategy pattern).
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Database name of every collection this source serves.
    fn database(&self) -> &str;

    /// Open a cursor after `resume`, or at the current end when `None`.
    async fn open(&self, resume: Option<ResumePosition>) -> Result<Box<dyn ChangeCursor>, SourceError>;

    /// The current end of the stream.
    async fn current_position(&self) -> Result<ResumePosition, SourceError>;

    /// Every document currently in `collection`.
    async fn snapshot(&self, collection: &str) -> Result<Vec<Document>, SourceError>;
}
