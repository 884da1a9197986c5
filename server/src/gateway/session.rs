//! One subscriber session.
//!
//! [`run_session`] produces the outbound frames of a session into a bounded
//! channel. It decides between initial sync and resume, streams routed
//! changes as brackets, and ends with a close reason when the stream cannot
//! continue. Shard progress is recorded by the writer through
//! [`record_delivered`] once a commit has reached the socket. Every suspension point also waits on the session's
//! cancellation token, so a closed socket stops upstream reads promptly.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tributary_engine::translate::{begin, rollback};
use tributary_engine::{
    ChangeEvent, ChangeMessage, ChangeTranslator, Namespace, SubscriberMessage, TableRouter, Watermark,
};

use super::close::CloseReason;
use super::shard::ShardStateStore;
use crate::error::StoreError;
use crate::source::{ChangeCursor, ChangeSource, SourceError};
use crate::watermark::{WatermarkError, WatermarkService};

/// A frame for the socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ChangeMessage),
    Close(CloseReason),
}

/// Collaborators of a session.
#[derive(Clone)]
pub struct SessionContext {
    pub shards: Arc<dyn ShardStateStore>,
    pub watermarks: Arc<WatermarkService>,
    pub source: Arc<dyn ChangeSource>,
    /// Routing rules, fixed for the session's lifetime.
    pub router: Arc<TableRouter>,
    pub translator: ChangeTranslator,
}

/// What the subscriber asked for when connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub session_id: String,
    pub shard_id: String,
    pub last_watermark: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("session cancelled")]
    Cancelled,

    #[error("subscriber disconnected")]
    Disconnected,

    #[error("unknown watermark {0}")]
    UnknownWatermark(Watermark),

    #[error("invalid watermark: {0}")]
    InvalidWatermark(tributary_engine::Error),

    #[error("change has no resume position")]
    MissingPosition,

    #[error("translation failed: {0}")]
    Engine(tributary_engine::Error),

    #[error("storage: {0}")]
    Store(#[from] StoreError),

    #[error("watermark: {0}")]
    Watermark(#[from] WatermarkError),

    #[error("upstream: {0}")]
    Source(#[from] SourceError),
}

impl SessionError {
    fn close_reason(&self) -> Option<CloseReason> {
        match self {
            SessionError::Cancelled | SessionError::Disconnected => None,
            SessionError::UnknownWatermark(_) | SessionError::InvalidWatermark(_) => {
                Some(CloseReason::policy_violation(self.to_string()))
            }
            _ => Some(CloseReason::internal(self.to_string())),
        }
    }
}

struct Session<'a> {
    ctx: &'a SessionContext,
    params: &'a SessionParams,
    tx: &'a mpsc::Sender<Outbound>,
    cancel: &'a CancellationToken,
}

/// Run a session until the stream ends, fails, or `cancel` fires.
///
/// A final [`Outbound::Close`] is sent unless the session was cancelled or
/// the writer went away.
pub async fn run_session(
    ctx: SessionContext,
    params: SessionParams,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
) {
    let session = Session {
        ctx: &ctx,
        params: &params,
        tx: &tx,
        cancel: &cancel,
    };
    let close = match session.run().await {
        Ok(()) => {
            tracing::info!(session_id = %params.session_id, shard_id = %params.shard_id, "upstream ended");
            Some(CloseReason::service_restart("upstream change stream ended"))
        }
        Err(err) => {
            match &err {
                SessionError::Cancelled | SessionError::Disconnected => {
                    tracing::debug!(session_id = %params.session_id, "session stopped: {}", err)
                }
                _ => tracing::warn!(
                    session_id = %params.session_id,
                    shard_id = %params.shard_id,
                    error = %err,
                    "session failed"
                ),
            }
            err.close_reason()
        }
    };
    if let Some(reason) = close {
        // best effort, the writer may already be gone
        let _ = session.send(Outbound::Close(reason)).await;
    }
}

impl Session<'_> {
    async fn run(&self) -> Result<(), SessionError> {
        let shard_id = self.params.shard_id.as_str();
        self.guard(self.ctx.shards.upsert(shard_id)).await?;

        let cursor = if Watermark::requests_initial_sync(self.params.last_watermark.as_deref()) {
            self.initial_sync().await?
        } else {
            let raw = self.params.last_watermark.as_deref().unwrap_or_default();
            let watermark = Watermark::parse(raw).map_err(SessionError::InvalidWatermark)?;
            let token = self
                .guard(self.ctx.watermarks.get_resume_token(shard_id, &watermark))
                .await?
                .ok_or(SessionError::UnknownWatermark(watermark))?;
            tracing::info!(shard_id = %shard_id, resume = %token, "resuming stream");
            self.guard(self.ctx.source.open(Some(token))).await?
        };

        self.stream(cursor).await
    }

    /// Snapshot every routed table, then open the stream where the snapshot
    /// started.
    async fn initial_sync(&self) -> Result<Box<dyn ChangeCursor>, SessionError> {
        let start = self.guard(self.ctx.source.current_position()).await?;
        let database = self.ctx.source.database();
        let router = &self.ctx.router;
        tracing::info!(shard_id = %self.params.shard_id, start = %start, "initial sync");

        let tables: Vec<Namespace> = router
            .rules()
            .map(|rule| Namespace::new(database, rule.logical_table_name.as_str()))
            .collect();
        for message in self.ctx.translator.create_indexes(&tables) {
            self.send(Outbound::Message(message)).await?;
        }

        let mut sent = 0usize;
        for collection in router.source_collections() {
            let documents = self.guard(self.ctx.source.snapshot(collection)).await?;
            for document in &documents {
                for routed in router.route(document, collection) {
                    let table = Namespace::new(database, routed.table);
                    let message = self.ctx.translator.snapshot_insert(&table, routed.document);
                    self.send(Outbound::Message(message)).await?;
                    sent += 1;
                }
            }
        }
        tracing::debug!(shard_id = %self.params.shard_id, documents = sent, "snapshot sent");

        Ok(self.guard(self.ctx.source.open(Some(start))).await?)
    }

    async fn stream(&self, mut cursor: Box<dyn ChangeCursor>) -> Result<(), SessionError> {
        let shard_id = self.params.shard_id.as_str();
        loop {
            let event = match self.guard(cursor.next()).await? {
                Some(event) => event,
                None => return Ok(()),
            };

            let routed = self.ctx.router.route_change(&event);
            if matches!(&routed, Ok(tables) if tables.is_empty()) {
                continue;
            }

            let position = event
                .resume_position
                .clone()
                .or_else(|| cursor.position())
                .ok_or(SessionError::MissingPosition)?;
            let watermark = self
                .guard(self.ctx.watermarks.get_or_create_watermark(shard_id, &position))
                .await?;

            let messages = routed.and_then(|tables| self.ctx.translator.transaction(&watermark, &tables));
            let committed = match messages {
                Ok(messages) => {
                    for message in messages {
                        self.send(Outbound::Message(message)).await?;
                    }
                    true
                }
                Err(err) if err.is_precondition() => {
                    tracing::error!(
                        shard_id = %shard_id,
                        watermark = %watermark,
                        namespace = %event.namespace,
                        error = %err,
                        "cannot translate change, rolling back"
                    );
                    self.send(Outbound::Message(begin(&watermark))).await?;
                    self.send(Outbound::Message(rollback())).await?;
                    false
                }
                Err(err) => return Err(SessionError::Engine(err)),
            };

            log_change(shard_id, &event, &watermark, committed);
        }
    }

    /// Await `fut` unless the session is cancelled first.
    async fn guard<T, E>(&self, fut: impl Future<Output = Result<T, E>>) -> Result<T, SessionError>
    where
        SessionError: From<E>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            result = fut => result.map_err(SessionError::from),
        }
    }

    async fn send(&self, frame: Outbound) -> Result<(), SessionError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            sent = self.tx.send(frame) => sent.map_err(|_| SessionError::Disconnected),
        }
    }
}

fn log_change(shard_id: &str, event: &ChangeEvent, watermark: &Watermark, committed: bool) {
    tracing::trace!(
        shard_id = %shard_id,
        kind = event.kind.as_str(),
        namespace = %event.namespace,
        watermark = %watermark,
        committed,
        "change forwarded"
    );
}

/// Record shard progress for a frame the socket writer has sent.
///
/// Only commits move `last_watermark`. Frames still queued when a socket
/// dies were never delivered and leave the shard where it was.
pub async fn record_delivered(
    shards: &dyn ShardStateStore,
    shard_id: &str,
    message: &ChangeMessage,
) -> Result<(), StoreError> {
    if let ChangeMessage::Commit { watermark } = message {
        shards.set_last_watermark(shard_id, watermark).await?;
    }
    Ok(())
}

/// Apply one inbound text frame.
///
/// Status acks are persisted. Anything else closes the session with a
/// policy violation.
pub async fn handle_inbound(
    shards: &dyn ShardStateStore,
    shard_id: &str,
    text: &str,
) -> Result<(), CloseReason> {
    match SubscriberMessage::parse(text) {
        Ok(SubscriberMessage::Status { watermark: Some(watermark) }) => {
            shards
                .set_acknowledged(shard_id, &watermark)
                .await
                .map_err(|e| CloseReason::internal(e.to_string()))?;
            tracing::debug!(shard_id = %shard_id, watermark = %watermark, "acknowledged");
            Ok(())
        }
        Ok(SubscriberMessage::Status { watermark: None }) => Ok(()),
        Err(err) => {
            tracing::warn!(shard_id = %shard_id, error = %err, "protocol violation");
            Err(CloseReason::policy_violation(err.to_string()))
        }
    }
}
