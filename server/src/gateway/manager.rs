//! Subscriber session manager.
//!
//! Tracks live replication sessions so `/health` can report them and
//! shutdown can cancel them all.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// A single live session.
#[derive(Debug)]
pub struct Session {
    /// Unique identifier for this session
    pub id: String,
    /// Shard the subscriber replicates into
    pub shard_id: String,
    /// Fires when the session must stop
    pub cancel: CancellationToken,
    pub connected_at: DateTime<Utc>,
}

/// Manages active sessions.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active sessions, keyed by session ID.
    sessions: DashMap<String, Session>,
    /// Index of sessions by shard for efficient lookup.
    by_shard: DashMap<String, Vec<String>>,
    /// Parent of every session token.
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new session.
    ///
    /// Returns the session ID and its cancellation token. The token is a
    /// child of the manager's shutdown token.
    pub fn register(&self, shard_id: &str) -> (String, CancellationToken) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let cancel = self.shutdown.child_token();

        self.sessions.insert(
            session_id.clone(),
            Session {
                id: session_id.clone(),
                shard_id: shard_id.to_string(),
                cancel: cancel.clone(),
                connected_at: Utc::now(),
            },
        );
        self.by_shard
            .entry(shard_id.to_string())
            .or_default()
            .push(session_id.clone());

        tracing::info!(session_id = %session_id, shard_id = %shard_id, "session registered");

        (session_id, cancel)
    }

    /// Unregister a session, cancelling it if it is still running.
    pub fn unregister(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            session.cancel.cancel();
            if let Some(mut ids) = self.by_shard.get_mut(&session.shard_id) {
                ids.retain(|id| id != session_id);
                // Clean up empty entries
                if ids.is_empty() {
                    drop(ids);
                    self.by_shard.remove(&session.shard_id);
                }
            }

            tracing::info!(session_id = %session_id, shard_id = %session.shard_id, "session unregistered");
        }
    }

    /// Cancel every session of one shard. Returns how many were cancelled.
    pub fn cancel_shard(&self, shard_id: &str) -> usize {
        let Some(ids) = self.by_shard.get(shard_id).map(|ids| ids.clone()) else {
            return 0;
        };
        ids.iter()
            .filter_map(|id| self.sessions.get(id))
            .inspect(|session| session.cancel.cancel())
            .count()
    }

    /// Cancel every session, now and in the future.
    pub fn cancel_all(&self) {
        tracing::info!(sessions = self.session_count(), "cancelling all sessions");
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Get the number of active sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Get the number of shards with at least one session.
    pub fn shard_count(&self) -> usize {
        self.by_shard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let manager = ConnectionManager::new();

        let (id, cancel) = manager.register("shard-1");
        assert_eq!(manager.session_count(), 1);
        assert_eq!(manager.shard_count(), 1);

        manager.unregister(&id);
        assert_eq!(manager.session_count(), 0);
        assert_eq!(manager.shard_count(), 0);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_cancel_shard() {
        let manager = ConnectionManager::new();
        let (_, a) = manager.register("shard-1");
        let (_, b) = manager.register("shard-1");
        let (_, other) = manager.register("shard-2");

        assert_eq!(manager.cancel_shard("shard-1"), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(!other.is_cancelled());
        assert_eq!(manager.cancel_shard("missing"), 0);
    }

    #[test]
    fn test_cancel_all_reaches_every_session() {
        let manager = ConnectionManager::new();
        let (_, a) = manager.register("shard-1");
        let (_, b) = manager.register("shard-2");

        assert!(!manager.is_shutting_down());
        manager.cancel_all();
        assert!(manager.is_shutting_down());
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());

        // late arrivals are born cancelled
        let (_, late) = manager.register("shard-3");
        assert!(late.is_cancelled());
    }
}
