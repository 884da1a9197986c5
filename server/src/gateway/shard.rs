//! Per-shard subscriber progress.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tributary_engine::Watermark;

use crate::error::StoreError;

/// Progress of one subscriber partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardState {
    pub shard_id: String,
    /// Watermark of the last commit written to the socket.
    pub last_watermark: Option<Watermark>,
    /// Watermark the subscriber last acknowledged.
    pub last_acknowledged_watermark: Option<Watermark>,
    pub updated_at: DateTime<Utc>,
}

impl ShardState {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            last_watermark: None,
            last_acknowledged_watermark: None,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ShardStateStore: Send + Sync {
    /// Create the shard if needed and touch it.
    async fn upsert(&self, shard_id: &str) -> Result<ShardState, StoreError>;

    async fn get(&self, shard_id: &str) -> Result<Option<ShardState>, StoreError>;

    async fn set_last_watermark(&self, shard_id: &str, watermark: &Watermark) -> Result<(), StoreError>;

    async fn set_acknowledged(&self, shard_id: &str, watermark: &Watermark) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryShardStateStore {
    shards: DashMap<String, ShardState>,
}

impl MemoryShardStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShardStateStore for MemoryShardStateStore {
    async fn upsert(&self, shard_id: &str) -> Result<ShardState, StoreError> {
        let mut entry = self
            .shards
            .entry(shard_id.to_string())
            .or_insert_with(|| ShardState::new(shard_id));
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn get(&self, shard_id: &str) -> Result<Option<ShardState>, StoreError> {
        Ok(self.shards.get(shard_id).map(|s| s.clone()))
    }

    async fn set_last_watermark(&self, shard_id: &str, watermark: &Watermark) -> Result<(), StoreError> {
        let mut entry = self
            .shards
            .entry(shard_id.to_string())
            .or_insert_with(|| ShardState::new(shard_id));
        entry.last_watermark = Some(watermark.clone());
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn set_acknowledged(&self, shard_id: &str, watermark: &Watermark) -> Result<(), StoreError> {
        let mut entry = self
            .shards
            .entry(shard_id.to_string())
            .or_insert_with(|| ShardState::new(shard_id));
        entry.last_acknowledged_watermark = Some(watermark.clone());
        entry.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MemoryShardStateStore::new();
        store.upsert("s1").await.unwrap();
        store.set_last_watermark("s1", &Watermark::from_lsn(4)).await.unwrap();

        let state = store.upsert("s1").await.unwrap();
        assert_eq!(state.last_watermark, Some(Watermark::from_lsn(4)));
        assert_eq!(state.last_acknowledged_watermark, None);
    }
}
