//! Key-value persistence behind the watermark service.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::StoreError;

/// One entry of the watermark key space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatermarkKey {
    /// resume token → watermark
    Forward { shard: String, token: String },
    /// watermark → resume token
    Reverse { shard: String, watermark: String },
    /// the shard's last minted LSN
    Lsn { shard: String },
}

impl WatermarkKey {
    pub fn forward(shard: &str, token: &str) -> Self {
        WatermarkKey::Forward {
            shard: shard.to_string(),
            token: token.to_string(),
        }
    }

    pub fn reverse(shard: &str, watermark: &str) -> Self {
        WatermarkKey::Reverse {
            shard: shard.to_string(),
            watermark: watermark.to_string(),
        }
    }

    pub fn lsn(shard: &str) -> Self {
        WatermarkKey::Lsn {
            shard: shard.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WatermarkKey::Forward { .. } => "forward",
            WatermarkKey::Reverse { .. } => "reverse",
            WatermarkKey::Lsn { .. } => "lsn",
        }
    }

    pub fn shard(&self) -> &str {
        match self {
            WatermarkKey::Forward { shard, .. }
            | WatermarkKey::Reverse { shard, .. }
            | WatermarkKey::Lsn { shard } => shard,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            WatermarkKey::Forward { token, .. } => token,
            WatermarkKey::Reverse { watermark, .. } => watermark,
            WatermarkKey::Lsn { .. } => "lsn",
        }
    }
}

/// Storage for watermark mappings and counters.
///
/// Every write is a single-row conditional write, so concurrent mints on one
/// shard race safely without a surrounding transaction.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, key: &WatermarkKey) -> Result<Option<String>, StoreError>;

    /// Insert `value` unless the key exists. Returns the existing value when
    /// the insert lost, `None` when it won.
    async fn insert_if_absent(&self, key: &WatermarkKey, value: &str) -> Result<Option<String>, StoreError>;

    /// Set `key` to `new` only if it currently holds `expected` (`None` means
    /// absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &WatermarkKey,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError>;
}

/// In-memory store for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    entries: DashMap<WatermarkKey, String>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, key: &WatermarkKey) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn insert_if_absent(&self, key: &WatermarkKey, value: &str) -> Result<Option<String>, StoreError> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(existing) => Ok(Some(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(value.to_string());
                Ok(None)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &WatermarkKey,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        match (self.entries.entry(key.clone()), expected) {
            (Entry::Vacant(slot), None) => {
                slot.insert(new.to_string());
                Ok(true)
            }
            (Entry::Occupied(mut current), Some(expected)) if current.get() == expected => {
                current.insert(new.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_if_absent_keeps_first_value() {
        let store = MemoryWatermarkStore::new();
        let key = WatermarkKey::forward("s1", "42");
        assert_eq!(store.insert_if_absent(&key, "01").await.unwrap(), None);
        assert_eq!(store.insert_if_absent(&key, "02").await.unwrap(), Some("01".into()));
        assert_eq!(store.get(&key).await.unwrap(), Some("01".into()));
    }

    #[tokio::test]
    async fn compare_and_swap_checks_expected() {
        let store = MemoryWatermarkStore::new();
        let key = WatermarkKey::lsn("s1");
        assert!(!store.compare_and_swap(&key, Some("1"), "2").await.unwrap());
        assert!(store.compare_and_swap(&key, None, "1").await.unwrap());
        assert!(!store.compare_and_swap(&key, None, "1").await.unwrap());
        assert!(store.compare_and_swap(&key, Some("1"), "2").await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Some("2".into()));
    }

    #[test]
    fn keys_are_scoped_by_kind_and_shard() {
        let forward = WatermarkKey::forward("s1", "01");
        let reverse = WatermarkKey::reverse("s1", "01");
        assert_ne!(forward, reverse);
        assert_eq!((forward.kind(), forward.shard(), forward.key()), ("forward", "s1", "01"));
        assert_eq!(WatermarkKey::lsn("s2").key(), "lsn");
    }
}
