//! Watermark service.
//!
//! Translates between upstream resume positions and the sortable watermarks
//! subscribers see, per shard. A mapping, once minted, never changes, and
//! both directions are persisted before the watermark is handed out.

mod retry;
mod store;

pub use retry::RetryPolicy;
pub use store::{MemoryWatermarkStore, WatermarkKey, WatermarkStore};

use std::sync::Arc;

use tributary_engine::{ResumePosition, Watermark, BASE_LSN};

use crate::error::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("gave up minting a watermark for shard {shard} after {attempts} contended attempts")]
    ContentionExhausted { shard: String, attempts: u32 },
}

/// Per-shard resume position ⇄ watermark translation.
pub struct WatermarkService {
    store: Arc<dyn WatermarkStore>,
    retry: RetryPolicy,
}

impl WatermarkService {
    pub fn new(store: Arc<dyn WatermarkStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// The resume position a watermark was minted for.
    pub async fn get_resume_token(
        &self,
        shard: &str,
        watermark: &Watermark,
    ) -> Result<Option<ResumePosition>, WatermarkError> {
        let key = WatermarkKey::reverse(shard, watermark.as_str());
        Ok(self.store.get(&key).await?.map(ResumePosition::new))
    }

    /// The watermark for `token`, minting one on first sight.
    ///
    /// Repeated calls for one `(shard, token)` return the same watermark.
    /// When two callers mint concurrently, the first forward entry wins and
    /// both return it.
    pub async fn get_or_create_watermark(
        &self,
        shard: &str,
        token: &ResumePosition,
    ) -> Result<Watermark, WatermarkError> {
        let forward = WatermarkKey::forward(shard, token.as_str());
        if let Some(existing) = self.store.get(&forward).await? {
            return decode(&existing);
        }

        let minted = self.mint(shard).await?;
        // The reverse entry of a losing mint is never handed out, so it is
        // written first and left behind on a lost race.
        self.store
            .insert_if_absent(&WatermarkKey::reverse(shard, minted.as_str()), token.as_str())
            .await?;
        match self.store.insert_if_absent(&forward, minted.as_str()).await? {
            Some(winner) => {
                tracing::debug!(shard_id = %shard, token = %token, "lost watermark race");
                decode(&winner)
            }
            None => {
                tracing::trace!(shard_id = %shard, token = %token, watermark = %minted, "minted watermark");
                Ok(minted)
            }
        }
    }

    /// Advance the shard's LSN counter.
    async fn mint(&self, shard: &str) -> Result<Watermark, WatermarkError> {
        let key = WatermarkKey::lsn(shard);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.store.get(&key).await?;
            let next = match &current {
                None => BASE_LSN,
                Some(raw) => raw
                    .parse::<u64>()
                    .ok()
                    .and_then(|lsn| lsn.checked_add(1))
                    .ok_or_else(|| StoreError::Corrupt(format!("lsn counter for {shard}: {raw}")))?,
            };
            if self
                .store
                .compare_and_swap(&key, current.as_deref(), &next.to_string())
                .await?
            {
                return Ok(Watermark::from_lsn(next));
            }
            if !self.retry.should_retry(attempt) {
                return Err(WatermarkError::ContentionExhausted {
                    shard: shard.to_string(),
                    attempts: attempt,
                });
            }
            tokio::time::sleep(self.retry.delay(attempt)).await;
        }
    }
}

fn decode(raw: &str) -> Result<Watermark, WatermarkError> {
    Watermark::parse(raw).map_err(|e| StoreError::Corrupt(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn service() -> WatermarkService {
        WatermarkService::new(Arc::new(MemoryWatermarkStore::new()), RetryPolicy::default())
    }

    #[tokio::test]
    async fn first_watermark_is_base() {
        let wm = service()
            .get_or_create_watermark("s1", &ResumePosition::new("100"))
            .await
            .unwrap();
        assert_eq!(wm.as_str(), "01");
    }

    #[tokio::test]
    async fn shards_count_independently() {
        let svc = service();
        let a = svc.get_or_create_watermark("a", &ResumePosition::new("x")).await.unwrap();
        let b = svc.get_or_create_watermark("b", &ResumePosition::new("x")).await.unwrap();
        assert_eq!(a, b);
        assert!(svc.get_resume_token("a", &Watermark::from_lsn(2)).await.unwrap().is_none());
    }

    /// Every compare-and-swap loses.
    struct Contended(MemoryWatermarkStore);

    #[async_trait]
    impl WatermarkStore for Contended {
        async fn get(&self, key: &WatermarkKey) -> Result<Option<String>, StoreError> {
            self.0.get(key).await
        }

        async fn insert_if_absent(&self, key: &WatermarkKey, value: &str) -> Result<Option<String>, StoreError> {
            self.0.insert_if_absent(key, value).await
        }

        async fn compare_and_swap(
            &self,
            _key: &WatermarkKey,
            _expected: Option<&str>,
            _new: &str,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn contention_is_bounded() {
        let svc = WatermarkService::new(
            Arc::new(Contended(MemoryWatermarkStore::new())),
            RetryPolicy::new(3),
        );
        let err = svc
            .get_or_create_watermark("s1", &ResumePosition::new("1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WatermarkError::ContentionExhausted { attempts: 3, .. }));
    }
}
