//! Cached routing configuration.
//!
//! Routing rules are compiled once into a [`TableRouter`] and handed out as
//! `Arc` snapshots. A session keeps the snapshot it got at connect time, so
//! reloading the rules only affects sessions opened afterwards.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tributary_engine::{RoutingRule, TableRouter};

use crate::config::{Config, ConfigError};

/// Where routing rules come from.
#[derive(Debug, Clone)]
pub enum RulesSource {
    /// Rules given in code, mostly for tests.
    Static(Vec<RoutingRule>),
    /// A JSON file holding an ordered list of rules.
    File(PathBuf),
}

struct Cached {
    router: Arc<TableRouter>,
    loaded_at: Instant,
}

/// Lazily compiled router with an optional time-to-live.
pub struct RouterCache {
    source: RulesSource,
    ttl: Option<Duration>,
    slot: RwLock<Option<Cached>>,
}

impl RouterCache {
    pub fn new(source: RulesSource, ttl: Option<Duration>) -> Self {
        Self {
            source,
            ttl,
            slot: RwLock::new(None),
        }
    }

    /// Cache for the configured rules file. No file means no rules.
    pub fn from_config(config: &Config) -> Self {
        let source = match &config.routing_rules_path {
            Some(path) => RulesSource::File(path.clone()),
            None => RulesSource::Static(Vec::new()),
        };
        Self::new(source, config.routing_cache_ttl)
    }

    /// The current router, loading it if absent or expired.
    pub async fn get(&self) -> Result<Arc<TableRouter>, ConfigError> {
        {
            let slot = self.slot.read().await;
            if let Some(cached) = slot.as_ref().filter(|c| self.is_fresh(c)) {
                return Ok(cached.router.clone());
            }
        }

        let mut slot = self.slot.write().await;
        // another task may have reloaded while we waited for the lock
        if let Some(cached) = slot.as_ref().filter(|c| self.is_fresh(c)) {
            return Ok(cached.router.clone());
        }

        let router = Arc::new(self.load().await?);
        tracing::info!(rules = router.rules().count(), "routing rules loaded");
        *slot = Some(Cached {
            router: router.clone(),
            loaded_at: Instant::now(),
        });
        Ok(router)
    }

    /// Drop the cached router. The next [`get`](Self::get) reloads the rules.
    pub async fn clear(&self) {
        self.slot.write().await.take();
    }

    fn is_fresh(&self, cached: &Cached) -> bool {
        match self.ttl {
            Some(ttl) => cached.loaded_at.elapsed() < ttl,
            None => true,
        }
    }

    async fn load(&self) -> Result<TableRouter, ConfigError> {
        let rules = match &self.source {
            RulesSource::Static(rules) => rules.clone(),
            RulesSource::File(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| ConfigError::UnreadableRules {
                        path: path.clone(),
                        source,
                    })?;
                serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidRules(e.to_string()))?
            }
        };
        TableRouter::new(rules).map_err(|e| ConfigError::InvalidRules(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("tributary-rules-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn static_rules_are_cached() {
        let cache = RouterCache::new(
            RulesSource::Static(vec![RoutingRule::new("direct_rooms", "rooms")]),
            None,
        );
        let first = cache.get().await.unwrap();
        let second = cache.get().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.source_collections(), vec!["rooms"]);
    }

    #[tokio::test]
    async fn clear_reloads_from_file() {
        let path = rules_file(r#"[{"logicalTableName":"a","sourceCollection":"rooms"}]"#);
        let cache = RouterCache::new(RulesSource::File(path.clone()), None);
        let before = cache.get().await.unwrap();
        assert_eq!(before.rules().count(), 1);

        let updated = json!([
            {"logicalTableName": "a", "sourceCollection": "rooms"},
            {"logicalTableName": "b", "sourceCollection": "users", "filter": {"active": true}}
        ]);
        std::fs::write(&path, updated.to_string()).unwrap();

        // still cached
        assert_eq!(cache.get().await.unwrap().rules().count(), 1);

        cache.clear().await;
        let after = cache.get().await.unwrap();
        assert_eq!(after.rules().count(), 2);
        // sessions holding the old snapshot keep their rules
        assert_eq!(before.rules().count(), 1);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn expired_entries_are_reloaded() {
        let cache = RouterCache::new(RulesSource::Static(Vec::new()), Some(Duration::ZERO));
        let first = cache.get().await.unwrap();
        let second = cache.get().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn bad_rules_are_config_errors() {
        let missing = RouterCache::new(
            RulesSource::File(std::env::temp_dir().join("tributary-no-such-rules.json")),
            None,
        );
        assert!(matches!(
            missing.get().await,
            Err(ConfigError::UnreadableRules { .. })
        ));

        let path = rules_file("{not json");
        let garbled = RouterCache::new(RulesSource::File(path.clone()), None);
        assert!(matches!(garbled.get().await, Err(ConfigError::InvalidRules(_))));
        std::fs::remove_file(&path).ok();

        let duplicate = RouterCache::new(
            RulesSource::Static(vec![
                RoutingRule::new("t", "rooms"),
                RoutingRule::new("t", "users"),
            ]),
            None,
        );
        assert!(matches!(duplicate.get().await, Err(ConfigError::InvalidRules(_))));
    }
}
