//! Tributary Server - replication gateway from a document change stream to
//! relational-replica subscribers.
//!
//! Subscribers open a WebSocket per shard, receive an initial snapshot or
//! resume from a watermark, and then get every routed change as a
//! begin/data/commit bracket. Clients write through `POST /push`, which runs
//! registered mutators with per-client ordering.

pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod push;
pub mod routes;
pub mod source;
pub mod watermark;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tributary_engine::{ChangeTranslator, RoutingRule};

use crate::cache::{RouterCache, RulesSource};
use crate::config::Config;
use crate::gateway::{ConnectionManager, MemoryShardStateStore, ShardStateStore};
use crate::push::{
    documents, MemoryMutationStore, MutatorRegistry, PushProcessor, PushService, RegistryError,
};
use crate::source::{ChangeSource, MemoryChangeSource};
use crate::watermark::{MemoryWatermarkStore, RetryPolicy, WatermarkService};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub shards: Arc<dyn ShardStateStore>,
    pub watermarks: Arc<WatermarkService>,
    pub source: Arc<dyn ChangeSource>,
    pub routers: Arc<RouterCache>,
    pub pusher: Arc<dyn PushService>,
    pub manager: Arc<ConnectionManager>,
    pub translator: ChangeTranslator,
}

impl AppState {
    /// State backed entirely by memory. Pushed document changes are
    /// published to `source`.
    pub fn memory(
        config: Config,
        source: MemoryChangeSource,
        rules: Vec<RoutingRule>,
    ) -> Result<Self, RegistryError> {
        let retry = RetryPolicy::new(config.watermark_max_attempts);
        let store = MemoryMutationStore::new().with_change_feed(source.clone());
        let mut registry = MutatorRegistry::new();
        documents::register(&mut registry)?;

        Ok(Self {
            config: Arc::new(config),
            shards: Arc::new(MemoryShardStateStore::new()),
            watermarks: Arc::new(WatermarkService::new(Arc::new(MemoryWatermarkStore::new()), retry)),
            source: Arc::new(source),
            routers: Arc::new(RouterCache::new(RulesSource::Static(rules), None)),
            pusher: Arc::new(PushProcessor::new(store, registry)),
            manager: ConnectionManager::new_shared(),
            translator: ChangeTranslator::new(),
        })
    }
}

/// Build the HTTP application.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
