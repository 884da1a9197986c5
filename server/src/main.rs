//! Tributary Server - replication gateway for relational-replica subscribers.
//!
//! Streams routed document changes over WebSocket and accepts client writes
//! through registered mutators.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tributary_engine::ChangeTranslator;
use tributary_server::cache::RouterCache;
use tributary_server::config::Config;
use tributary_server::db::{self, PgChangeSource, PgMutationStore, PgShardStateStore, PgWatermarkStore};
use tributary_server::gateway::ConnectionManager;
use tributary_server::push::{documents, MutatorRegistry, PushProcessor};
use tributary_server::watermark::{RetryPolicy, WatermarkService};
use tributary_server::{app, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tributary_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Tributary Server on {}:{}", config.host, config.port);

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;

    // Run migrations
    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    // Fail fast on bad routing rules
    let routers = Arc::new(RouterCache::from_config(&config));
    let router = routers.get().await?;
    tracing::info!(
        rules = router.rules().count(),
        collections = router.source_collections().len(),
        "routing rules ready"
    );

    let mut registry = MutatorRegistry::new();
    documents::register(&mut registry)?;

    // Build application state
    let manager = ConnectionManager::new_shared();
    let state = AppState {
        config: Arc::new(config.clone()),
        shards: Arc::new(PgShardStateStore::new(pool.clone())),
        watermarks: Arc::new(WatermarkService::new(
            Arc::new(PgWatermarkStore::new(pool.clone())),
            RetryPolicy::new(config.watermark_max_attempts),
        )),
        source: Arc::new(PgChangeSource::new(
            pool.clone(),
            config.source_database.clone(),
            config.change_poll_interval,
        )),
        routers,
        pusher: Arc::new(PushProcessor::new(PgMutationStore::new(pool), registry)),
        manager: manager.clone(),
        translator: ChangeTranslator::new(),
    };

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolve on ctrl-c after cancelling every live session.
async fn shutdown_signal(manager: Arc<ConnectionManager>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!(
        active_sessions = manager.session_count(),
        "Shutting down, closing sessions"
    );
    manager.cancel_all();
}
