//! Operator endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, post},
    Json, Router,
};
use serde::Serialize;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectResponse {
    pub shard_id: String,
    pub cancelled: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/routing/reload", post(reload_handler))
        .route("/admin/shards/{shard_id}/sessions", delete(disconnect_handler))
}

/// POST /admin/routing/reload - drop cached routing rules.
///
/// Sessions opened afterwards use the reloaded rules.
async fn reload_handler(State(state): State<AppState>, _auth: AuthUser) -> Result<StatusCode> {
    state.routers.clear().await;
    let router = state.routers.get().await?;
    tracing::info!(rules = router.rules().count(), "routing rules reloaded");
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /admin/shards/{shard_id}/sessions - cancel a shard's sessions.
async fn disconnect_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(shard_id): Path<String>,
) -> Json<DisconnectResponse> {
    let cancelled = state.manager.cancel_shard(&shard_id);
    tracing::info!(shard_id = %shard_id, cancelled, "shard sessions cancelled");
    Json(DisconnectResponse { shard_id, cancelled })
}
