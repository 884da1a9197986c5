//! Change stream endpoint.
//!
//! `GET /changes/v0/stream?shardID=..&lastWatermark=..&token=..` upgrades to
//! a WebSocket. Credentials are checked after the upgrade so that a refusal
//! can be reported with a close code.

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::auth::{bearer_token, AuthError};
use crate::gateway::{authorize, handle_socket, CloseReason, SessionContext};
use crate::AppState;

/// Query parameters of a stream request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "shardID")]
    pub shard_id: Option<String>,
    #[serde(rename = "lastWatermark")]
    pub last_watermark: Option<String>,
    pub token: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/changes/v0/stream", get(stream_handler))
}

/// GET /changes/v0/stream - subscribe to routed changes.
async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Response {
    let presented = match &query.token {
        Some(token) => Ok(Some(token.clone())),
        None => bearer_token(&headers).map(|token| token.map(str::to_string)),
    };
    ws.on_upgrade(move |socket| serve_stream(socket, state, query, presented))
}

async fn serve_stream(
    mut socket: WebSocket,
    state: AppState,
    query: StreamQuery,
    presented: Result<Option<String>, AuthError>,
) {
    if let Err(reason) = admit(&state, &query, presented) {
        tracing::info!(code = reason.code, reason = %reason.reason, "subscriber refused");
        let _ = socket.send(reason.into_message()).await;
        return;
    }
    let shard_id = query.shard_id.unwrap_or_default();

    // the session keeps this router for its whole lifetime
    let router = match state.routers.get().await {
        Ok(router) => router,
        Err(e) => {
            tracing::error!(shard_id = %shard_id, "cannot load routing rules: {}", e);
            let _ = socket.send(CloseReason::internal(e.to_string()).into_message()).await;
            return;
        }
    };

    let ctx = SessionContext {
        shards: state.shards.clone(),
        watermarks: state.watermarks.clone(),
        source: state.source.clone(),
        router,
        translator: state.translator,
    };
    handle_socket(
        socket,
        ctx,
        state.manager.clone(),
        shard_id,
        query.last_watermark,
        state.config.session_buffer,
    )
    .await;
}

fn admit(
    state: &AppState,
    query: &StreamQuery,
    presented: Result<Option<String>, AuthError>,
) -> Result<(), CloseReason> {
    let presented = presented.map_err(|e| CloseReason::policy_violation(e.to_string()))?;
    authorize(state.config.auth_token.as_deref(), presented.as_deref())?;
    match query.shard_id.as_deref() {
        Some(shard) if !shard.is_empty() => Ok(()),
        _ => Err(CloseReason::policy_violation("missing shardID")),
    }
}
