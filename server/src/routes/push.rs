//! Mutation push endpoint.

use axum::{extract::State, routing::post, Json, Router};
use tributary_engine::{PushRequest, PushResponse};

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::AppState;

const PUSH_VERSION: u32 = 1;

pub fn routes() -> Router<AppState> {
    Router::new().route("/push", post(push_handler))
}

/// POST /push - apply a batch of mutations.
async fn push_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    if request.push_version != PUSH_VERSION {
        return Err(AppError::BadRequest(format!(
            "unsupported pushVersion {}",
            request.push_version
        )));
    }
    Ok(Json(state.pusher.push(request).await))
}
