//! HTTP route definitions.

mod admin;
mod changes;
mod health;
mod push;

pub use changes::StreamQuery;
pub use health::HealthResponse;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(admin::routes())
        .merge(changes::routes())
        .merge(push::routes())
}
