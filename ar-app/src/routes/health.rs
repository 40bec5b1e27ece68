use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let bot = state.runtime.status_snapshot().await;
    let connected = bot
        .engine
        .connection
        .as_ref()
        .is_some_and(|connection| connection.is_connected());

    Json(serde_json::json!({
        "status": "ok",
        "checked_at": Utc::now(),
        "checks": {
            "bot": {
                "running": bot.running,
                "state": bot.engine.state,
                "transport_connected": connected,
                "last_iteration_at": bot.engine.last_iteration_at,
                "last_error_at": bot.engine.last_error_at,
                "last_error": bot.engine.last_error,
            },
            "budget": bot.usage,
        }
    }))
}
