use crate::bot_runtime::BotStatus;
use crate::server::AppState;
use crate::settings::{SettingKey, SettingsProvider};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

use super::{ApiError, internal_error};

/// Partial update; omitted fields keep their stored value, empty strings clear.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsUpdate {
    active: Option<bool>,
    transport_base_url: Option<String>,
    transport_token: Option<String>,
    transport_instance_name: Option<String>,
    generation_api_key: Option<String>,
}

impl SettingsUpdate {
    fn into_entries(self) -> Vec<(SettingKey, String)> {
        let mut entries = Vec::new();
        if let Some(active) = self.active {
            entries.push((SettingKey::Active, active.to_string()));
        }
        let strings = [
            (SettingKey::TransportBaseUrl, self.transport_base_url),
            (SettingKey::TransportToken, self.transport_token),
            (SettingKey::TransportInstanceName, self.transport_instance_name),
            (SettingKey::GenerationApiKey, self.generation_api_key),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                entries.push((key, value.trim().to_string()));
            }
        }
        entries
    }
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/bot/status", get(get_status))
        .route("/api/v1/bot/start", post(start_bot))
        .route("/api/v1/bot/stop", post(stop_bot))
        .route("/api/v1/bot/settings", get(get_settings).put(put_settings))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_status(Extension(state): Extension<Arc<AppState>>) -> Json<BotStatus> {
    Json(state.runtime.status_snapshot().await)
}

#[tracing::instrument(level = "info", skip_all)]
async fn start_bot(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let started = state.runtime.start().await;
    Json(serde_json::json!({
        "status": "ok",
        "started": started,
        "bot": state.runtime.status_snapshot().await,
    }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn stop_bot(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let stopped = state.runtime.stop().await;
    Json(serde_json::json!({
        "status": "ok",
        "stopped": stopped,
        "bot": state.runtime.status_snapshot().await,
    }))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_settings(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let settings = state.settings.load().await.map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "settings": settings.redacted() })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn put_settings(
    Extension(state): Extension<Arc<AppState>>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = update.into_entries();
    if entries.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "status": "error",
                "error": "no settings in request body",
            })),
        ));
    }
    let keys: Vec<&'static str> = entries.iter().map(|(key, _)| key.as_str()).collect();
    state.settings.apply(entries).await.map_err(internal_error)?;
    tracing::info!(?keys, "bot settings updated over http");

    let settings = state.settings.load().await.map_err(internal_error)?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "updated": keys,
        "settings": settings.redacted(),
    })))
}
