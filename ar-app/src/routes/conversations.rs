use crate::server::AppState;
use ar_channels::ConversationId;
use axum::extract::{Path, Query};
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

use super::{ApiError, internal_error};

const DEFAULT_MESSAGE_LIMIT: usize = 50;
const MAX_MESSAGE_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/conversations", get(list_conversations))
        .route("/api/v1/conversations/{id}/messages", get(list_messages))
        .route("/api/v1/conversations/{id}/read", post(mark_read))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_conversations(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conversations = state.store.conversations().await.map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "conversations": conversations })))
}

#[tracing::instrument(level = "debug", skip_all, fields(conversation = %id))]
async fn list_messages(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_MESSAGE_LIMIT)
        .clamp(1, MAX_MESSAGE_LIMIT);
    let messages = state
        .store
        .recent(&ConversationId::new(id.trim()), limit)
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({
        "conversation_id": id,
        "messages": messages,
    })))
}

#[tracing::instrument(level = "info", skip_all, fields(conversation = %id))]
async fn mark_read(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let marked = state
        .store
        .mark_read(&ConversationId::new(id.trim()))
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "conversation_id": id,
        "marked_read": marked,
    })))
}
