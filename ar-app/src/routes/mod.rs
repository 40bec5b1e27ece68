pub mod bot;
pub mod conversations;
pub mod health;

use axum::http::StatusCode;
use axum::{Json, Router};

pub(crate) type ApiError = (StatusCode, Json<serde_json::Value>);

pub(crate) fn internal_error(error: anyhow::Error) -> ApiError {
    tracing::error!(error = %format!("{error:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "status": "error",
            "error": error.to_string(),
        })),
    )
}

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(bot::router())
        .merge(conversations::router())
}

#[cfg(test)]
mod tests {
    use crate::bot_runtime::BotRuntime;
    use crate::config::{EngineConfig, GenerationConfig};
    use crate::engine::{EngineDeps, HttpClientFactory};
    use crate::server::AppState;
    use crate::settings::{SettingsProvider, SqliteSettings};
    use crate::store::{ConversationStore, Database, MessageRole};
    use ar_channels::{ConversationId, MessageId};
    use ar_llm::{RateLimiter, RateLimits};
    use axum::Extension;
    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let db = Database::open_in_memory().expect("db");
        let settings = SqliteSettings::new(db.clone());
        let store = ConversationStore::new(db);
        let runtime = BotRuntime::new(EngineDeps {
            settings: Arc::new(settings.clone()),
            store: store.clone(),
            factory: Arc::new(HttpClientFactory::new(None)),
            limiter: Arc::new(RateLimiter::new(RateLimits::default())),
            engine: EngineConfig::default(),
            generation: GenerationConfig::default(),
        });
        Arc::new(AppState {
            runtime: Arc::new(runtime),
            store,
            settings,
        })
    }

    fn app(state: Arc<AppState>) -> Router {
        super::router().layer(Extension(state))
    }

    async fn response_body_json(response: axum::response::Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        serde_json::from_slice(&body).expect("response json")
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.expect("response");
        let status = response.status();
        (status, response_body_json(response).await)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn health_reports_a_stopped_bot() {
        let (status, body) = send(app(test_state()), get("/api/v1/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["checks"]["bot"]["running"], json!(false));
        assert_eq!(body["checks"]["bot"]["state"], "stopped");
        assert_eq!(body["checks"]["budget"]["minute_limit"], json!(12));
    }

    #[tokio::test]
    async fn settings_update_is_partial_and_redacted() {
        let state = test_state();
        let (status, body) = send(
            app(state.clone()),
            json_request(
                "PUT",
                "/api/v1/bot/settings",
                json!({"transport_instance_name": "loja", "generation_api_key": "secret"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settings"]["transport_instance_name"], "loja");
        assert_eq!(body["settings"]["generation_api_key"], "set");
        assert!(!body.to_string().contains("secret\""));

        let stored = state.settings.load().await.expect("load");
        assert_eq!(stored.generation_api_key, "secret");
        assert!(!stored.active);

        let response = app(state.clone())
            .oneshot(json_request(
                "PUT",
                "/api/v1/bot/settings",
                json!({"api_key": "x"}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = send(
            app(state),
            json_request("PUT", "/api/v1/bot/settings", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn conversations_list_messages_and_mark_read() {
        let state = test_state();
        let conversation = ConversationId::new("551199999999");
        state
            .store
            .append(&conversation, MessageRole::Inbound, "Oi", Some(&MessageId::new("M1")))
            .await
            .expect("append");
        state
            .store
            .append(&conversation, MessageRole::Outbound, "Olá!", None)
            .await
            .expect("append");

        let (status, body) = send(app(state.clone()), get("/api/v1/conversations")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["conversations"][0]["conversation_id"], "551199999999");
        assert_eq!(body["conversations"][0]["unread_count"], json!(1));

        let (status, body) = send(
            app(state.clone()),
            get("/api/v1/conversations/551199999999/messages?limit=1"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "outbound");

        let (status, body) = send(
            app(state.clone()),
            json_request("POST", "/api/v1/conversations/551199999999/read", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["marked_read"], json!(1));

        let (_, body) = send(app(state), get("/api/v1/conversations")).await;
        assert_eq!(body["conversations"][0]["unread_count"], json!(0));
    }

    #[tokio::test]
    async fn bot_can_be_started_and_stopped_over_http() {
        let state = test_state();
        let (status, body) = send(
            app(state.clone()),
            json_request("POST", "/api/v1/bot/start", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["started"], json!(true));
        assert_eq!(body["bot"]["engine"]["state"], "running");

        let (_, body) = send(app(state.clone()), get("/api/v1/bot/status")).await;
        assert_eq!(body["running"], json!(true));

        let (_, body) = send(
            app(state.clone()),
            json_request("POST", "/api/v1/bot/stop", json!({})),
        )
        .await;
        assert_eq!(body["stopped"], json!(true));
        assert_eq!(body["bot"]["engine"]["state"], "stopped");

        let (_, body) = send(
            app(state),
            json_request("POST", "/api/v1/bot/stop", json!({})),
        )
        .await;
        assert_eq!(body["stopped"], json!(false));
    }
}
