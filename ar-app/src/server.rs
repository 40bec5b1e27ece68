//! autoreply server and CLI commands.
//!
//! Wires the SQLite store, live settings and the polling engine together and
//! mounts the operator routes on top.

use crate::bot_runtime::BotRuntime;
use crate::config::{AppConfig, ServerConfig};
use crate::engine::{ClientFactory, EngineDeps, HttpClientFactory};
use crate::routes;
use crate::settings::{SettingKey, SettingsProvider, SqliteSettings};
use crate::store::{ConversationStore, Database, MessageRole};
use anyhow::Result;
use ar_channels::{ConversationId, SendReceipt};
use ar_llm::{RateLimiter, RateLimits};
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub runtime: Arc<BotRuntime>,
    pub store: ConversationStore,
    pub settings: SqliteSettings,
}

struct Components {
    store: ConversationStore,
    settings: SqliteSettings,
    factory: Arc<HttpClientFactory>,
}

/// Opens the database and brings stored settings up to date with config and env.
async fn open_components(cfg: &AppConfig) -> Result<Components> {
    let db = Database::open(&cfg.store.path)?;
    let settings = SqliteSettings::new(db.clone());
    let seeded = settings.seed_missing(cfg.bot.entries()).await?;
    let overridden = settings
        .apply(cfg.bot_overrides.clone().into_iter().collect())
        .await?;
    tracing::info!(
        db_path = %cfg.store.path.display(),
        seeded,
        overridden,
        "store opened"
    );
    Ok(Components {
        store: ConversationStore::new(db),
        settings,
        factory: Arc::new(HttpClientFactory::new(cfg.generation.api_base.clone())),
    })
}

fn engine_deps(cfg: &AppConfig, components: &Components) -> EngineDeps {
    EngineDeps {
        settings: Arc::new(components.settings.clone()),
        store: components.store.clone(),
        factory: components.factory.clone(),
        limiter: Arc::new(RateLimiter::new(RateLimits {
            max_calls_per_minute: cfg.generation.max_calls_per_minute,
            max_calls_per_day: cfg.generation.max_calls_per_day,
        })),
        engine: cfg.engine.clone(),
        generation: cfg.generation.clone(),
    }
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AppConfig::load(config_path).await?;
    let addr = cfg.bind_addr()?;
    let components = open_components(&cfg).await?;
    let runtime = Arc::new(BotRuntime::new(engine_deps(&cfg, &components)));
    let listener = preflight_bind_listener(addr).await?;

    let state = Arc::new(AppState {
        runtime: runtime.clone(),
        store: components.store,
        settings: components.settings,
    });

    if cfg.server.autostart_bot {
        runtime.start().await;
    } else {
        tracing::info!("bot autostart disabled; POST /api/v1/bot/start to begin polling");
    }

    let app = build_app(state, &cfg.server);
    let shutdown = CancellationToken::new();

    tracing::info!(%addr, "autoreply serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    runtime.stop().await;
    Ok(())
}

/// Engine only, no HTTP surface; exits on ctrl-c or SIGTERM.
pub async fn run_foreground(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AppConfig::load(config_path).await?;
    let components = open_components(&cfg).await?;
    let runtime = BotRuntime::new(engine_deps(&cfg, &components));

    runtime.start().await;
    let shutdown = CancellationToken::new();
    shutdown_signal(shutdown.clone()).await;
    runtime.stop().await;

    let status = runtime.status_snapshot().await;
    tracing::info!(
        iterations = status.engine.iterations,
        total_replies = status.engine.total_replies,
        total_errors = status.engine.total_errors,
        "engine run finished"
    );
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AppConfig::load(config_path).await?;
    let components = open_components(&cfg).await?;
    let settings = components.settings.load().await?;
    let source = components.factory.message_source(&settings)?;
    let connection = source.check_connection().await;
    let reconnect_hint = if connection.is_connected() {
        None
    } else {
        source.reconnect_hint()
    };
    let conversations = components.store.conversations().await?;

    let report = serde_json::json!({
        "settings": settings.redacted(),
        "connection": connection,
        "reconnect_hint": reconnect_hint,
        "conversations": conversations.len(),
        "unread": conversations.iter().map(|c| c.unread_count).sum::<i64>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn settings_show(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AppConfig::load(config_path).await?;
    let components = open_components(&cfg).await?;
    let settings = components.settings.load().await?;
    println!("{}", serde_json::to_string_pretty(&settings.redacted())?);
    Ok(())
}

pub async fn settings_set(config_path: Option<PathBuf>, key: &str, value: &str) -> Result<()> {
    let key: SettingKey = key.parse()?;
    let cfg = AppConfig::load(config_path).await?;
    let components = open_components(&cfg).await?;
    components.settings.set(key, value).await?;
    println!("{key} updated");
    Ok(())
}

pub async fn history(config_path: Option<PathBuf>, conversation: &str, limit: usize) -> Result<()> {
    let cfg = AppConfig::load(config_path).await?;
    let components = open_components(&cfg).await?;
    let messages = components
        .store
        .recent(&ConversationId::new(conversation.trim()), limit)
        .await?;
    if messages.is_empty() {
        println!("no messages stored for {conversation}");
    }
    for message in messages {
        let who = match message.role {
            MessageRole::Inbound => "<",
            MessageRole::Outbound => ">",
        };
        println!(
            "{} {who} {}",
            message.created_at.format("%Y-%m-%d %H:%M:%S"),
            message.text
        );
    }
    Ok(())
}

/// Sends through the configured transport and records the message on delivery.
pub async fn send_one_shot(config_path: Option<PathBuf>, number: &str, message: &str) -> Result<()> {
    let cfg = AppConfig::load(config_path).await?;
    let components = open_components(&cfg).await?;
    let settings = components.settings.load().await?;
    let source = components.factory.message_source(&settings)?;
    let conversation = ConversationId::new(number.trim());

    match source.send(&conversation, message).await {
        SendReceipt::Delivered => {
            components
                .store
                .append(&conversation, MessageRole::Outbound, message.trim(), None)
                .await?;
            println!("sent to {conversation}");
            Ok(())
        }
        SendReceipt::Rejected { reason } => Err(anyhow::anyhow!("send failed: {reason}")),
    }
}

pub fn build_app(state: Arc<AppState>, server: &ServerConfig) -> axum::Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "listener bound");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn env_overrides_win_over_seeds_and_seeds_keep_stored_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = AppConfig::parse(
            r#"
[bot]
active = true
transport_instance_name = "loja"
generation_api_key = "from-file"
"#,
        )
        .expect("parse");
        cfg.store.path = dir.path().join("autoreply.db");
        cfg.bot_overrides
            .insert(SettingKey::GenerationApiKey, "from-env".to_string());

        let components = open_components(&cfg).await.expect("open");
        let loaded = components.settings.load().await.expect("load");
        assert!(loaded.active);
        assert_eq!(loaded.transport_instance_name, "loja");
        assert_eq!(loaded.generation_api_key, "from-env");

        // An operator change survives a restart with the same config.
        components
            .settings
            .set(SettingKey::TransportInstanceName, "loja-2")
            .await
            .expect("set");
        drop(components);
        let components = open_components(&cfg).await.expect("reopen");
        let loaded = components.settings.load().await.expect("load");
        assert_eq!(loaded.transport_instance_name, "loja-2");
    }

    #[test]
    fn request_id_defaults_to_missing() {
        assert_eq!(request_id_from_headers(&HeaderMap::new()), "missing");
    }
}
