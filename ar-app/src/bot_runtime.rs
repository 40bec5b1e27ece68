use ar_llm::UsageStats;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{EngineDeps, EngineState, EngineStatus, PollingEngine};

#[derive(Debug, Clone, Serialize)]
pub struct BotStatus {
    pub running: bool,
    pub engine: EngineStatus,
    pub usage: UsageStats,
}

struct ActiveEngine {
    shutdown: CancellationToken,
    task_handle: JoinHandle<()>,
}

/// Owns at most one polling engine task and its shared status.
pub struct BotRuntime {
    deps: EngineDeps,
    state: Arc<RwLock<EngineStatus>>,
    active: Mutex<Option<ActiveEngine>>,
}

impl BotRuntime {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            deps,
            state: Arc::new(RwLock::new(EngineStatus::default())),
            active: Mutex::new(None),
        }
    }

    /// Returns false when an engine is already running.
    pub async fn start(&self) -> bool {
        let mut active = self.active.lock().await;
        if active
            .as_ref()
            .is_some_and(|engine| !engine.task_handle.is_finished())
        {
            return false;
        }

        {
            let mut guard = self.state.write().await;
            *guard = EngineStatus {
                state: EngineState::Running,
                started_at: Some(Utc::now()),
                ..EngineStatus::default()
            };
        }

        let shutdown = CancellationToken::new();
        let engine = PollingEngine::new(self.deps.clone());
        let state = Arc::clone(&self.state);
        let token = shutdown.clone();
        let task_handle = tokio::spawn(async move {
            engine.run(Arc::clone(&state), token).await;
            let mut guard = state.write().await;
            guard.state = EngineState::Stopped;
            guard.stopped_at = Some(Utc::now());
        });
        *active = Some(ActiveEngine {
            shutdown,
            task_handle,
        });
        tracing::info!("bot engine started");
        true
    }

    /// Cancels the engine and waits for its current step to finish.
    /// Returns false when nothing was running.
    pub async fn stop(&self) -> bool {
        let mut active = self.active.lock().await;
        let Some(engine) = active.take() else {
            return false;
        };

        self.state.write().await.state = EngineState::Stopping;
        engine.shutdown.cancel();
        if let Err(error) = engine.task_handle.await {
            tracing::warn!(?error, "bot engine shutdown join failed");
        }

        let mut guard = self.state.write().await;
        guard.state = EngineState::Stopped;
        if guard.stopped_at.is_none() {
            guard.stopped_at = Some(Utc::now());
        }
        tracing::info!("bot engine stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|engine| !engine.task_handle.is_finished())
    }

    pub async fn status_snapshot(&self) -> BotStatus {
        BotStatus {
            running: self.is_running().await,
            engine: self.state.read().await.clone(),
            usage: self.deps.limiter.usage_stats(),
        }
    }
}
