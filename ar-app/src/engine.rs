//! Polling engine: fetch recent messages, answer the fresh ones, record both sides.
//!
//! One iteration:
//! 1. reload live settings and rebuild clients whose settings changed
//! 2. sleep while inactive or disconnected
//! 3. fetch and normalize, keep only fresh envelopes, oldest first
//! 4. per message: skip echoes/broadcasts/duplicates, persist, generate, send, persist reply
//!
//! Errors or panics in one message never abort the batch; errors in an iteration never end
//! the loop.

use anyhow::{Context, anyhow};
use ar_channels::{
    ConnectionStatus, ConversationId, EvolutionAdapter, FetchedBatch, InboundEnvelope, MessageId,
    MessageSource, SendReceipt,
};
use ar_llm::{
    GeminiBackend, GenerationBackend, GenerationClient, GenerationOutcome, HistoryTurn,
    RateLimiter, SuppressReason,
};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, GenerationConfig};
use crate::settings::{BotSettings, SettingsProvider};
use crate::store::{ConversationStore, MessageRole};

/// Builds the outbound clients from a settings snapshot.
pub trait ClientFactory: Send + Sync {
    fn message_source(&self, settings: &BotSettings) -> anyhow::Result<Arc<dyn MessageSource>>;
    fn generation_backend(&self, api_key: &str) -> anyhow::Result<Arc<dyn GenerationBackend>>;
}

/// Evolution API transport and Gemini generation over HTTP.
pub struct HttpClientFactory {
    gemini_api_base: Option<String>,
}

impl HttpClientFactory {
    pub fn new(gemini_api_base: Option<String>) -> Self {
        Self { gemini_api_base }
    }
}

impl ClientFactory for HttpClientFactory {
    fn message_source(&self, settings: &BotSettings) -> anyhow::Result<Arc<dyn MessageSource>> {
        Ok(Arc::new(EvolutionAdapter::new(
            &settings.transport_base_url,
            &settings.transport_token,
            &settings.transport_instance_name,
        )?))
    }

    fn generation_backend(&self, api_key: &str) -> anyhow::Result<Arc<dyn GenerationBackend>> {
        let mut backend = GeminiBackend::new(api_key)?;
        if let Some(api_base) = &self.gemini_api_base {
            backend = backend.with_api_base(api_base);
        }
        Ok(Arc::new(backend))
    }
}

/// Everything an engine needs; cloned for every start.
#[derive(Clone)]
pub struct EngineDeps {
    pub settings: Arc<dyn SettingsProvider>,
    pub store: ConversationStore,
    pub factory: Arc<dyn ClientFactory>,
    /// Shared across restarts so budgets survive a stop/start.
    pub limiter: Arc<RateLimiter>,
    pub engine: EngineConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IterationReport {
    pub fetched: usize,
    pub malformed: usize,
    pub unparseable: bool,
    pub fresh: usize,
    pub replied: usize,
    pub suppressed: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub send_failures: usize,
    pub errors: usize,
}

impl IterationReport {
    fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Replied => self.replied += 1,
            Disposition::Suppressed(_) => self.suppressed += 1,
            Disposition::Duplicate => self.duplicates += 1,
            Disposition::SendFailed(_) => self.send_failures += 1,
            Disposition::SelfEcho | Disposition::Ignored(_) => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IterationOutcome {
    Inactive,
    Disconnected { reconnect_hint: Option<String> },
    Polled(IterationReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub iterations: u64,
    pub total_replies: u64,
    pub total_errors: u64,
    pub last_iteration_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<IterationOutcome>,
    pub connection: Option<ConnectionStatus>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            state: EngineState::Stopped,
            started_at: None,
            stopped_at: None,
            iterations: 0,
            total_replies: 0,
            total_errors: 0,
            last_iteration_at: None,
            last_outcome: None,
            connection: None,
            last_error: None,
            last_error_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
    SelfEcho,
    Ignored(&'static str),
    Duplicate,
    Replied,
    Suppressed(SuppressReason),
    SendFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TransportKey {
    base_url: String,
    token: String,
    instance: String,
}

impl From<&BotSettings> for TransportKey {
    fn from(settings: &BotSettings) -> Self {
        Self {
            base_url: settings.transport_base_url.trim().to_string(),
            token: settings.transport_token.trim().to_string(),
            instance: settings.transport_instance_name.trim().to_string(),
        }
    }
}

pub struct PollingEngine {
    deps: EngineDeps,
    source: Option<Arc<dyn MessageSource>>,
    transport_key: Option<TransportKey>,
    generator: Option<GenerationClient>,
    generation_key: Option<String>,
    last_connection: Option<ConnectionStatus>,
}

impl PollingEngine {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            deps,
            source: None,
            transport_key: None,
            generator: None,
            generation_key: None,
            last_connection: None,
        }
    }

    /// Loops until `shutdown` fires. Sleeps are interruptible; an in-flight
    /// iteration stops between messages.
    pub async fn run(mut self, status: Arc<RwLock<EngineStatus>>, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_seconds = self.deps.engine.poll_interval_seconds,
            freshness_window_seconds = self.deps.engine.freshness_window_seconds,
            "polling engine started"
        );

        while !shutdown.is_cancelled() {
            let result = match AssertUnwindSafe(self.run_iteration(&shutdown))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(anyhow!(
                    "engine iteration panicked: {}",
                    crate::panic_payload_to_string(&*payload)
                )),
            };

            let pause = {
                let mut guard = status.write().await;
                guard.iterations += 1;
                guard.last_iteration_at = Some(Utc::now());
                guard.connection = self.last_connection.clone();
                match result {
                    Ok(outcome) => {
                        let pause = self.pause_after(&outcome);
                        if let IterationOutcome::Polled(report) = &outcome {
                            guard.total_replies += report.replied as u64;
                        }
                        guard.last_outcome = Some(outcome);
                        pause
                    }
                    Err(error) => {
                        let message = format!("{error:#}");
                        tracing::error!(error = %message, "engine iteration failed; backing off");
                        guard.total_errors += 1;
                        guard.last_error = Some(message);
                        guard.last_error_at = Some(Utc::now());
                        self.deps.engine.error_backoff()
                    }
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!("polling engine stopped");
    }

    fn pause_after(&self, outcome: &IterationOutcome) -> Duration {
        match outcome {
            IterationOutcome::Inactive => self.deps.engine.inactive_sleep(),
            IterationOutcome::Disconnected { .. } => self.deps.engine.disconnected_sleep(),
            IterationOutcome::Polled(_) => self.deps.engine.poll_interval(),
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn run_iteration(
        &mut self,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<IterationOutcome> {
        let settings = self
            .deps
            .settings
            .load()
            .await
            .context("load bot settings")?;
        self.apply_settings(&settings)?;

        if !settings.active {
            self.last_connection = None;
            tracing::debug!("bot inactive; skipping poll");
            return Ok(IterationOutcome::Inactive);
        }

        let source = self
            .source
            .clone()
            .ok_or_else(|| anyhow!("transport client not built"))?;
        let connection = source.check_connection().await;
        self.last_connection = Some(connection.clone());
        if !connection.is_connected() {
            let reconnect_hint = source.reconnect_hint();
            tracing::warn!(
                source = source.source_id(),
                state = ?connection.state,
                detail = %connection.detail,
                reconnect_hint = ?reconnect_hint,
                "transport not connected; waiting"
            );
            return Ok(IterationOutcome::Disconnected { reconnect_hint });
        }

        let batch = source
            .fetch_recent(self.deps.engine.fetch_count)
            .await
            .context("fetch recent messages")?;
        if batch.is_empty() {
            tracing::debug!(source = source.source_id(), "transport returned no messages");
        }

        let mut report = IterationReport {
            unparseable: matches!(batch, FetchedBatch::Unparseable(_)),
            ..IterationReport::default()
        };
        let normalized = batch.normalize();
        report.fetched = normalized.envelopes.len() + normalized.malformed;
        report.malformed = normalized.malformed;

        let now = Utc::now();
        let window = self.deps.engine.freshness_window();
        let mut fresh: Vec<InboundEnvelope> = normalized
            .envelopes
            .into_iter()
            .filter(|envelope| envelope.is_fresh(now, window))
            .collect();
        // Stable: equal timestamps keep transport order.
        fresh.sort_by_key(|envelope| envelope.timestamp);
        report.fresh = fresh.len();

        for envelope in &fresh {
            if shutdown.is_cancelled() {
                tracing::info!("stop requested; leaving the rest of the batch");
                break;
            }
            let processed = AssertUnwindSafe(self.process_message(source.as_ref(), envelope))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(anyhow!(
                        "message processing panicked: {}",
                        crate::panic_payload_to_string(&*payload)
                    ))
                });
            match processed {
                Ok(disposition) => {
                    tracing::debug!(
                        message_id = %envelope.message_id,
                        disposition = ?disposition,
                        "message processed"
                    );
                    report.record(&disposition);
                }
                Err(error) => {
                    report.errors += 1;
                    tracing::warn!(
                        message_id = %envelope.message_id,
                        error = %format!("{error:#}"),
                        "message processing failed"
                    );
                }
            }
        }

        if report.fresh > 0 {
            tracing::info!(
                fetched = report.fetched,
                fresh = report.fresh,
                replied = report.replied,
                suppressed = report.suppressed,
                errors = report.errors,
                "poll complete"
            );
        }
        Ok(IterationOutcome::Polled(report))
    }

    /// Rebuilds only the clients whose settings changed. A failed build keeps
    /// the previous client in place.
    fn apply_settings(&mut self, settings: &BotSettings) -> anyhow::Result<()> {
        let transport_key = TransportKey::from(settings);
        if self.transport_key.as_ref() != Some(&transport_key) {
            let source = self
                .deps
                .factory
                .message_source(settings)
                .context("build transport client")?;
            tracing::info!(
                source = source.source_id(),
                configured = source.is_configured(),
                instance = %transport_key.instance,
                "transport client rebuilt from settings"
            );
            self.source = Some(source);
            self.transport_key = Some(transport_key);
        }

        if !settings.has_generation_key() {
            if self.generator.take().is_some() {
                tracing::warn!(
                    "generation api key removed; replies fall back to the configuration notice"
                );
            }
            self.generation_key = None;
            return Ok(());
        }
        let api_key = settings.generation_api_key.trim();
        if self.generator.is_some() && self.generation_key.as_deref() == Some(api_key) {
            return Ok(());
        }

        let backend = self
            .deps
            .factory
            .generation_backend(api_key)
            .context("build generation backend")?;
        if let Some(generator) = self.generator.as_mut() {
            generator.reconfigure(backend);
        } else {
            let generator = self.build_generator(backend)?;
            self.generator = Some(generator);
        }
        self.generation_key = Some(api_key.to_string());
        tracing::info!("generation client rebuilt from settings");
        Ok(())
    }

    fn build_generator(
        &self,
        backend: Arc<dyn GenerationBackend>,
    ) -> anyhow::Result<GenerationClient> {
        let generation = &self.deps.generation;
        let mut client = GenerationClient::new(
            backend,
            generation.models.clone(),
            Arc::clone(&self.deps.limiter),
        )?
        .with_system_instruction(Some(generation.system_prompt.clone()));
        if let Some(apology) = &generation.apology_reply {
            client = client.with_apology(apology);
        }
        Ok(client)
    }

    async fn process_message(
        &mut self,
        source: &dyn MessageSource,
        envelope: &InboundEnvelope,
    ) -> anyhow::Result<Disposition> {
        if envelope.from_me {
            return Ok(Disposition::SelfEcho);
        }
        if envelope.is_status_broadcast() {
            return Ok(Disposition::Ignored("status broadcast"));
        }
        if envelope.is_group() && !self.deps.engine.reply_to_groups {
            return Ok(Disposition::Ignored("group chat"));
        }
        if envelope.message_id.is_empty() {
            return Ok(Disposition::Ignored("missing message id"));
        }
        if self.deps.store.exists(&envelope.message_id).await? {
            return Ok(Disposition::Duplicate);
        }
        let Some(text) = envelope.text() else {
            return Ok(Disposition::Ignored("no text content"));
        };

        let conversation = envelope.conversation_id();
        let inserted = self
            .deps
            .store
            .append(
                &conversation,
                MessageRole::Inbound,
                text,
                Some(&envelope.message_id),
            )
            .await
            .context("persist inbound message")?;
        if !inserted {
            return Ok(Disposition::Duplicate);
        }

        let reply = match self.generator.as_mut() {
            None => {
                tracing::warn!(
                    conversation = %conversation,
                    "no generation api key configured; sending configuration notice"
                );
                self.deps.engine.config_error_reply.clone()
            }
            Some(generator) => {
                let history = load_history(
                    &self.deps.store,
                    &conversation,
                    &envelope.message_id,
                    self.deps.engine.history_limit,
                )
                .await?;
                match generator.generate(text, &history).await {
                    GenerationOutcome::Reply(reply) => reply,
                    GenerationOutcome::Failed { reason, apology } => {
                        tracing::warn!(
                            conversation = %conversation,
                            %reason,
                            "generation failed; sending apology"
                        );
                        apology
                    }
                    GenerationOutcome::Suppressed(reason) => {
                        tracing::info!(
                            conversation = %conversation,
                            %reason,
                            "reply suppressed"
                        );
                        return Ok(Disposition::Suppressed(reason));
                    }
                }
            }
        };

        match source.send(&conversation, &reply).await {
            SendReceipt::Delivered => {
                self.deps
                    .store
                    .append(&conversation, MessageRole::Outbound, &reply, None)
                    .await
                    .context("persist outbound reply")?;
                tracing::info!(
                    conversation = %conversation,
                    push_name = ?envelope.push_name,
                    "reply sent"
                );
                Ok(Disposition::Replied)
            }
            SendReceipt::Rejected { reason } => {
                tracing::warn!(conversation = %conversation, %reason, "reply not delivered");
                Ok(Disposition::SendFailed(reason))
            }
        }
    }
}

/// Prior turns of the conversation, excluding the message being answered.
async fn load_history(
    store: &ConversationStore,
    conversation: &ConversationId,
    current: &MessageId,
    limit: usize,
) -> anyhow::Result<Vec<HistoryTurn>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let stored = store
        .recent(conversation, limit + 1)
        .await
        .context("load conversation history")?;
    let mut turns: Vec<HistoryTurn> = stored
        .into_iter()
        .filter(|message| message.external_id.as_deref() != Some(current.as_str()))
        .map(|message| match message.role {
            MessageRole::Inbound => HistoryTurn::user(message.text),
            MessageRole::Outbound => HistoryTurn::model(message.text),
        })
        .collect();
    if turns.len() > limit {
        turns.drain(..turns.len() - limit);
    }
    Ok(turns)
}
