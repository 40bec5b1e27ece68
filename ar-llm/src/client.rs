use crate::error::{LlmError, Result};
use crate::rate_limit::{Admission, RateLimiter};
use crate::types::{
    DEFAULT_APOLOGY_REPLY, GenerationOutcome, GenerationRequest, HistoryTurn, SuppressReason,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Applied when every model in the chain reports zero allowance.
pub const QUOTA_EXHAUSTED_COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// One remote generation call against a specific model.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, model: &str, request: &GenerationRequest) -> Result<String>;
}

/// Budgeted generation with an ordered model fallback chain.
///
/// Owned by a single worker: the fallback cursor is plain state behind `&mut self`.
pub struct GenerationClient {
    backend: Arc<dyn GenerationBackend>,
    models: Vec<String>,
    cursor: usize,
    limiter: Arc<RateLimiter>,
    system_instruction: Option<String>,
    apology: String,
}

impl GenerationClient {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        models: Vec<String>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let models: Vec<String> = models
            .into_iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if models.is_empty() {
            return Err(LlmError::InvalidInput(
                "model fallback chain is empty".to_string(),
            ));
        }
        Ok(Self {
            backend,
            models,
            cursor: 0,
            limiter,
            system_instruction: None,
            apology: DEFAULT_APOLOGY_REPLY.to_string(),
        })
    }

    pub fn with_system_instruction(mut self, system_instruction: Option<String>) -> Self {
        self.system_instruction = system_instruction.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_apology(mut self, apology: &str) -> Self {
        if !apology.trim().is_empty() {
            self.apology = apology.trim().to_string();
        }
        self
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current_model(&self) -> &str {
        &self.models[self.cursor]
    }

    /// Swaps the backend (new API key) and restarts the fallback chain.
    pub fn reconfigure(&mut self, backend: Arc<dyn GenerationBackend>) {
        self.backend = backend;
        self.cursor = 0;
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn generate(&mut self, user_text: &str, history: &[HistoryTurn]) -> GenerationOutcome {
        if let Admission::Denied(reason) = self.limiter.can_call() {
            tracing::info!(%reason, "generation skipped by local budget");
            return GenerationOutcome::Suppressed(SuppressReason::LocalBudget(reason));
        }

        let request =
            GenerationRequest::new(self.system_instruction.as_deref(), history, user_text);

        loop {
            let model = self.models[self.cursor].clone();
            match self.backend.generate(&model, &request).await {
                Ok(text) => {
                    self.limiter.register_call();
                    let text = text.trim();
                    if text.is_empty() {
                        return GenerationOutcome::Suppressed(SuppressReason::EmptyReply);
                    }
                    tracing::debug!(model = %model, chars = text.len(), "generation succeeded");
                    return GenerationOutcome::Reply(text.to_string());
                }
                Err(LlmError::QuotaExhausted { message, .. }) => {
                    if self.cursor + 1 < self.models.len() {
                        self.cursor += 1;
                        tracing::warn!(
                            exhausted = %model,
                            next = %self.models[self.cursor],
                            %message,
                            "model has no quota; falling back"
                        );
                        continue;
                    }
                    tracing::error!(
                        last = %model,
                        chain = ?self.models,
                        "every model in the fallback chain has no quota"
                    );
                    self.limiter.set_cooldown(QUOTA_EXHAUSTED_COOLDOWN);
                    self.cursor = 0;
                    return GenerationOutcome::Suppressed(SuppressReason::QuotaExhausted);
                }
                Err(LlmError::RateLimited {
                    retry_after,
                    message,
                }) => {
                    let applied = self.limiter.set_cooldown_from_hint(retry_after);
                    tracing::warn!(
                        model = %model,
                        hint = ?retry_after,
                        cooldown_seconds = applied.as_secs(),
                        %message,
                        "provider rate limit"
                    );
                    return GenerationOutcome::Suppressed(SuppressReason::RateLimited {
                        retry_after: applied,
                    });
                }
                Err(LlmError::Unauthorized(message)) => {
                    tracing::error!(
                        model = %model,
                        %message,
                        "generation api key rejected; update the key in bot settings"
                    );
                    return GenerationOutcome::Suppressed(SuppressReason::Unauthorized);
                }
                Err(error) => {
                    tracing::error!(model = %model, %error, "generation failed");
                    return GenerationOutcome::Failed {
                        reason: error.to_string(),
                        apology: self.apology.clone(),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{DenyReason, MAX_COOLDOWN, RateLimits};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedBackend {
        responses: Mutex<VecDeque<Result<String>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn generate(&self, model: &str, _request: &GenerationRequest) -> Result<String> {
            self.calls.lock().expect("calls lock").push(model.to_string());
            self.responses
                .lock()
                .expect("responses lock")
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Http("no scripted response".to_string())))
        }
    }

    fn quota(model: &str) -> Result<String> {
        Err(LlmError::QuotaExhausted {
            model: model.to_string(),
            message: "limit: 0".to_string(),
        })
    }

    fn models() -> Vec<String> {
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    }

    fn limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimits::default()))
    }

    #[tokio::test]
    async fn falls_back_through_zero_allowance_models() {
        let backend = ScriptedBackend::new(vec![quota("a"), quota("b"), Ok("  Olá!  ".to_string())]);
        let limiter = limiter();
        let mut client =
            GenerationClient::new(backend.clone(), models(), limiter.clone()).expect("client");

        let outcome = client.generate("oi", &[]).await;

        assert_eq!(outcome, GenerationOutcome::Reply("Olá!".to_string()));
        assert_eq!(client.cursor(), 2);
        assert_eq!(backend.calls(), vec!["a", "b", "c"]);
        assert_eq!(limiter.usage_stats().calls_today, 1);
    }

    #[tokio::test]
    async fn exhausted_chain_sets_long_cooldown_and_resets_cursor() {
        let backend = ScriptedBackend::new(vec![quota("a"), quota("b"), quota("c")]);
        let limiter = limiter();
        let mut client =
            GenerationClient::new(backend.clone(), models(), limiter.clone()).expect("client");

        let outcome = client.generate("oi", &[]).await;

        assert_eq!(
            outcome,
            GenerationOutcome::Suppressed(SuppressReason::QuotaExhausted)
        );
        assert_eq!(backend.calls().len(), 3);
        assert_eq!(client.cursor(), 0);
        let remaining = limiter
            .usage_stats()
            .cooldown_remaining_seconds
            .expect("cooldown set");
        assert!(remaining > 3500);

        // Next request is refused locally without touching the backend.
        let outcome = client.generate("oi de novo", &[]).await;
        assert!(matches!(
            outcome,
            GenerationOutcome::Suppressed(SuppressReason::LocalBudget(DenyReason::Cooldown { .. }))
        ));
        assert_eq!(backend.calls().len(), 3);
    }

    #[tokio::test]
    async fn rate_limit_sets_floored_cooldown_without_reply() {
        let backend = ScriptedBackend::new(vec![Err(LlmError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
            message: "slow down".to_string(),
        })]);
        let limiter = limiter();
        let mut client =
            GenerationClient::new(backend.clone(), models(), limiter.clone()).expect("client");

        let outcome = client.generate("oi", &[]).await;

        assert_eq!(
            outcome,
            GenerationOutcome::Suppressed(SuppressReason::RateLimited {
                retry_after: Duration::from_secs(60)
            })
        );
        assert!(outcome.reply_text().is_none());
        assert!(!limiter.can_call().is_allowed());
        assert_eq!(client.cursor(), 0);
    }

    #[tokio::test]
    async fn oversized_retry_hint_is_capped_at_one_day() {
        let backend = ScriptedBackend::new(vec![Err(LlmError::RateLimited {
            retry_after: Some(Duration::MAX),
            message: "retry much later".to_string(),
        })]);
        let limiter = limiter();
        let mut client =
            GenerationClient::new(backend, models(), limiter.clone()).expect("client");

        let outcome = client.generate("oi", &[]).await;

        assert_eq!(
            outcome,
            GenerationOutcome::Suppressed(SuppressReason::RateLimited {
                retry_after: MAX_COOLDOWN
            })
        );
        let remaining = limiter
            .usage_stats()
            .cooldown_remaining_seconds
            .expect("cooldown set");
        assert!(remaining <= MAX_COOLDOWN.as_secs());
        assert!(remaining > MAX_COOLDOWN.as_secs() - 60);
    }

    #[tokio::test]
    async fn unauthorized_is_suppressed_and_other_errors_apologize() {
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::Unauthorized("bad key".to_string())),
            Err(LlmError::Http("connection reset".to_string())),
        ]);
        let mut client = GenerationClient::new(backend, models(), limiter())
            .expect("client")
            .with_apology("Desculpe!");

        let outcome = client.generate("oi", &[]).await;
        assert_eq!(
            outcome,
            GenerationOutcome::Suppressed(SuppressReason::Unauthorized)
        );

        let outcome = client.generate("oi", &[]).await;
        assert_eq!(outcome.reply_text(), Some("Desculpe!"));
        assert!(matches!(outcome, GenerationOutcome::Failed { ref reason, .. } if reason.contains("connection reset")));
    }

    #[tokio::test]
    async fn local_denial_makes_no_remote_call() {
        let backend = ScriptedBackend::new(vec![Ok("x".to_string())]);
        let limiter = Arc::new(RateLimiter::new(RateLimits {
            max_calls_per_minute: 1,
            max_calls_per_day: 10,
        }));
        limiter.register_call();
        let mut client =
            GenerationClient::new(backend.clone(), models(), limiter).expect("client");

        let outcome = client.generate("oi", &[]).await;

        assert!(matches!(
            outcome,
            GenerationOutcome::Suppressed(SuppressReason::LocalBudget(DenyReason::MinuteLimit { .. }))
        ));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn reconfigure_resets_cursor() {
        let backend = ScriptedBackend::new(vec![quota("a"), Ok("ok".to_string())]);
        let mut client = GenerationClient::new(backend, models(), limiter()).expect("client");
        let _ = client.generate("oi", &[]).await;
        assert_eq!(client.cursor(), 1);

        client.reconfigure(ScriptedBackend::new(vec![Ok("novo".to_string())]));
        assert_eq!(client.cursor(), 0);
        assert_eq!(client.current_model(), "a");
    }

    #[tokio::test]
    async fn empty_completion_is_suppressed() {
        let backend = ScriptedBackend::new(vec![Ok("   ".to_string())]);
        let mut client = GenerationClient::new(backend, models(), limiter()).expect("client");
        assert_eq!(
            client.generate("oi", &[]).await,
            GenerationOutcome::Suppressed(SuppressReason::EmptyReply)
        );
    }

    #[test]
    fn empty_model_chain_is_rejected() {
        let backend = ScriptedBackend::new(vec![]);
        assert!(GenerationClient::new(backend, vec![" ".to_string()], limiter()).is_err());
    }
}
