use crate::client::GenerationBackend;
use crate::error::{LlmError, Result};
use crate::types::{GenerationRequest, Role};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_MAX_OUTPUT_TOKENS: u32 = 512;
const GEMINI_TEMPERATURE: f32 = 0.7;

/// `generateContent` client for Google's Gemini API.
#[derive(Clone)]
pub struct GeminiBackend {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl GeminiBackend {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(LlmError::InvalidInput(
                "generation api key is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            api_base: GEMINI_API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        let trimmed = api_base.trim().trim_end_matches('/');
        if !trimmed.is_empty() {
            self.api_base = trimmed.to_string();
        }
        self
    }

    fn generate_url(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.api_base, model)
    }
}

#[async_trait::async_trait]
impl GenerationBackend for GeminiBackend {
    #[tracing::instrument(level = "info", skip_all, fields(model = %model))]
    async fn generate(&self, model: &str, request: &GenerationRequest) -> Result<String> {
        if request.turns.is_empty() {
            return Err(LlmError::InvalidInput(
                "generation request has no content".to_string(),
            ));
        }
        let body = GeminiRequest::from(request);

        let response = self
            .http
            .post(self.generate_url(model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(classify_error(model, status, &headers, &text));
        }

        let parsed: GeminiResponse = serde_json::from_str(&text)?;
        parsed.into_text()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

impl From<&GenerationRequest> for GeminiRequest {
    fn from(request: &GenerationRequest) -> Self {
        let text_content = |role: Option<&str>, text: &str| GeminiContent {
            role: role.map(ToOwned::to_owned),
            parts: vec![GeminiPart {
                text: Some(text.to_string()),
            }],
        };
        Self {
            system_instruction: request
                .system_instruction
                .as_deref()
                .map(|text| text_content(None, text)),
            contents: request
                .turns
                .iter()
                .map(|turn| {
                    let role = match turn.role {
                        Role::User => "user",
                        Role::Model => "model",
                    };
                    text_content(Some(role), &turn.text)
                })
                .collect(),
            generation_config: GeminiGenerationConfig {
                temperature: GEMINI_TEMPERATURE,
                max_output_tokens: GEMINI_MAX_OUTPUT_TOKENS,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

impl GeminiResponse {
    fn into_text(self) -> Result<String> {
        let Some(candidate) = self.candidates.into_iter().next() else {
            return Err(LlmError::ResponseFormat(format!(
                "gemini returned no candidates (prompt_feedback={:?})",
                self.prompt_feedback
            )));
        };
        let text: String = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.trim().is_empty() {
            tracing::warn!(
                finish_reason = ?candidate.finish_reason,
                "gemini candidate carried no text"
            );
        }
        Ok(text)
    }
}

#[derive(Debug, Default, Deserialize)]
struct GeminiErrorEnvelope {
    #[serde(default)]
    error: GeminiErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct GeminiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    details: Vec<serde_json::Value>,
}

fn classify_error(model: &str, status: StatusCode, headers: &HeaderMap, body: &str) -> LlmError {
    let parsed: GeminiErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    let error = parsed.error;
    let message = if error.message.is_empty() {
        body.chars().take(500).collect()
    } else {
        error.message.clone()
    };

    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || has_error_reason(&error.details, "API_KEY_INVALID")
        || message.contains("API key not valid")
    {
        return LlmError::Unauthorized(format!("status={status} message={message}"));
    }

    if status == StatusCode::TOO_MANY_REQUESTS || error.status == "RESOURCE_EXHAUSTED" {
        if is_zero_allowance(&message, &error.details) {
            return LlmError::QuotaExhausted {
                model: model.to_string(),
                message,
            };
        }
        let retry_after = retry_delay_from_details(&error.details)
            .or_else(|| retry_after_header(headers))
            .or_else(|| retry_delay_from_message(&message));
        return LlmError::RateLimited {
            retry_after,
            message,
        };
    }

    LlmError::Http(format!("gemini status={status} body={body}"))
}

fn has_error_reason(details: &[serde_json::Value], reason: &str) -> bool {
    details
        .iter()
        .any(|d| d.get("reason").and_then(|v| v.as_str()) == Some(reason))
}

fn is_zero_allowance(message: &str, details: &[serde_json::Value]) -> bool {
    let compact: String = message.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.contains("limit:0") {
        return true;
    }
    details.iter().any(|detail| {
        detail
            .get("violations")
            .and_then(|v| v.as_array())
            .is_some_and(|violations| {
                violations.iter().any(|violation| {
                    match violation.get("quotaValue") {
                        Some(serde_json::Value::String(s)) => s.trim() == "0",
                        Some(serde_json::Value::Number(n)) => n.as_u64() == Some(0),
                        _ => false,
                    }
                })
            })
    })
}

fn retry_delay_from_details(details: &[serde_json::Value]) -> Option<Duration> {
    details
        .iter()
        .filter_map(|d| d.get("retryDelay").and_then(|v| v.as_str()))
        .find_map(parse_seconds)
}

fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_seconds)
}

fn retry_delay_from_message(message: &str) -> Option<Duration> {
    let lower = message.to_ascii_lowercase();
    let idx = lower.find("retry in ")?;
    let rest = &lower[idx + "retry in ".len()..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == 's' || c == 'm'))
        .unwrap_or(rest.len());
    parse_seconds(&rest[..end])
}

/// Parses `"37s"`, `"12.5s"`, `"150ms"` or a bare number of seconds.
/// Values too large for a `Duration` saturate.
fn parse_seconds(raw: &str) -> Option<Duration> {
    let raw = raw.trim().trim_end_matches('.');
    let (value, scale) = match raw.strip_suffix("ms") {
        Some(ms) => (ms, 1000.0),
        None => (raw.strip_suffix('s').unwrap_or(raw), 1.0),
    };
    let seconds = value.trim().parse::<f64>().ok()? / scale;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX))
}
