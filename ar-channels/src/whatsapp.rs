use crate::envelope::FetchedBatch;
use crate::traits::MessageSource;
use crate::types::{ConnectionState, ConnectionStatus, ConversationId, SendReceipt};
use anyhow::{Result, anyhow};
use reqwest::Url;
use std::time::Duration;

const WHATSAPP_SOURCE_ID: &str = "whatsapp";

/// WhatsApp through an Evolution API gateway instance.
///
/// Every request carries the instance token in the `apikey` header. An adapter
/// built with an empty base URL, token or instance name stays unconfigured and
/// answers every operation locally.
#[derive(Clone)]
pub struct EvolutionAdapter {
    http: reqwest::Client,
    base_url: String,
    token: String,
    instance: String,
}

impl EvolutionAdapter {
    pub fn new(base_url: &str, token: &str, instance: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
            instance: instance.trim().to_string(),
        })
    }

    /// `{base}/{segments...}/{instance}` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| anyhow!("invalid evolution base url {:?}: {e}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("evolution base url cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments)
            .push(&self.instance);
        Ok(url)
    }
}

#[async_trait::async_trait]
impl MessageSource for EvolutionAdapter {
    fn source_id(&self) -> &str {
        WHATSAPP_SOURCE_ID
    }

    fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.token.is_empty() && !self.instance.is_empty()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(instance = %self.instance))]
    async fn check_connection(&self) -> ConnectionStatus {
        if !self.is_configured() {
            return ConnectionStatus::not_configured();
        }
        let url = match self.endpoint(&["instance", "connectionState"]) {
            Ok(url) => url,
            Err(error) => {
                return ConnectionStatus::new(ConnectionState::Unreachable, error.to_string());
            }
        };

        let response = match self.http.get(url).header("apikey", &self.token).send().await {
            Ok(response) => response,
            Err(error) => {
                return ConnectionStatus::new(
                    ConnectionState::Unreachable,
                    format!("evolution api unreachable: {error}"),
                );
            }
        };
        let status = response.status();
        let body = response.text().await.unwrap_or_else(|error| {
            format!("<failed to read evolution response body: {error}>")
        });
        if !status.is_success() {
            return ConnectionStatus::new(
                ConnectionState::Unreachable,
                format!("connection check failed: status={status} body={body}"),
            );
        }

        match parse_connection_state(&body) {
            Some(raw) => {
                let state = ConnectionState::from_transport(&raw);
                let detail = if state == ConnectionState::Open {
                    format!("instance {} connected", self.instance)
                } else {
                    format!("instance {} is in state {raw:?}", self.instance)
                };
                ConnectionStatus::new(state, detail)
            }
            None => ConnectionStatus::new(
                ConnectionState::Other("unknown".to_string()),
                format!("connection state missing from response: {body}"),
            ),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(instance = %self.instance, count = count))]
    async fn fetch_recent(&self, count: usize) -> Result<FetchedBatch> {
        if !self.is_configured() {
            return Err(anyhow!("evolution transport not configured"));
        }
        let url = self.endpoint(&["chat", "findMessages"])?;
        // v1 gateways read `limit`; v2 paginates with `page` + `offset`.
        let payload = serde_json::json!({
            "where": {},
            "limit": count,
            "page": 1,
            "offset": count,
        });

        let response = self
            .http
            .post(url)
            .header("apikey", &self.token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "evolution findMessages failed: status={status} body={body}"
            ));
        }

        let value: serde_json::Value = match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(error) => {
                return Ok(FetchedBatch::Unparseable(format!(
                    "findMessages body is not json: {error}"
                )));
            }
        };
        Ok(FetchedBatch::classify(value))
    }

    #[tracing::instrument(level = "info", skip_all, fields(instance = %self.instance))]
    async fn send(&self, conversation_id: &ConversationId, text: &str) -> SendReceipt {
        if !self.is_configured() {
            return SendReceipt::rejected("evolution transport not configured");
        }
        let number = conversation_id.trim();
        if number.is_empty() {
            return SendReceipt::rejected("destination number is required");
        }
        let text = text.trim();
        if text.is_empty() {
            return SendReceipt::rejected("message text is empty");
        }

        let url = match self.endpoint(&["message", "sendText"]) {
            Ok(url) => url,
            Err(error) => return SendReceipt::rejected(error.to_string()),
        };
        let payload = serde_json::json!({
            "number": number,
            "text": text,
        });

        let response = match self
            .http
            .post(url)
            .header("apikey", &self.token)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => return SendReceipt::rejected(format!("send request failed: {error}")),
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return SendReceipt::rejected(format!("send failed: status={status} body={body}"));
        }
        SendReceipt::Delivered
    }

    fn reconnect_hint(&self) -> Option<String> {
        if !self.is_configured() {
            return None;
        }
        self.endpoint(&["instance", "connect"])
            .ok()
            .map(|url| url.to_string())
    }
}

/// Reads `instance.state` (v2) or a top-level `state` (v1).
fn parse_connection_state(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("instance")
        .and_then(|instance| instance.get("state"))
        .or_else(|| value.get("state"))
        .and_then(|state| state.as_str())
        .map(ToOwned::to_owned)
}
