use crate::types::{ConversationId, MessageId};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::time::Duration;

const WHATSAPP_GROUP_SUFFIX: &str = "@g.us";
const WHATSAPP_STATUS_JID: &str = "status@broadcast";

/// A fetch response, classified once by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchedBatch {
    /// `[{...}, {...}]`
    Flat(Vec<serde_json::Value>),
    /// `{"messages": {"total": .., "pages": .., "currentPage": .., "records": [...]}}`
    Paginated {
        records: Vec<serde_json::Value>,
        total: Option<u64>,
        current_page: Option<u64>,
    },
    Unparseable(String),
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub envelopes: Vec<InboundEnvelope>,
    /// Items in a recognized list that did not decode as a message.
    pub malformed: usize,
}

impl FetchedBatch {
    pub fn classify(body: serde_json::Value) -> Self {
        match body {
            serde_json::Value::Array(items) => Self::Flat(items),
            serde_json::Value::Object(mut obj) => {
                let nested = obj.remove("messages");
                match nested {
                    Some(serde_json::Value::Object(mut page)) => {
                        match page.remove("records") {
                            Some(serde_json::Value::Array(records)) => Self::Paginated {
                                records,
                                total: page.get("total").and_then(|v| v.as_u64()),
                                current_page: page.get("currentPage").and_then(|v| v.as_u64()),
                            },
                            _ => Self::Unparseable("messages object has no records list".to_string()),
                        }
                    }
                    Some(serde_json::Value::Array(records)) => Self::Paginated {
                        records,
                        total: None,
                        current_page: None,
                    },
                    Some(other) => Self::Unparseable(format!(
                        "messages field is neither list nor page: {}",
                        json_kind(&other)
                    )),
                    None => match obj.remove("records") {
                        Some(serde_json::Value::Array(records)) => Self::Paginated {
                            records,
                            total: obj.get("total").and_then(|v| v.as_u64()),
                            current_page: obj.get("currentPage").and_then(|v| v.as_u64()),
                        },
                        _ => Self::Unparseable("object without messages or records".to_string()),
                    },
                }
            }
            other => Self::Unparseable(format!("unexpected top-level {}", json_kind(&other))),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Flat(items) => items.len(),
            Self::Paginated { records, .. } => records.len(),
            Self::Unparseable(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn normalize(self) -> NormalizedBatch {
        let items = match self {
            Self::Flat(items) => items,
            Self::Paginated { records, .. } => records,
            Self::Unparseable(reason) => {
                tracing::warn!(%reason, "fetched payload has no recognizable message list");
                return NormalizedBatch::default();
            }
        };

        let mut out = NormalizedBatch::default();
        for item in items {
            match InboundEnvelope::from_value(item) {
                Ok(envelope) => out.envelopes.push(envelope),
                Err(error) => {
                    out.malformed += 1;
                    tracing::debug!(%error, "skipping malformed message envelope");
                }
            }
        }
        out
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Canonical inbound message, independent of the fetch shape it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub message_id: MessageId,
    pub remote_jid: String,
    pub from_me: bool,
    pub timestamp: Option<DateTime<Utc>>,
    pub push_name: Option<String>,
    pub payload: MessagePayload,
}

/// The known text-bearing fields of a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagePayload {
    pub conversation: Option<String>,
    pub extended_text_message: Option<TextBody>,
    pub image_message: Option<CaptionBody>,
    pub video_message: Option<CaptionBody>,
    pub document_message: Option<CaptionBody>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TextBody {
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CaptionBody {
    pub caption: Option<String>,
}

impl MessagePayload {
    /// First non-blank text among the known fields.
    pub fn text(&self) -> Option<&str> {
        [
            self.conversation.as_deref(),
            self.extended_text_message
                .as_ref()
                .and_then(|m| m.text.as_deref()),
            self.image_message.as_ref().and_then(|m| m.caption.as_deref()),
            self.video_message.as_ref().and_then(|m| m.caption.as_deref()),
            self.document_message
                .as_ref()
                .and_then(|m| m.caption.as_deref()),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|text| !text.is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    key: RawKey,
    #[serde(default)]
    message: Option<MessagePayload>,
    #[serde(default)]
    message_timestamp: Option<serde_json::Value>,
    #[serde(default)]
    push_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawKey {
    id: String,
    remote_jid: String,
    #[serde(default)]
    from_me: bool,
}

impl InboundEnvelope {
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        let raw: RawEnvelope = serde_json::from_value(value)?;
        Ok(Self {
            message_id: MessageId::new(raw.key.id.trim()),
            remote_jid: raw.key.remote_jid.trim().to_string(),
            from_me: raw.key.from_me,
            timestamp: raw.message_timestamp.as_ref().and_then(parse_timestamp),
            push_name: raw.push_name.filter(|n| !n.trim().is_empty()),
            payload: raw.message.unwrap_or_default(),
        })
    }

    /// `551199999999@s.whatsapp.net` -> `551199999999`. Device suffixes (`:12`) are dropped.
    pub fn conversation_id(&self) -> ConversationId {
        let user = self
            .remote_jid
            .split_once('@')
            .map(|(user, _)| user)
            .unwrap_or(&self.remote_jid);
        let user = user.split_once(':').map(|(u, _)| u).unwrap_or(user);
        ConversationId::new(user)
    }

    pub fn is_group(&self) -> bool {
        self.remote_jid.ends_with(WHATSAPP_GROUP_SUFFIX)
    }

    pub fn is_status_broadcast(&self) -> bool {
        self.remote_jid == WHATSAPP_STATUS_JID
    }

    pub fn text(&self) -> Option<&str> {
        self.payload.text()
    }

    /// Age strictly below `window`. Messages without a timestamp are never fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let Some(timestamp) = self.timestamp else {
            return false;
        };
        let Ok(window) = chrono::Duration::from_std(window) else {
            return true;
        };
        now.signed_duration_since(timestamp) < window
    }
}

/// Seconds or milliseconds since the epoch, as a number or a numeric string.
fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let raw = match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok()?,
        serde_json::Value::Object(obj) => obj.get("low").and_then(|v| v.as_i64())?,
        _ => return None,
    };
    if raw <= 0 {
        return None;
    }
    if raw > 100_000_000_000 {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}
