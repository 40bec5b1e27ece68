use crate::rate_limit::DenyReason;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Sent to the end user when generation fails for a reason other than budget or auth.
pub const DEFAULT_APOLOGY_REPLY: &str =
    "Desculpe, estou com uma dificuldade técnica no momento. Por favor, tente novamente em instantes.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub text: String,
}

impl HistoryTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub system_instruction: Option<String>,
    /// Oldest first; the message being answered is the last `User` turn.
    pub turns: Vec<HistoryTurn>,
}

impl GenerationRequest {
    pub fn new(
        system_instruction: Option<&str>,
        history: &[HistoryTurn],
        user_text: &str,
    ) -> Self {
        let mut turns: Vec<HistoryTurn> = Vec::with_capacity(history.len() + 1);
        let incoming = history
            .iter()
            .cloned()
            .chain(std::iter::once(HistoryTurn::user(user_text)));
        for turn in incoming {
            let text = turn.text.trim();
            if text.is_empty() {
                continue;
            }
            // Consecutive turns from the same side are merged; the API expects alternation.
            match turns.last_mut() {
                Some(last) if last.role == turn.role => {
                    last.text.push('\n');
                    last.text.push_str(text);
                }
                _ => turns.push(HistoryTurn {
                    role: turn.role,
                    text: text.to_string(),
                }),
            }
        }
        while turns.first().is_some_and(|t| t.role == Role::Model) {
            turns.remove(0);
        }

        Self {
            system_instruction: system_instruction
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned),
            turns,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressReason {
    LocalBudget(DenyReason),
    RateLimited { retry_after: Duration },
    QuotaExhausted,
    Unauthorized,
    EmptyReply,
}

impl fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalBudget(reason) => write!(f, "local budget: {reason}"),
            Self::RateLimited { retry_after } => {
                write!(f, "provider rate limit, cooling down {}s", retry_after.as_secs())
            }
            Self::QuotaExhausted => f.write_str("every model in the fallback chain is out of quota"),
            Self::Unauthorized => f.write_str("generation api key rejected"),
            Self::EmptyReply => f.write_str("provider returned an empty reply"),
        }
    }
}

/// Result of one logical generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Reply(String),
    /// Nothing is sent to the end user.
    Suppressed(SuppressReason),
    /// The end user receives the apology text.
    Failed { reason: String, apology: String },
}

impl GenerationOutcome {
    pub fn reply_text(&self) -> Option<&str> {
        match self {
            Self::Reply(text) => Some(text),
            Self::Failed { apology, .. } => Some(apology),
            Self::Suppressed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_appends_user_text_and_merges_same_role_turns() {
        let history = vec![
            HistoryTurn::model("olá, em que posso ajudar?"),
            HistoryTurn::user("quero um orçamento"),
            HistoryTurn::user("de uma peça"),
            HistoryTurn::model("claro"),
            HistoryTurn::user("   "),
        ];

        let request = GenerationRequest::new(Some("  seja breve "), &history, "é urgente");

        assert_eq!(request.system_instruction.as_deref(), Some("seja breve"));
        assert_eq!(
            request.turns,
            vec![
                HistoryTurn::user("quero um orçamento\nde uma peça"),
                HistoryTurn::model("claro"),
                HistoryTurn::user("é urgente"),
            ]
        );
    }

    #[test]
    fn reply_text_only_for_reply_and_failure() {
        assert_eq!(
            GenerationOutcome::Reply("oi".to_string()).reply_text(),
            Some("oi")
        );
        let failed = GenerationOutcome::Failed {
            reason: "boom".to_string(),
            apology: DEFAULT_APOLOGY_REPLY.to_string(),
        };
        assert_eq!(failed.reply_text(), Some(DEFAULT_APOLOGY_REPLY));
        let suppressed = GenerationOutcome::Suppressed(SuppressReason::QuotaExhausted);
        assert!(suppressed.reply_text().is_none());
    }
}
