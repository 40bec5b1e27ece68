//! Generation client for the auto-reply engine.
//!
//! Wraps a text-generation HTTP API behind a local call budget and an ordered
//! model fallback chain.

mod client;
mod error;
mod gemini;
mod rate_limit;
mod types;

pub use client::{GenerationBackend, GenerationClient, QUOTA_EXHAUSTED_COOLDOWN};
pub use error::{LlmError, Result};
pub use gemini::GeminiBackend;
pub use rate_limit::{
    Admission, DenyReason, MAX_COOLDOWN, MIN_COOLDOWN, RateLimiter, RateLimits, UsageStats,
};
pub use types::{
    DEFAULT_APOLOGY_REPLY, GenerationOutcome, GenerationRequest, HistoryTurn, Role,
    SuppressReason,
};
