//! Chat transport adapters for the auto-reply engine.
//!
//! Adapters are pure I/O: they check connectivity, fetch recent raw messages,
//! and send text. Raw payloads are classified and normalized once, here, into
//! [`InboundEnvelope`].

mod envelope;
mod traits;
mod types;
mod whatsapp;

pub use envelope::{FetchedBatch, InboundEnvelope, MessagePayload, NormalizedBatch};
pub use traits::MessageSource;
pub use types::{ConnectionState, ConnectionStatus, ConversationId, MessageId, SendReceipt};
pub use whatsapp::EvolutionAdapter;
