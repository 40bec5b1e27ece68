use crate::envelope::FetchedBatch;
use crate::types::{ConnectionStatus, ConversationId, SendReceipt};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Short transport identifier used in logs: "whatsapp".
    fn source_id(&self) -> &str;

    /// False when required credentials are missing; no operation touches the network then.
    fn is_configured(&self) -> bool;

    async fn check_connection(&self) -> ConnectionStatus;

    /// Most recent `count` messages in whatever shape the transport returned.
    async fn fetch_recent(&self, count: usize) -> Result<FetchedBatch>;

    /// Send failures are reported in the receipt, not as errors.
    async fn send(&self, conversation_id: &ConversationId, text: &str) -> SendReceipt;

    /// Where an operator can go to re-establish the session, if the transport has one.
    fn reconnect_hint(&self) -> Option<String> {
        None
    }
}
