//! Delivery port and file-based transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::message::EnqueuedMessage;

pub mod incoming;
pub mod outgoing;

pub use incoming::{IncomingDir, IngestReport};
pub use outgoing::OutgoingDirSender;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport not available: {0}")]
    NotAvailable(String),

    #[error("Rejected by transport: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// A message handed to the sender.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OutboundEmail {
    /// Stable across retries; senders dedupe on it.
    pub message_id: String,
    pub recipient: String,
    pub subject: String,
    pub content: String,
    /// Thread to reply into, if any.
    pub parent_conversation_id: Option<String>,
}

impl From<&EnqueuedMessage> for OutboundEmail {
    fn from(message: &EnqueuedMessage) -> Self {
        Self {
            message_id: message.id.clone(),
            recipient: message.recipient.clone(),
            subject: message.subject.clone(),
            content: message.content.clone(),
            parent_conversation_id: message.conversation_id.clone(),
        }
    }
}

/// What the transport reports back after delivering.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SendReceipt {
    pub conversation_id: String,
}

/// Outbound delivery port.
///
/// Implementations must tolerate being called again with the same
/// `message_id` after a crash between delivery and bookkeeping.
#[async_trait]
pub trait Sender: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, TransportError>;
}
