//! Persisted records shared by the queue and the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A per-(user, name) outbound queue.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct QueueRecord {
    pub id: i64,

    /// Owning user.
    pub user_id: String,

    /// Namespace, e.g. "email" or "open_questions".
    pub name: String,

    /// Reading minutes the user can absorb per window.
    pub attention_budget_minutes: u32,

    pub created_at: DateTime<Utc>,
}

/// A message waiting for (or past) delivery.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EnqueuedMessage {
    /// Unique ID (ULID)
    pub id: String,

    pub queue_id: i64,

    pub content: String,

    /// Recipient address
    pub recipient: String,

    pub subject: String,

    /// Estimated reading time in seconds, always positive.
    pub estimated_duration_secs: f64,

    pub created_at: DateTime<Utc>,

    /// Set once, by a successful delivery.
    pub sent_at: Option<DateTime<Utc>>,

    /// Thread the message belongs to. Known up front for replies,
    /// assigned by the sender otherwise.
    pub conversation_id: Option<String>,

    /// Registered handler name for replies in this conversation.
    pub response_handler: Option<String>,
}

impl EnqueuedMessage {
    pub fn is_pending(&self) -> bool {
        self.sent_at.is_none()
    }

    pub fn estimated_minutes(&self) -> f64 {
        self.estimated_duration_secs / 60.0
    }
}

/// Conversation to handler binding.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ListenerBinding {
    pub conversation_id: String,
    pub handler: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A reply fetched by the transport.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InboundItem {
    /// Transport-assigned message ID, unique.
    pub id: String,

    pub conversation_id: String,

    pub sender: String,

    #[serde(default)]
    pub recipient: String,

    #[serde(default)]
    pub subject: String,

    pub content: String,

    pub received_at: DateTime<Utc>,

    #[serde(default)]
    pub processed: bool,
}

impl InboundItem {
    pub fn new(
        id: &str,
        conversation_id: &str,
        sender: &str,
        content: &str,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender: sender.to_string(),
            recipient: String::new(),
            subject: String::new(),
            content: content.to_string(),
            received_at,
            processed: false,
        }
    }

    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = subject.to_string();
        self
    }

    pub fn with_recipient(mut self, recipient: &str) -> Self {
        self.recipient = recipient.to_string();
        self
    }
}
