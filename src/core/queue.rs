//! Attention-gated outbound message queue.
//!
//! One queue per (user, name). Messages leave strictly in creation order;
//! the head waits until it fits the user's remaining attention budget.

use chrono::{DateTime, Utc};

use super::mailroom::Mailroom;
use super::message::{EnqueuedMessage, QueueRecord};
use crate::attention::{estimate_reading_secs, remaining_budget, Budget};
use crate::error::{Error, Result};
use crate::store::HeadClaim;
use crate::transport::OutboundEmail;

/// Optional parts of an enqueue request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    pub conversation_id: Option<String>,
    pub subject: Option<String>,
    pub estimated_duration_secs: Option<f64>,
    pub response_handler: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply into an existing conversation.
    pub fn in_conversation(mut self, conversation_id: &str) -> Self {
        self.conversation_id = Some(conversation_id.to_string());
        self
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn estimated_secs(mut self, secs: f64) -> Self {
        self.estimated_duration_secs = Some(secs);
        self
    }

    pub fn estimated_minutes(self, minutes: f64) -> Self {
        self.estimated_secs(minutes * 60.0)
    }

    /// Registered handler to bind the conversation to once sent.
    pub fn handler(mut self, name: &str) -> Self {
        self.response_handler = Some(name.to_string());
        self
    }
}

/// A queue bound to the services it needs.
#[derive(Clone)]
pub struct MessageQueue {
    record: QueueRecord,
    mailroom: Mailroom,
}

impl MessageQueue {
    pub(crate) fn new(record: QueueRecord, mailroom: Mailroom) -> Self {
        Self { record, mailroom }
    }

    pub fn record(&self) -> &QueueRecord {
        &self.record
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn user_id(&self) -> &str {
        &self.record.user_id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Validate and persist a new pending message.
    pub fn enqueue(
        &self,
        content: &str,
        recipient: &str,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<EnqueuedMessage> {
        let EnqueueOptions {
            conversation_id,
            subject,
            estimated_duration_secs,
            response_handler,
        } = options;

        if conversation_id.is_none() && subject.is_none() {
            return Err(Error::invalid(
                "either a conversation id or a subject must be provided",
            ));
        }
        if conversation_id.is_none() && response_handler.is_none() {
            return Err(Error::invalid(
                "either a conversation id or a response handler must be provided",
            ));
        }
        if content.trim().is_empty() {
            return Err(Error::invalid("message content must not be empty"));
        }
        if recipient.trim().is_empty() {
            return Err(Error::invalid("recipient must not be empty"));
        }
        if let Some(handler) = &response_handler {
            self.mailroom.handlers().check_reference(handler)?;
        }

        let estimated_duration_secs = match estimated_duration_secs {
            Some(secs) if secs.is_finite() && secs > 0.0 => secs,
            Some(secs) => {
                return Err(Error::invalid(format!(
                    "estimated duration must be a positive number of seconds, got {}",
                    secs
                )))
            }
            None => estimate_reading_secs(
                content,
                self.mailroom.settings().attention.words_per_minute,
            ),
        };

        let subject = match (subject, &conversation_id) {
            (Some(subject), _) => subject,
            (None, Some(conversation_id)) => self
                .mailroom
                .store()
                .latest_subject(conversation_id)?
                .ok_or_else(|| {
                    Error::invalid(format!(
                        "no subject given and none known for conversation '{}'",
                        conversation_id
                    ))
                })?,
            (None, None) => return Err(Error::invalid("a subject is required")),
        };

        let message = EnqueuedMessage {
            id: ulid::Ulid::new().to_string(),
            queue_id: self.record.id,
            content: content.to_string(),
            recipient: recipient.to_string(),
            subject,
            estimated_duration_secs,
            created_at: now,
            sent_at: None,
            conversation_id,
            response_handler,
        };
        self.mailroom.store().insert_message(&message)?;

        tracing::debug!(
            queue = %self.record.name,
            user = %self.record.user_id,
            message_id = %message.id,
            minutes = message.estimated_minutes(),
            "Enqueued message"
        );
        Ok(message)
    }

    /// Pending messages in the order they will be sent.
    pub fn pending(&self) -> Result<Vec<EnqueuedMessage>> {
        self.mailroom.store().pending_messages(self.record.id)
    }

    pub fn remaining_budget(&self, now: DateTime<Utc>) -> Result<Budget> {
        let policy = self.mailroom.policy();
        let sends = self
            .mailroom
            .store()
            .send_records(self.record.id, policy.window_start(now), now)?;
        Ok(remaining_budget(
            self.record.attention_budget_minutes as f64,
            &sends,
            now,
            &policy,
        ))
    }

    pub fn set_budget(&mut self, minutes: u32) -> Result<()> {
        self.mailroom.store().set_queue_budget(self.record.id, minutes)?;
        self.record.attention_budget_minutes = minutes;
        Ok(())
    }

    /// Deliver the oldest pending message if it fits the remaining budget.
    ///
    /// `Ok(None)` is normal backpressure: empty queue, head over budget, or
    /// head already being delivered by an overlapping tick. A failed delivery
    /// leaves the message pending and returns `DeliveryFailed`. A delivery
    /// that outlived its claim returns `ClaimLost`.
    ///
    /// `now` drives the budget and `sent_at`. The claim lease always runs on
    /// the wall clock.
    pub async fn try_send_next(&self, now: DateTime<Utc>) -> Result<Option<EnqueuedMessage>> {
        let policy = self.mailroom.policy();
        let full = self.record.attention_budget_minutes as f64;
        let (budget, claim) = self.mailroom.store().claim_head(
            self.record.id,
            now,
            policy.window_start(now),
            Utc::now(),
            self.mailroom.claim_lease(),
            |sends| remaining_budget(full, sends, now, &policy),
        )?;

        match claim {
            HeadClaim::Empty => Ok(None),
            HeadClaim::InFlight(id) => {
                tracing::debug!(queue = %self.record.name, message_id = %id, "Head message in flight");
                Ok(None)
            }
            HeadClaim::OverBudget(message) => {
                tracing::debug!(
                    queue = %self.record.name,
                    message_id = %message.id,
                    needed = message.estimated_minutes(),
                    remaining = budget.remaining_minutes,
                    "Not enough attention left, holding"
                );
                Ok(None)
            }
            HeadClaim::Claimed { message, token } => {
                self.deliver(message, &token, budget, now).await
            }
        }
    }

    async fn deliver(
        &self,
        mut message: EnqueuedMessage,
        token: &str,
        budget: Budget,
        now: DateTime<Utc>,
    ) -> Result<Option<EnqueuedMessage>> {
        let store = self.mailroom.store();
        let sender = self.mailroom.sender();
        let email = OutboundEmail::from(&message);
        let timeout = self.mailroom.delivery_timeout();

        let receipt = match tokio::time::timeout(timeout, sender.send(&email)).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => {
                self.release(&message.id, token);
                return Err(Error::delivery(&message.id, e.to_string()));
            }
            Err(_) => {
                self.release(&message.id, token);
                return Err(Error::delivery(
                    &message.id,
                    format!("{} timed out after {:?}", sender.name(), timeout),
                ));
            }
        };

        let conversation_id = message
            .conversation_id
            .clone()
            .unwrap_or(receipt.conversation_id);
        let completed = store.complete_delivery(
            &message.id,
            token,
            now,
            &conversation_id,
            message.response_handler.as_deref(),
        )?;
        if !completed {
            return Err(Error::ClaimLost {
                message_id: message.id,
            });
        }

        message.sent_at = Some(now);
        message.conversation_id = Some(conversation_id);
        tracing::info!(
            queue = %self.record.name,
            user = %self.record.user_id,
            message_id = %message.id,
            conversation_id = message.conversation_id.as_deref().unwrap_or_default(),
            handler = message.response_handler.as_deref().unwrap_or("-"),
            minutes = message.estimated_minutes(),
            remaining_before = budget.remaining_minutes,
            "Sent message"
        );
        Ok(Some(message))
    }

    fn release(&self, message_id: &str, token: &str) {
        if let Err(e) = self.mailroom.store().release_claim(message_id, token) {
            tracing::warn!(
                message_id,
                "Failed to release claim, it will lapse with its lease: {}",
                e
            );
        }
    }
}
