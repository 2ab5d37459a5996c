//! Queue and outbound message persistence.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use super::{from_millis, new_claim_token, to_millis, Store};
use crate::attention::{Budget, SendRecord};
use crate::core::message::{EnqueuedMessage, QueueRecord};
use crate::error::Result;

const MESSAGE_COLUMNS: &str = "id, queue_id, content, recipient, subject, estimated_duration_secs, \
     created_at, sent_at, conversation_id, response_handler";

fn queue_from_row(row: &Row<'_>) -> rusqlite::Result<QueueRecord> {
    Ok(QueueRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        attention_budget_minutes: row.get(3)?,
        created_at: from_millis(row.get(4)?)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<EnqueuedMessage> {
    let sent_at: Option<i64> = row.get(7)?;
    Ok(EnqueuedMessage {
        id: row.get(0)?,
        queue_id: row.get(1)?,
        content: row.get(2)?,
        recipient: row.get(3)?,
        subject: row.get(4)?,
        estimated_duration_secs: row.get(5)?,
        created_at: from_millis(row.get(6)?)?,
        sent_at: sent_at.map(from_millis).transpose()?,
        conversation_id: row.get(8)?,
        response_handler: row.get(9)?,
    })
}

/// Result of trying to claim the head of a queue for delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum HeadClaim {
    /// Nothing pending.
    Empty,
    /// The head is being delivered by another tick.
    InFlight(String),
    /// The head does not fit the remaining budget.
    OverBudget(EnqueuedMessage),
    /// The head is ours to deliver until the lease runs out.
    Claimed {
        message: EnqueuedMessage,
        token: String,
    },
}

impl Store {
    /// Fetch the queue for (user, name), creating it on first use.
    pub fn get_or_create_queue(
        &self,
        user_id: &str,
        name: &str,
        budget_minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<QueueRecord> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO message_queues (user_id, name, attention_budget_minutes, created_at) \
                 VALUES (?1, ?2, ?3, ?4) ON CONFLICT (user_id, name) DO NOTHING",
                params![user_id, name, budget_minutes, to_millis(now)],
            )?;
            let queue = conn.query_row(
                "SELECT id, user_id, name, attention_budget_minutes, created_at \
                 FROM message_queues WHERE user_id = ?1 AND name = ?2",
                params![user_id, name],
                queue_from_row,
            )?;
            Ok(queue)
        })
    }

    pub fn queue(&self, queue_id: i64) -> Result<Option<QueueRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, user_id, name, attention_budget_minutes, created_at \
                     FROM message_queues WHERE id = ?1",
                    params![queue_id],
                    queue_from_row,
                )
                .optional()?)
        })
    }

    /// Queues owned by `user_id`, or every queue when `None`.
    pub fn list_queues(&self, user_id: Option<&str>) -> Result<Vec<QueueRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, name, attention_budget_minutes, created_at \
                 FROM message_queues WHERE ?1 IS NULL OR user_id = ?1 ORDER BY id",
            )?;
            let queues = stmt
                .query_map(params![user_id], queue_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(queues)
        })
    }

    /// Queue holding the most recent message of a conversation.
    pub fn queue_for_conversation(&self, conversation_id: &str) -> Result<Option<QueueRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT q.id, q.user_id, q.name, q.attention_budget_minutes, q.created_at \
                     FROM message_queues q JOIN enqueued_messages m ON m.queue_id = q.id \
                     WHERE m.conversation_id = ?1 \
                     ORDER BY m.sent_at IS NULL, m.sent_at DESC, m.created_at DESC LIMIT 1",
                    params![conversation_id],
                    queue_from_row,
                )
                .optional()?)
        })
    }

    pub fn set_queue_budget(&self, queue_id: i64, budget_minutes: u32) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE message_queues SET attention_budget_minutes = ?1 WHERE id = ?2",
                params![budget_minutes, queue_id],
            )?;
            Ok(())
        })
    }

    pub fn insert_message(&self, message: &EnqueuedMessage) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO enqueued_messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    MESSAGE_COLUMNS
                ),
                params![
                    message.id,
                    message.queue_id,
                    message.content,
                    message.recipient,
                    message.subject,
                    message.estimated_duration_secs,
                    to_millis(message.created_at),
                    message.sent_at.map(to_millis),
                    message.conversation_id,
                    message.response_handler,
                ],
            )?;
            Ok(())
        })
    }

    pub fn message(&self, id: &str) -> Result<Option<EnqueuedMessage>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM enqueued_messages WHERE id = ?1", MESSAGE_COLUMNS),
                    params![id],
                    message_from_row,
                )
                .optional()?)
        })
    }

    /// Pending messages in delivery order.
    pub fn pending_messages(&self, queue_id: i64) -> Result<Vec<EnqueuedMessage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM enqueued_messages WHERE queue_id = ?1 AND sent_at IS NULL \
                 ORDER BY created_at, rowid",
                MESSAGE_COLUMNS
            ))?;
            let messages = stmt
                .query_map(params![queue_id], message_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(messages)
        })
    }

    /// Sends of a queue with `since <= sent_at <= until`.
    pub fn send_records(
        &self,
        queue_id: i64,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<SendRecord>> {
        self.with_conn(|conn| Ok(query_send_records(conn, queue_id, since, until)?))
    }

    /// Subject of the most recent message in a conversation, inbound first.
    pub fn latest_subject(&self, conversation_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let inbound: Option<String> = conn
                .query_row(
                    "SELECT subject FROM inbound_items WHERE conversation_id = ?1 AND subject != '' \
                     ORDER BY received_at DESC, rowid DESC LIMIT 1",
                    params![conversation_id],
                    |row| row.get(0),
                )
                .optional()?;
            if inbound.is_some() {
                return Ok(inbound);
            }
            Ok(conn
                .query_row(
                    "SELECT subject FROM enqueued_messages WHERE conversation_id = ?1 \
                     AND sent_at IS NOT NULL ORDER BY sent_at DESC LIMIT 1",
                    params![conversation_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Atomically evaluate the budget and claim the oldest pending message.
    ///
    /// The budget is computed from the send history read inside the same
    /// immediate transaction, so a concurrent completion cannot make it stale.
    /// Only the head is considered: a head that does not fit blocks the queue.
    ///
    /// `now` is the tick's time and bounds the send history. The lease runs
    /// from `claimed_at`, the wall clock when the claim is taken.
    pub fn claim_head<F>(
        &self,
        queue_id: i64,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        claimed_at: DateTime<Utc>,
        lease: Duration,
        budget_of: F,
    ) -> Result<(Budget, HeadClaim)>
    where
        F: FnOnce(&[SendRecord]) -> Budget,
    {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let sends = query_send_records(&tx, queue_id, window_start, now)?;
            let budget = budget_of(&sends);

            let head = tx
                .query_row(
                    &format!(
                        "SELECT {}, claimed_until FROM enqueued_messages \
                         WHERE queue_id = ?1 AND sent_at IS NULL ORDER BY created_at, rowid LIMIT 1",
                        MESSAGE_COLUMNS
                    ),
                    params![queue_id],
                    |row| Ok((message_from_row(row)?, row.get::<_, Option<i64>>(10)?)),
                )
                .optional()?;

            let claim = match head {
                None => HeadClaim::Empty,
                Some((message, Some(until))) if until > to_millis(claimed_at) => {
                    HeadClaim::InFlight(message.id)
                }
                Some((message, _)) if !budget.admits(message.estimated_duration_secs) => {
                    HeadClaim::OverBudget(message)
                }
                Some((message, _)) => {
                    let token = new_claim_token();
                    tx.execute(
                        "UPDATE enqueued_messages SET claim_token = ?1, claimed_until = ?2 \
                         WHERE id = ?3 AND sent_at IS NULL",
                        params![token, to_millis(claimed_at + lease), message.id],
                    )?;
                    HeadClaim::Claimed { message, token }
                }
            };

            tx.commit()?;
            Ok((budget, claim))
        })
    }

    /// Stamp a claimed message as sent and bind its conversation, in one transaction.
    ///
    /// Returns `false` when the claim was lost (lease expired and taken over).
    pub fn complete_delivery(
        &self,
        message_id: &str,
        token: &str,
        sent_at: DateTime<Utc>,
        conversation_id: &str,
        handler: Option<&str>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = tx.execute(
                "UPDATE enqueued_messages SET sent_at = ?1, conversation_id = ?2, \
                 claim_token = NULL, claimed_until = NULL \
                 WHERE id = ?3 AND claim_token = ?4 AND sent_at IS NULL",
                params![to_millis(sent_at), conversation_id, message_id, token],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            if let Some(handler) = handler {
                super::events::upsert_binding(&tx, conversation_id, handler, sent_at)?;
            }
            tx.commit()?;
            Ok(true)
        })
    }

    /// Give a claimed message back to the queue after a failed delivery.
    pub fn release_claim(&self, message_id: &str, token: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE enqueued_messages SET claim_token = NULL, claimed_until = NULL \
                 WHERE id = ?1 AND claim_token = ?2",
                params![message_id, token],
            )?;
            Ok(())
        })
    }
}

fn query_send_records(
    conn: &rusqlite::Connection,
    queue_id: i64,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> rusqlite::Result<Vec<SendRecord>> {
    let mut stmt = conn.prepare(
        "SELECT sent_at, estimated_duration_secs FROM enqueued_messages \
         WHERE queue_id = ?1 AND sent_at IS NOT NULL AND sent_at >= ?2 AND sent_at <= ?3",
    )?;
    let records = stmt
        .query_map(params![queue_id, to_millis(since), to_millis(until)], |row| {
            Ok(SendRecord::new(from_millis(row.get(0)?)?, row.get(1)?))
        })?
        .collect();
    records
}
