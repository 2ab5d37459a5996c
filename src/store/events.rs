//! Listener bindings and inbound items.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{from_millis, new_claim_token, to_millis, Store};
use crate::core::message::{InboundItem, ListenerBinding};
use crate::error::Result;

const INBOUND_COLUMNS: &str =
    "id, conversation_id, sender, recipient, subject, content, received_at, processed";

fn binding_from_row(row: &Row<'_>) -> rusqlite::Result<ListenerBinding> {
    Ok(ListenerBinding {
        conversation_id: row.get(0)?,
        handler: row.get(1)?,
        created_at: from_millis(row.get(2)?)?,
        updated_at: from_millis(row.get(3)?)?,
    })
}

fn inbound_from_row(row: &Row<'_>) -> rusqlite::Result<InboundItem> {
    Ok(InboundItem {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender: row.get(2)?,
        recipient: row.get(3)?,
        subject: row.get(4)?,
        content: row.get(5)?,
        received_at: from_millis(row.get(6)?)?,
        processed: row.get(7)?,
    })
}

pub(super) fn upsert_binding(
    conn: &Connection,
    conversation_id: &str,
    handler: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO listener_bindings (conversation_id, handler, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?3) \
         ON CONFLICT (conversation_id) DO UPDATE SET handler = excluded.handler, \
         updated_at = excluded.updated_at",
        params![conversation_id, handler, to_millis(now)],
    )?;
    Ok(())
}

impl Store {
    /// Bind `conversation_id` to `handler`, replacing any previous binding.
    pub fn set_binding(&self, conversation_id: &str, handler: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| Ok(upsert_binding(conn, conversation_id, handler, now)?))
    }

    pub fn binding(&self, conversation_id: &str) -> Result<Option<ListenerBinding>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT conversation_id, handler, created_at, updated_at \
                     FROM listener_bindings WHERE conversation_id = ?1",
                    params![conversation_id],
                    binding_from_row,
                )
                .optional()?)
        })
    }

    pub fn list_bindings(&self) -> Result<Vec<ListenerBinding>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, handler, created_at, updated_at \
                 FROM listener_bindings ORDER BY created_at, conversation_id",
            )?;
            let bindings = stmt
                .query_map([], binding_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(bindings)
        })
    }

    /// Record an inbound item. Returns `false` if its ID was already known.
    pub fn record_inbound(&self, item: &InboundItem) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO inbound_items ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    INBOUND_COLUMNS
                ),
                params![
                    item.id,
                    item.conversation_id,
                    item.sender,
                    item.recipient,
                    item.subject,
                    item.content,
                    to_millis(item.received_at),
                    item.processed,
                ],
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn inbound(&self, id: &str) -> Result<Option<InboundItem>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM inbound_items WHERE id = ?1", INBOUND_COLUMNS),
                    params![id],
                    inbound_from_row,
                )
                .optional()?)
        })
    }

    /// Unprocessed items in arrival order.
    pub fn unprocessed_inbound(&self) -> Result<Vec<InboundItem>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM inbound_items WHERE processed = 0 ORDER BY received_at, rowid",
                INBOUND_COLUMNS
            ))?;
            let items = stmt
                .query_map([], inbound_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(items)
        })
    }

    /// Claim an unprocessed item for dispatch. `None` if it is processed or
    /// another dispatcher holds a live claim. The lease runs from
    /// `claimed_at`, the wall clock when the claim is taken.
    pub fn claim_inbound(
        &self,
        id: &str,
        claimed_at: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let token = new_claim_token();
            let changed = conn.execute(
                "UPDATE inbound_items SET claim_token = ?1, claimed_until = ?2 \
                 WHERE id = ?3 AND processed = 0 AND (claimed_until IS NULL OR claimed_until <= ?4)",
                params![token, to_millis(claimed_at + lease), id, to_millis(claimed_at)],
            )?;
            Ok((changed == 1).then_some(token))
        })
    }

    /// Mark a claimed item processed. Returns `false` if the claim was lost.
    pub fn mark_processed(&self, id: &str, token: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE inbound_items SET processed = 1, claim_token = NULL, claimed_until = NULL \
                 WHERE id = ?1 AND claim_token = ?2 AND processed = 0",
                params![id, token],
            )?;
            Ok(changed == 1)
        })
    }

    /// Drop a claim without processing, leaving the item for a later pass.
    pub fn release_inbound(&self, id: &str, token: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE inbound_items SET claim_token = NULL, claimed_until = NULL \
                 WHERE id = ?1 AND claim_token = ?2",
                params![id, token],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 14, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_binding_upsert_overwrites() {
        let store = Store::open_in_memory().unwrap();

        store.set_binding("t1", "builtin.log_reply", now()).unwrap();
        store
            .set_binding("t1", "builtin.acknowledge", now() + Duration::minutes(1))
            .unwrap();

        let bindings = store.list_bindings().unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].handler, "builtin.acknowledge");
        assert_eq!(bindings[0].created_at, now());
        assert_eq!(bindings[0].updated_at, now() + Duration::minutes(1));
        assert!(store.binding("t2").unwrap().is_none());
    }

    #[test]
    fn test_record_inbound_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let item = InboundItem::new("g1", "t1", "alice@example.com", "hi", now()).with_subject("Hello");

        assert!(store.record_inbound(&item).unwrap());
        assert!(!store.record_inbound(&item).unwrap());
        assert_eq!(store.inbound("g1").unwrap().unwrap(), item);
        assert_eq!(store.latest_subject("t1").unwrap().as_deref(), Some("Hello"));
    }

    #[test]
    fn test_unprocessed_in_arrival_order() {
        let store = Store::open_in_memory().unwrap();
        store
            .record_inbound(&InboundItem::new("late", "t1", "a", "x", now()))
            .unwrap();
        store
            .record_inbound(&InboundItem::new("early", "t1", "a", "x", now() - Duration::hours(1)))
            .unwrap();

        let ids: Vec<String> = store
            .unprocessed_inbound()
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn test_inbound_claim_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        store
            .record_inbound(&InboundItem::new("g1", "t1", "a", "x", now()))
            .unwrap();
        let lease = Duration::minutes(2);

        let token = store.claim_inbound("g1", now(), lease).unwrap().unwrap();
        assert!(store.claim_inbound("g1", now(), lease).unwrap().is_none());

        store.release_inbound("g1", &token).unwrap();
        let token = store.claim_inbound("g1", now(), lease).unwrap().unwrap();
        assert!(store.mark_processed("g1", &token).unwrap());
        assert!(!store.mark_processed("g1", &token).unwrap());

        assert!(store.inbound("g1").unwrap().unwrap().processed);
        assert!(store.unprocessed_inbound().unwrap().is_empty());
        assert!(store.claim_inbound("g1", now() + Duration::hours(1), lease).unwrap().is_none());
    }
}
