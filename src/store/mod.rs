//! SQLite-backed store for queues, messages, listener bindings and inbound items.
//!
//! All mutation of `sent_at` and `processed` goes through conditional
//! updates here, so overlapping ticks (in one process or several) never
//! deliver a message or dispatch a reply twice.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

use crate::error::{Error, Result};

mod events;
mod messages;

pub use messages::HeadClaim;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS message_queues (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        attention_budget_minutes INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (user_id, name)
    );
    CREATE TABLE IF NOT EXISTS enqueued_messages (
        id TEXT PRIMARY KEY,
        queue_id INTEGER NOT NULL REFERENCES message_queues(id) ON DELETE CASCADE,
        content TEXT NOT NULL,
        recipient TEXT NOT NULL,
        subject TEXT NOT NULL,
        estimated_duration_secs REAL NOT NULL,
        created_at INTEGER NOT NULL,
        sent_at INTEGER,
        conversation_id TEXT,
        response_handler TEXT,
        claim_token TEXT,
        claimed_until INTEGER
    );
    CREATE TABLE IF NOT EXISTS listener_bindings (
        conversation_id TEXT PRIMARY KEY,
        handler TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS inbound_items (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        sender TEXT NOT NULL,
        recipient TEXT NOT NULL,
        subject TEXT NOT NULL,
        content TEXT NOT NULL,
        received_at INTEGER NOT NULL,
        processed INTEGER NOT NULL DEFAULT 0,
        claim_token TEXT,
        claimed_until INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_messages_pending ON enqueued_messages(queue_id, sent_at, created_at);
    CREATE INDEX IF NOT EXISTS idx_messages_conversation ON enqueued_messages(conversation_id);
    CREATE INDEX IF NOT EXISTS idx_inbound_unprocessed ON inbound_items(processed, received_at);
    CREATE INDEX IF NOT EXISTS idx_inbound_conversation ON inbound_items(conversation_id, received_at);
"#;

/// Handle to the database. Cheap to share behind an `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        tracing::debug!("Opened store at {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::Other("store connection mutex poisoned".to_string()))?;
        f(&mut conn)
    }

    /// Row counts for status output.
    pub fn stats(&self) -> Result<StoreStats> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<usize> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as usize)
            };
            Ok(StoreStats {
                queues: count("SELECT COUNT(*) FROM message_queues")?,
                pending: count("SELECT COUNT(*) FROM enqueued_messages WHERE sent_at IS NULL")?,
                sent: count("SELECT COUNT(*) FROM enqueued_messages WHERE sent_at IS NOT NULL")?,
                bindings: count("SELECT COUNT(*) FROM listener_bindings")?,
                unprocessed: count("SELECT COUNT(*) FROM inbound_items WHERE processed = 0")?,
            })
        })
    }
}

/// Store statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub queues: usize,
    pub pending: usize,
    pub sent: usize,
    pub bindings: usize,
    pub unprocessed: usize,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Store Stats:")?;
        writeln!(f, "  Queues:      {}", self.queues)?;
        writeln!(f, "  Pending:     {}", self.pending)?;
        writeln!(f, "  Sent:        {}", self.sent)?;
        writeln!(f, "  Listeners:   {}", self.bindings)?;
        write!(f, "  Unprocessed: {}", self.unprocessed)
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {}", ms).into(),
        )
    })
}

pub(crate) fn new_claim_token() -> String {
    ulid::Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_on_disk_is_reopenable() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("mailpacer.db");

        {
            let store = Store::open(&path).unwrap();
            store
                .get_or_create_queue("alice", "email", 120, Utc::now())
                .unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.stats().unwrap().queues, 1);
    }

    #[test]
    fn test_stats_on_empty_store() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.stats().unwrap(), StoreStats::default());
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc.with_ymd_and_hms(2024, 5, 14, 9, 30, 0).unwrap();
        assert_eq!(from_millis(to_millis(now)).unwrap(), now);
    }
}
