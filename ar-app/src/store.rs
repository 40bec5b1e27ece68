//! SQLite persistence for conversation history.
//!
//! One database file holds both the message log and the live bot settings
//! (see `settings.rs`). Every statement runs on the blocking pool.

use anyhow::{Context, Result, anyhow};
use ar_channels::{ConversationId, MessageId};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversation_messages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  conversation_id TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('inbound', 'outbound')),
  text TEXT NOT NULL,
  external_id TEXT UNIQUE,
  is_read INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversation_messages_conversation
  ON conversation_messages (conversation_id, id);
CREATE TABLE IF NOT EXISTS bot_settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
"#;

/// Shared handle to the single SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data dir: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open database: {}", path.display()))?;
        conn.busy_timeout(Duration::from_millis(5000))
            .context("set sqlite busy timeout")?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .context("enable sqlite wal")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().context("open in-memory database")?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("create schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            f(&mut *guard)
        })
        .await?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| anyhow!("database mutex poisoned"))
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Inbound,
    Outbound,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(anyhow!("unknown message role in store: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: String,
    pub role: MessageRole,
    pub text: String,
    pub external_id: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub message_count: i64,
    pub unread_count: i64,
    pub last_text: String,
    pub last_message_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ConversationStore {
    db: Database,
}

impl ConversationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// True once an inbound message with this provider id has been recorded.
    pub async fn exists(&self, external_id: &MessageId) -> Result<bool> {
        let external_id = external_id.to_string();
        self.db
            .call(move |conn| {
                let found = conn
                    .query_row(
                        "SELECT 1 FROM conversation_messages WHERE external_id = ?1",
                        params![external_id],
                        |_| Ok(()),
                    )
                    .optional()?;
                Ok(found.is_some())
            })
            .await
    }

    /// Returns false when `external_id` was already present and nothing was written.
    pub async fn append(
        &self,
        conversation_id: &ConversationId,
        role: MessageRole,
        text: &str,
        external_id: Option<&MessageId>,
    ) -> Result<bool> {
        let conversation_id = conversation_id.to_string();
        let text = text.to_string();
        let external_id = external_id.map(ToString::to_string);
        // Our own replies count as read.
        let is_read = role == MessageRole::Outbound;
        self.db
            .call(move |conn| {
                let inserted = conn.execute(
                    r#"
INSERT OR IGNORE INTO conversation_messages
  (conversation_id, role, text, external_id, is_read, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
                    params![
                        conversation_id,
                        role.as_str(),
                        text,
                        external_id,
                        is_read,
                        now_rfc3339()
                    ],
                )?;
                Ok(inserted == 1)
            })
            .await
    }

    /// Last `limit` messages of a conversation, oldest first.
    pub async fn recent(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let conversation_id = conversation_id.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    r#"
SELECT id, conversation_id, role, text, external_id, is_read, created_at
FROM conversation_messages
WHERE conversation_id = ?1
ORDER BY id DESC
LIMIT ?2
"#,
                )?;
                let rows = stmt.query_map(params![conversation_id, limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })?;

                let mut out = Vec::new();
                for row in rows {
                    let (id, conversation_id, role, text, external_id, read, created_at) = row?;
                    out.push(StoredMessage {
                        id,
                        conversation_id,
                        role: MessageRole::parse(&role)?,
                        text,
                        external_id,
                        read,
                        created_at: parse_stored_time(&created_at)?,
                    });
                }
                out.reverse();
                Ok(out)
            })
            .await
    }

    /// Conversations ordered by most recent activity.
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare_cached(
                    r#"
SELECT
  m.conversation_id,
  COUNT(*) AS message_count,
  SUM(CASE WHEN m.is_read = 0 THEN 1 ELSE 0 END) AS unread_count,
  (SELECT l.text FROM conversation_messages l
     WHERE l.conversation_id = m.conversation_id ORDER BY l.id DESC LIMIT 1) AS last_text,
  MAX(m.created_at) AS last_message_at
FROM conversation_messages m
GROUP BY m.conversation_id
ORDER BY MAX(m.id) DESC
"#,
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?;

                let mut out = Vec::new();
                for row in rows {
                    let (conversation_id, message_count, unread_count, last_text, last_at) = row?;
                    out.push(ConversationSummary {
                        conversation_id,
                        message_count,
                        unread_count,
                        last_text,
                        last_message_at: parse_stored_time(&last_at)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    /// Marks every inbound message of the conversation read; returns how many changed.
    pub async fn mark_read(&self, conversation_id: &ConversationId) -> Result<usize> {
        let conversation_id = conversation_id.to_string();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE conversation_messages SET is_read = 1 WHERE conversation_id = ?1 AND is_read = 0",
                    params![conversation_id],
                )?;
                Ok(changed)
            })
            .await
    }
}

fn parse_stored_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid stored timestamp {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConversationStore {
        ConversationStore::new(Database::open_in_memory().expect("in-memory db"))
    }

    fn conv(id: &str) -> ConversationId {
        ConversationId::new(id)
    }

    #[tokio::test]
    async fn append_is_idempotent_per_external_id() {
        let store = store();
        let m1 = MessageId::new("M1");

        assert!(!store.exists(&m1).await.expect("exists"));
        assert!(
            store
                .append(&conv("5511"), MessageRole::Inbound, "oi", Some(&m1))
                .await
                .expect("append")
        );
        assert!(store.exists(&m1).await.expect("exists"));
        assert!(
            !store
                .append(&conv("5511"), MessageRole::Inbound, "oi", Some(&m1))
                .await
                .expect("append again")
        );

        // Replies carry no external id and never collide.
        for _ in 0..2 {
            assert!(
                store
                    .append(&conv("5511"), MessageRole::Outbound, "olá", None)
                    .await
                    .expect("append reply")
            );
        }
        assert_eq!(store.recent(&conv("5511"), 10).await.expect("recent").len(), 3);
    }

    #[tokio::test]
    async fn recent_returns_last_messages_oldest_first() {
        let store = store();
        for i in 0..5 {
            let id = MessageId::new(format!("M{i}"));
            store
                .append(&conv("a"), MessageRole::Inbound, &format!("msg {i}"), Some(&id))
                .await
                .expect("append");
        }
        store
            .append(&conv("b"), MessageRole::Inbound, "other", None)
            .await
            .expect("append");

        let recent = store.recent(&conv("a"), 3).await.expect("recent");
        let texts: Vec<&str> = recent.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["msg 2", "msg 3", "msg 4"]);
        assert!(recent.iter().all(|m| m.conversation_id == "a"));
        assert_eq!(recent[0].external_id.as_deref(), Some("M2"));
    }

    #[tokio::test]
    async fn conversations_summarize_and_mark_read_clears_unread() {
        let store = store();
        store
            .append(&conv("a"), MessageRole::Inbound, "oi", Some(&MessageId::new("A1")))
            .await
            .expect("append");
        store
            .append(&conv("a"), MessageRole::Outbound, "olá!", None)
            .await
            .expect("append");
        store
            .append(&conv("b"), MessageRole::Inbound, "bom dia", Some(&MessageId::new("B1")))
            .await
            .expect("append");

        let summaries = store.conversations().await.expect("conversations");
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].conversation_id, "b");
        assert_eq!(summaries[1].conversation_id, "a");
        assert_eq!(summaries[1].message_count, 2);
        assert_eq!(summaries[1].unread_count, 1);
        assert_eq!(summaries[1].last_text, "olá!");

        assert_eq!(store.mark_read(&conv("a")).await.expect("mark read"), 1);
        assert_eq!(store.mark_read(&conv("a")).await.expect("mark read again"), 0);
        let summaries = store.conversations().await.expect("conversations");
        assert_eq!(summaries[1].unread_count, 0);
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("autoreply.db");
        {
            let store = ConversationStore::new(Database::open(&path).expect("open"));
            store
                .append(&conv("a"), MessageRole::Inbound, "oi", Some(&MessageId::new("X")))
                .await
                .expect("append");
        }
        let store = ConversationStore::new(Database::open(&path).expect("reopen"));
        assert!(store.exists(&MessageId::new("X")).await.expect("exists"));
    }
}
