//! History store implementations: in-memory and SQLite.
//!
//! Messages are serialized as JSON (the tagged [`Message`] representation)
//! so annotations survive round-trips. The SQLite store keeps one `messages`
//! table ordered by a per-session sequence and a `sessions` table carrying
//! `updated_at`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::message::Message;

use super::{HistoryError, HistoryStore};

/// Volatile history store for tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    sessions: Mutex<HashMap<String, Vec<Message>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_sessions<T>(&self, f: impl FnOnce(&mut HashMap<String, Vec<Message>>) -> T) -> T {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut sessions)
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, session_id: &str, messages: &[Message]) -> Result<(), HistoryError> {
        self.with_sessions(|sessions| {
            sessions
                .entry(session_id.to_string())
                .or_default()
                .extend(messages.iter().cloned());
        });
        Ok(())
    }

    async fn latest(&self, session_id: &str, limit: usize) -> Result<Vec<Message>, HistoryError> {
        Ok(self.with_sessions(|sessions| {
            let history = sessions.get(session_id).cloned().unwrap_or_default();
            let skip = history.len().saturating_sub(limit);
            history.into_iter().skip(skip).collect()
        }))
    }

    async fn overwrite(&self, session_id: &str, messages: &[Message]) -> Result<(), HistoryError> {
        self.with_sessions(|sessions| {
            sessions.insert(session_id.to_string(), messages.to_vec());
        });
        Ok(())
    }

    async fn trim(&self, session_id: &str, keep_last: usize) -> Result<(), HistoryError> {
        self.with_sessions(|sessions| {
            if let Some(history) = sessions.get_mut(session_id) {
                let excess = history.len().saturating_sub(keep_last);
                if excess > 0 {
                    history.drain(..excess);
                }
            }
        });
        Ok(())
    }

    async fn touch(&self, _session_id: &str) -> Result<(), HistoryError> {
        Ok(())
    }
}

/// SQLite-backed history store.
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    /// Opens (or creates) the database at `path` and ensures the schema.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-memory database, useful for tests.
    pub fn open_in_memory() -> Result<Self, HistoryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            );
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, HistoryError>,
    ) -> Result<T, HistoryError> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&conn)
    }

    fn next_seq(conn: &Connection, session_id: &str) -> Result<i64, HistoryError> {
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), -1) + 1 FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(seq)
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, session_id: &str, messages: &[Message]) -> Result<(), HistoryError> {
        self.with_conn(|conn| {
            let mut seq = Self::next_seq(conn, session_id)?;
            for message in messages {
                let payload = serde_json::to_string(message)?;
                conn.execute(
                    "INSERT INTO messages (session_id, seq, payload) VALUES (?1, ?2, ?3)",
                    params![session_id, seq, payload],
                )?;
                seq += 1;
            }
            debug!(session_id, added = messages.len(), "history appended");
            Ok(())
        })
    }

    async fn latest(&self, session_id: &str, limit: usize) -> Result<Vec<Message>, HistoryError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM (
                    SELECT seq, payload FROM messages
                    WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2
                ) ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![session_id, limit as i64], |row| {
                row.get::<_, String>(0)
            })?;
            let mut messages = Vec::new();
            for payload in rows {
                messages.push(serde_json::from_str(&payload?)?);
            }
            Ok(messages)
        })
    }

    async fn overwrite(&self, session_id: &str, messages: &[Message]) -> Result<(), HistoryError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM messages WHERE session_id = ?1",
                params![session_id],
            )?;
            for (seq, message) in messages.iter().enumerate() {
                let payload = serde_json::to_string(message)?;
                conn.execute(
                    "INSERT INTO messages (session_id, seq, payload) VALUES (?1, ?2, ?3)",
                    params![session_id, seq as i64, payload],
                )?;
            }
            debug!(session_id, count = messages.len(), "history overwritten");
            Ok(())
        })
    }

    async fn trim(&self, session_id: &str, keep_last: usize) -> Result<(), HistoryError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM messages WHERE session_id = ?1 AND seq NOT IN (
                    SELECT seq FROM messages WHERE session_id = ?1
                    ORDER BY seq DESC LIMIT ?2
                )",
                params![session_id, keep_last as i64],
            )?;
            Ok(())
        })
    }

    async fn touch(&self, session_id: &str) -> Result<(), HistoryError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, updated_at) VALUES (?1, ?2)
                 ON CONFLICT(session_id) DO UPDATE SET updated_at = excluded.updated_at",
                params![session_id, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }
}
