//! Per-session resources and the chat history contract.
//!
//! Durable history storage is strictly delegated through the narrow
//! [`HistoryStore`] interface (append, read-latest, overwrite, trim, touch).
//! The facade serializes mutating operations per session through the
//! session's write lock; concurrent reads are unrestricted.

mod history;

pub use history::{InMemoryHistoryStore, SqliteHistoryStore};

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::memory::VectorStore;
use crate::message::Message;

/// Errors from history persistence.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for HistoryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for HistoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Narrow chat history contract.
///
/// Ordering within a session is append order; `latest` returns the most
/// recent `limit` messages in chronological order.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, session_id: &str, messages: &[Message]) -> Result<(), HistoryError>;

    async fn latest(&self, session_id: &str, limit: usize) -> Result<Vec<Message>, HistoryError>;

    /// Replaces the session's history wholesale.
    async fn overwrite(&self, session_id: &str, messages: &[Message]) -> Result<(), HistoryError>;

    /// Keeps only the most recent `keep_last` messages.
    async fn trim(&self, session_id: &str, keep_last: usize) -> Result<(), HistoryError>;

    /// Updates the session's `updated_at` marker.
    async fn touch(&self, session_id: &str) -> Result<(), HistoryError>;
}

/// Resources aggregated per session.
pub struct SessionResources {
    pub session_id: String,
    pub history: Arc<dyn HistoryStore>,
    pub vector_store: Option<Arc<dyn VectorStore>>,
    /// Serializes history mutations for this session.
    pub write_lock: tokio::sync::Mutex<()>,
}

/// Maps session ids to their resources; creates on first reference.
pub struct SessionManager {
    history: Arc<dyn HistoryStore>,
    vector_store: Option<Arc<dyn VectorStore>>,
    active: DashMap<String, Arc<SessionResources>>,
}

impl SessionManager {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        vector_store: Option<Arc<dyn VectorStore>>,
    ) -> Self {
        Self {
            history,
            vector_store,
            active: DashMap::new(),
        }
    }

    /// Returns the session's resources, creating them on first use.
    pub fn get_session_resources(&self, session_id: &str) -> Arc<SessionResources> {
        self.active
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session_id, "created session resources");
                Arc::new(SessionResources {
                    session_id: session_id.to_string(),
                    history: self.history.clone(),
                    vector_store: self.vector_store.clone(),
                    write_lock: tokio::sync::Mutex::new(()),
                })
            })
            .clone()
    }

    /// Releases the session's resources. Returns true when it existed.
    pub fn release_session(&self, session_id: &str) -> bool {
        let removed = self.active.remove(session_id).is_some();
        if removed {
            debug!(session_id, "released session resources");
        }
        removed
    }

    pub fn active_session_count(&self) -> usize {
        self.active.len()
    }

    pub fn list_active_sessions(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }
}
