//! Conversation history kept in a key-value table.
//!
//! Each conversation is one record: the session id as primary key and a
//! `History` list of serialized messages, oldest first. Reads never fail the
//! caller; backend trouble is logged and surfaces as an empty history.

pub mod codec;
pub mod dynamodb;
pub mod memory;
pub mod sqlite;

pub use codec::{ChaChaCipher, Cipher, JsonMessageCodec, MessageCodec, SealedCodec};
pub use dynamodb::DynamoDbTable;
pub use memory::MemoryTable;
pub use sqlite::SqliteTable;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Human,
    Ai,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Ai => "ai",
            Self::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "human" => Some(Self::Human),
            "ai" => Some(Self::Ai),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Human,
            content: content.into(),
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Ai,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The table (or the record's container) does not exist.
    #[error("no record found: {0}")]
    NotFound(String),
    #[error("history backend error: {0}")]
    Backend(String),
    #[error("history codec error: {0}")]
    Codec(String),
}

/// Storage seam for history records. Implementations own the whole record
/// for a key; `append` must extend the list atomically within the backend.
#[async_trait]
pub trait TableBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn get(&self, key: &str) -> Result<Option<Vec<Value>>, StoreError>;
    async fn put(&self, key: &str, history: Vec<Value>) -> Result<(), StoreError>;
    async fn append(&self, key: &str, entries: Vec<Value>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Key under which `reset` archives a conversation.
pub fn archive_key(session_id: &str, millis: i64) -> String {
    format!("{session_id}#{millis}")
}

/// Per-key async locks. Entries with no outstanding guard are pruned on the
/// next acquisition.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

pub struct HistoryStore {
    backend: Arc<dyn TableBackend>,
    codec: Arc<dyn MessageCodec>,
    locks: KeyedLocks,
}

impl HistoryStore {
    pub fn new(backend: Arc<dyn TableBackend>, codec: Arc<dyn MessageCodec>) -> Self {
        Self {
            backend,
            codec,
            locks: KeyedLocks::default(),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// The last `limit` messages, oldest first.
    pub async fn read_recent(&self, session_id: &str, limit: usize) -> Vec<ChatMessage> {
        let entries = self.load_entries(session_id).await;
        let start = entries.len().saturating_sub(limit);
        self.decode_entries(session_id, &entries[start..])
    }

    pub async fn read_all(&self, session_id: &str) -> Vec<ChatMessage> {
        let entries = self.load_entries(session_id).await;
        self.decode_entries(session_id, &entries)
    }

    pub async fn append(&self, session_id: &str, message: &ChatMessage) {
        let entry = match self.codec.encode(message) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!(session_id, error = %err, "Failed to encode history message");
                return;
            }
        };

        let _guard = self.locks.acquire(session_id).await;
        if let Err(err) = self.backend.append(session_id, vec![entry]).await {
            tracing::error!(
                session_id,
                backend = self.backend.name(),
                error = %err,
                "Failed to append history message"
            );
        }
    }

    /// Archive the record under `<session_id>#<millis>` and delete it.
    pub async fn reset(&self, session_id: &str) {
        let _guard = self.locks.acquire(session_id).await;

        let current = match self.backend.get(session_id).await {
            Ok(current) => current,
            Err(err) => {
                tracing::error!(session_id, error = %err, "Failed to read history before reset");
                return;
            }
        };

        if let Some(history) = current {
            let backup = archive_key(session_id, chrono::Utc::now().timestamp_millis());
            if let Err(err) = self.backend.put(&backup, history).await {
                tracing::error!(session_id, %backup, error = %err, "Failed to archive history");
                return;
            }
            tracing::info!(session_id, %backup, "Archived conversation history");
        }

        if let Err(err) = self.backend.delete(session_id).await {
            tracing::error!(session_id, error = %err, "Failed to delete history");
        }
    }

    async fn load_entries(&self, session_id: &str) -> Vec<Value> {
        match self.backend.get(session_id).await {
            Ok(Some(entries)) => entries,
            Ok(None) => Vec::new(),
            Err(StoreError::NotFound(what)) => {
                tracing::warn!(session_id, %what, "No record found with session id");
                Vec::new()
            }
            Err(err) => {
                tracing::error!(
                    session_id,
                    backend = self.backend.name(),
                    error = %err,
                    "Failed to read history"
                );
                Vec::new()
            }
        }
    }

    fn decode_entries(&self, session_id: &str, entries: &[Value]) -> Vec<ChatMessage> {
        entries
            .iter()
            .filter_map(|entry| match self.codec.decode(entry) {
                Ok(message) => Some(message),
                Err(err) => {
                    tracing::warn!(session_id, error = %err, "Skipping undecodable history entry");
                    None
                }
            })
            .collect()
    }
}
