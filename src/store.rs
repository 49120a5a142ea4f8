//! Durable session store seam
//!
//! The core is write-mostly toward persistence: sessions and turns are
//! written fire-and-forget, and only session restoration reads back. The
//! [`SessionStore`] trait captures exactly that surface; the storage engine
//! behind it is not prescribed.
//!
//! Layout mirrored by implementations:
//! - session documents keyed by `session_id`
//! - a conversation subcollection per session, keyed by `turn_id`
//! - a cache keyspace of composed string keys holding
//!   `{content, created_at, expires_at}`
//!
//! [`MemoryStore`] is the bundled in-memory implementation used by tests and
//! credential-less local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::types::{ConversationTurn, SessionMetadata, now_ts};
use crate::{Error, Result};

/// Write-mostly persistence operations used by the memory manager.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create the session document.
    async fn create_session(&self, session_id: &str, metadata: &SessionMetadata) -> Result<()>;

    /// Merge field updates into the session document; bumps `last_active`.
    async fn update_session(&self, session_id: &str, updates: HashMap<String, Value>)
    -> Result<()>;

    /// Fetch session metadata, if the session exists.
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionMetadata>>;

    /// Append a turn to the session's conversation log.
    async fn save_turn(&self, session_id: &str, turn: &ConversationTurn) -> Result<()>;

    /// The most recent `limit` turns, in chronological order.
    async fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>>;

    /// Read a cache entry; expired entries read as absent.
    async fn get_cached(&self, key: &str) -> Result<Option<String>>;

    /// Write a cache entry with a TTL in hours.
    async fn set_cached(&self, key: &str, content: &str, ttl_hours: u64) -> Result<()>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    content: String,
    #[allow(dead_code)]
    created_at: f64,
    expires_at: f64,
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<String, Value>,
    conversations: DashMap<String, Vec<ConversationTurn>>,
    cache: DashMap<String, CacheEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored turns for a session (test observability).
    pub fn turn_count(&self, session_id: &str) -> usize {
        self.conversations
            .get(session_id)
            .map(|turns| turns.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session_id: &str, metadata: &SessionMetadata) -> Result<()> {
        let doc = serde_json::to_value(metadata)?;
        self.sessions.insert(session_id.to_string(), doc);
        Ok(())
    }

    async fn update_session(
        &self,
        session_id: &str,
        updates: HashMap<String, Value>,
    ) -> Result<()> {
        let mut doc = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::persistence(format!("no session {}", session_id)))?;

        if let Value::Object(map) = doc.value_mut() {
            for (key, value) in updates {
                map.insert(key, value);
            }
            map.insert("last_active".to_string(), serde_json::json!(now_ts()));
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionMetadata>> {
        match self.sessions.get(session_id) {
            Some(doc) => {
                let metadata = serde_json::from_value(doc.value().clone())?;
                Ok(Some(metadata))
            }
            None => Ok(None),
        }
    }

    async fn save_turn(&self, session_id: &str, turn: &ConversationTurn) -> Result<()> {
        self.conversations
            .entry(session_id.to_string())
            .or_default()
            .push(turn.clone());

        // Keep the document's turn counter in step with the log.
        if let Some(mut doc) = self.sessions.get_mut(session_id) {
            if let Value::Object(map) = doc.value_mut() {
                let count = map
                    .get("turn_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                map.insert("turn_count".to_string(), serde_json::json!(count + 1));
            }
        }
        Ok(())
    }

    async fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let turns = self
            .conversations
            .get(session_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        let start = turns.len().saturating_sub(limit);
        Ok(turns[start..].to_vec())
    }

    async fn get_cached(&self, key: &str) -> Result<Option<String>> {
        // Shard guard must drop before the remove below.
        let expired = match self.cache.get(key) {
            Some(entry) if entry.expires_at > now_ts() => return Ok(Some(entry.content.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.cache.remove(key);
        }
        Ok(None)
    }

    async fn set_cached(&self, key: &str, content: &str, ttl_hours: u64) -> Result<()> {
        let now = now_ts();
        self.cache.insert(
            key.to_string(),
            CacheEntry {
                content: content.to_string(),
                created_at: now,
                expires_at: now + (ttl_hours as f64) * 3600.0,
            },
        );
        Ok(())
    }
}
