//! Conversation history keyed by session key.
//!
//! The executor records each inbound payload and the reply it produced. Because an
//! authenticated user's session key does not depend on the channel, a conversation started
//! on one channel continues on another. History is in memory only and capped per session.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Messages kept per session; older ones are dropped first.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry in a conversation, tagged with the channel it passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: Role,
    pub channel: String,
    pub content: String,
}

impl SessionMessage {
    pub fn user(channel: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            channel: channel.into(),
            content: content.into(),
        }
    }

    pub fn assistant(channel: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            channel: channel.into(),
            content: content.into(),
        }
    }

    pub fn system(channel: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            channel: channel.into(),
            content: content.into(),
        }
    }
}

/// A session: its key and ordered history.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub messages: Vec<SessionMessage>,
}

/// In-memory session store. Cloning shares the same map.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<String, Session>>>,
    limit: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            limit: limit.max(1),
        }
    }

    /// Return a clone of the session if it exists.
    pub async fn get(&self, key: &str) -> Option<Session> {
        self.inner.read().await.get(key).cloned()
    }

    /// Append to the session for `key`, creating it on first use.
    pub async fn append(&self, key: &str, message: SessionMessage) {
        let mut g = self.inner.write().await;
        let session = g.entry(key.to_string()).or_insert_with(|| Session {
            key: key.to_string(),
            messages: Vec::new(),
        });
        session.messages.push(message);
        if session.messages.len() > self.limit {
            let excess = session.messages.len() - self.limit;
            session.messages.drain(..excess);
        }
    }

    /// Up to `n` most recent messages, oldest first.
    pub async fn recent(&self, key: &str, n: usize) -> Vec<SessionMessage> {
        let g = self.inner.read().await;
        match g.get(key) {
            Some(s) => {
                let start = s.messages.len().saturating_sub(n);
                s.messages[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
