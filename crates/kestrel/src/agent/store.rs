//! Conversation store interface and an in-memory implementation.

use crate::{Error, Message, Result, Role};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A conversation, identified by an external key (chat id, thread id, ...)
/// and the user it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub key: String,
    pub user: String,
    pub created_at: DateTime<Utc>,
}

/// Persistent history. Appends within a session are strictly sequential;
/// the runner is the only writer during a run.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_or_create(&self, key: &str, user: &str) -> Result<Session>;

    async fn append_message(&self, session_id: &str, message: Message) -> Result<()>;

    /// The most recent `limit` messages, oldest first.
    async fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// Replace older history with `summary`, keeping the recent tail.
    async fn compact(&self, session_id: &str, summary: &str) -> Result<()>;

    async fn get_summary(&self, session_id: &str) -> Result<Option<String>>;
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Vec<Message>>,
    summaries: HashMap<String, String>,
}

/// Process-local store. Compaction keeps the last few messages and never
/// lets the kept tail start with a tool result.
#[derive(Debug)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    keep_after_compact: usize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
            keep_after_compact: 6,
        }
    }

    pub fn with_keep_after_compact(mut self, n: usize) -> Self {
        self.keep_after_compact = n;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Store("in-memory store lock poisoned".into()))
    }

    /// Every stored message of a session, for tests and inspection.
    pub fn all_messages(&self, session_id: &str) -> Vec<Message> {
        self.lock()
            .ok()
            .and_then(|g| g.messages.get(session_id).cloned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn get_or_create(&self, key: &str, user: &str) -> Result<Session> {
        let mut inner = self.lock()?;
        let lookup = format!("{user}\u{0}{key}");
        if let Some(s) = inner.sessions.get(&lookup) {
            return Ok(s.clone());
        }
        let session = Session {
            id: format!("sess-{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
            key: key.to_string(),
            user: user.to_string(),
            created_at: Utc::now(),
        };
        inner.messages.insert(session.id.clone(), Vec::new());
        inner.sessions.insert(lookup, session.clone());
        Ok(session)
    }

    async fn append_message(&self, session_id: &str, message: Message) -> Result<()> {
        let mut inner = self.lock()?;
        let list = inner
            .messages
            .get_mut(session_id)
            .ok_or_else(|| Error::Store(format!("unknown session: {session_id}")))?;
        list.push(message.in_session(session_id));
        Ok(())
    }

    async fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let inner = self.lock()?;
        let list = inner
            .messages
            .get(session_id)
            .ok_or_else(|| Error::Store(format!("unknown session: {session_id}")))?;
        let start = list.len().saturating_sub(limit);
        Ok(list[start..].to_vec())
    }

    async fn compact(&self, session_id: &str, summary: &str) -> Result<()> {
        let keep = self.keep_after_compact;
        let mut inner = self.lock()?;
        let list = inner
            .messages
            .get_mut(session_id)
            .ok_or_else(|| Error::Store(format!("unknown session: {session_id}")))?;
        let mut start = list.len().saturating_sub(keep);
        while start < list.len() && list[start].role == Role::Tool {
            start += 1;
        }
        list.drain(..start);
        inner
            .summaries
            .insert(session_id.to_string(), summary.to_string());
        Ok(())
    }

    async fn get_summary(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self.lock()?.summaries.get(session_id).cloned())
    }
}
