//! Durable-fact extraction.
//!
//! After a completed run the runner asks a cheap model to pull durable facts
//! about the user out of the recent exchange, and before compacting it asks
//! for anything worth keeping from the span about to be summarized away. Both
//! produce a bullet list parsed by [`parse_facts`] and handed to a
//! [`FactStore`].

use crate::{ChatRequest, Message, Result, Role};
use async_trait::async_trait;
use std::sync::Mutex;

/// Sink for extracted facts.
#[async_trait]
pub trait FactStore: Send + Sync {
    async fn save_facts(&self, user: &str, facts: Vec<String>) -> Result<()>;
}

const EXTRACTION_PROMPT: &str = "\
You extract durable facts about the user from a conversation.

Rules:
- Only facts likely to stay true for weeks: preferences, relationships, projects, \
locations, schedules, stated goals
- One fact per line, each starting with \"- \"
- Write each fact as a standalone sentence about the user
- Skip small talk, one-off requests and anything the assistant said about itself
- If there is nothing durable, reply with exactly NONE";

const FLUSH_PROMPT: &str = "\
The conversation below is about to be compacted and older messages will be \
replaced by a summary. Before that happens, list anything from it that must \
survive as a durable fact about the user.

Rules:
- One fact per line, each starting with \"- \"
- Only facts, decisions and preferences, not task progress
- If there is nothing durable, reply with exactly NONE";

/// Messages considered for post-run extraction.
const EXTRACTION_WINDOW: usize = 12;
/// Per-message character cap in the rendered transcript.
const TRANSCRIPT_MESSAGE_CHARS: usize = 2_000;
/// Facts accepted from one response.
const MAX_FACTS: usize = 20;

fn transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        if !matches!(m.role, Role::User | Role::Assistant) || m.content.trim().is_empty() {
            continue;
        }
        let text = crate::context::pruning::truncate_chars(&m.content, TRANSCRIPT_MESSAGE_CHARS);
        out.push_str(&format!("[{}]: {}\n\n", m.role, text));
    }
    out
}

/// Request asking `model` for durable facts from the tail of `history`.
pub fn extraction_request(model: &str, history: &[Message]) -> Option<ChatRequest> {
    let start = history.len().saturating_sub(EXTRACTION_WINDOW);
    let text = transcript(&history[start..]);
    if text.is_empty() {
        return None;
    }
    Some(
        ChatRequest::new(model, vec![Message::user(text)])
            .with_system(EXTRACTION_PROMPT)
            .with_max_tokens(1024),
    )
}

/// Request asking `model` what from `span` must survive compaction.
pub fn flush_request(model: &str, span: &[Message]) -> Option<ChatRequest> {
    let text = transcript(span);
    if text.is_empty() {
        return None;
    }
    Some(
        ChatRequest::new(model, vec![Message::user(text)])
            .with_system(FLUSH_PROMPT)
            .with_max_tokens(1024),
    )
}

/// Parse a bullet-list response. `NONE` and non-bullet lines yield nothing.
pub fn parse_facts(response: &str) -> Vec<String> {
    if response.trim().eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    let mut facts: Vec<String> = Vec::new();
    for line in response.lines() {
        let line = line.trim();
        let Some(fact) = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "))
            .map(str::trim)
        else {
            continue;
        };
        if fact.is_empty() || fact.eq_ignore_ascii_case("none") {
            continue;
        }
        if !facts.iter().any(|f| f.eq_ignore_ascii_case(fact)) {
            facts.push(fact.to_string());
        }
        if facts.len() == MAX_FACTS {
            break;
        }
    }
    facts
}

/// Fact store that keeps everything in memory, keyed by user.
#[derive(Debug, Default)]
pub struct InMemoryFactStore {
    facts: Mutex<Vec<(String, String)>>,
}

impl InMemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn facts_for(&self, user: &str) -> Vec<String> {
        self.facts
            .lock()
            .map(|f| {
                f.iter()
                    .filter(|(u, _)| u == user)
                    .map(|(_, fact)| fact.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl FactStore for InMemoryFactStore {
    async fn save_facts(&self, user: &str, facts: Vec<String>) -> Result<()> {
        let mut store = self
            .facts
            .lock()
            .map_err(|_| crate::Error::Store("fact store lock poisoned".into()))?;
        for fact in facts {
            if !store.iter().any(|(u, f)| u == user && *f == fact) {
                store.push((user.to_string(), fact));
            }
        }
        Ok(())
    }
}
