//! # kestrel
//!
//! Execution core for a local autonomous agent. A user message goes in; a
//! bounded sequence of model calls and tool invocations comes out as one
//! ordered stream of [`StreamEvent`]s.
//!
//! ## Architecture
//!
//! - **[`api`]**: one streaming contract ([`api::Provider`]) with an adapter
//!   per backend family: hosted Anthropic and OpenAI-compatible APIs, local
//!   Ollama inference, and autonomous CLI subprocesses. Rate-limit headers
//!   and error classification live here too.
//! - **[`context`]**: keeps each request inside the token budget. Token
//!   estimation, two-stage pruning, micro-compaction of large tool results,
//!   image stripping and file re-injection after compaction.
//! - **[`routing`]**: task classification, routing tables with fallback
//!   chains, exponential-backoff cooldowns and fuzzy model-name resolution.
//! - **[`steering`]**: stateless generators that inject ephemeral guidance
//!   messages into the outbound request.
//! - **[`agent`]**: the [`agent::Runner`] loop plus the interfaces to its
//!   external collaborators (conversation store, tool registry, fact store,
//!   usage tracker).
//! - **[`dedupe`]**: TTL + LRU duplicate suppression.
//!
//! ## Quick start
//!
//! ```ignore
//! use kestrel::prelude::*;
//!
//! let config = KestrelConfig::load("kestrel.toml")?;
//! let runner = Runner::builder(config)
//!     .with_store(Arc::new(InMemoryStore::new()))
//!     .with_tools(Arc::new(ToolSet::new()))
//!     .build()?;
//!
//! let mut events = runner.run(CancellationToken::new(), RunRequest::new("cli", "me", "hello"));
//! while let Some(event) = events.recv().await {
//!     if let StreamEvent::Text(t) = event { print!("{t}"); }
//! }
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod context;
pub mod dedupe;
pub mod error;
pub mod prelude;
pub mod routing;
pub mod steering;

use serde::{Deserialize, Serialize};

pub use api::streaming::StreamEvent;
pub use error::{Error, Result};

// ── Messages ───────────────────────────────────────────────────────

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique within the turn that produced it.
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// The outcome of a [`ToolCall`], paired with it by `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// One entry of a conversation.
///
/// Assistant messages may carry `tool_calls`; tool-role messages carry the
/// matching `tool_results`. Ordering within a conversation is significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            session_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// An assistant turn that requests tool calls (optionally with text).
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    /// A tool-role message carrying one or more results.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            tool_results: results,
            ..Self::with_role(Role::Tool, "")
        }
    }

    /// Attach the owning session id.
    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Whether this message has nothing worth sending.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.tool_calls.is_empty() && self.tool_results.is_empty()
    }
}

// ── Requests ───────────────────────────────────────────────────────

/// A tool the model may call, described by a JSON Schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A provider-neutral chat request. Adapters translate it into their vendor
/// schema at the boundary.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Model id as the backend knows it (without the provider prefix).
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: 4096,
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Token counts reported by a backend for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serialization_skips_empty_collections() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("session_id").is_none());
    }

    #[test]
    fn tool_result_message_round_trips_error_flag() {
        let msg = Message::tool_results(vec![ToolResult::error("c1", "boom")]);
        let text = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert!(back.tool_results[0].is_error);
        assert_eq!(back.role, Role::Tool);
    }

    #[test]
    fn empty_message_detection() {
        assert!(Message::assistant("  ").is_empty());
        assert!(!Message::assistant_tool_calls("", vec![ToolCall::new("a", "b", serde_json::json!({}))]).is_empty());
    }
}
