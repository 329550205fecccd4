//! Convenience re-exports for embedding the runner.
//!
//! ```ignore
//! use kestrel::prelude::*;
//! ```
//!
//! Covers configuration, the runner and its collaborators, and the message
//! types. Context-management and routing internals are left to their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    ChatRequest, Error, Message, Result, Role, StreamEvent, ToolCall, ToolDefinition, ToolResult,
    Usage,
};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::config::{KestrelConfig, ModelRef};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::tools::json_schema_for;
pub use crate::agent::{
    ConversationStore, FactStore, FnTool, InMemoryFactStore, InMemoryStore, InMemoryUsageTracker,
    RunRequest, Runner, RunnerConfig, Tool, ToolOutput, ToolRegistry, ToolSet, UsageTracker,
};

// ── Providers ───────────────────────────────────────────────────────
pub use crate::api::Providers;
pub use crate::api::provider::Provider;

pub use std::sync::Arc;
pub use tokio_util::sync::CancellationToken;
