//! The agentic loop and the interfaces to its collaborators.
//!
//! - [`runner`]: [`Runner`], which turns one user message into a bounded
//!   sequence of model calls and tool executions.
//! - [`store`]: the [`ConversationStore`] interface plus [`InMemoryStore`].
//! - [`tools`]: the [`ToolRegistry`] interface plus the closure-backed
//!   [`ToolSet`].
//! - [`memory`]: durable-fact extraction and the [`FactStore`] sink.
//! - [`usage`]: optional per-profile usage and cooldown accounting.
//! - [`prompt`]: system prompt assembly.
//! - [`switch`]: detection of "switch to X" requests.

pub mod config;
pub mod memory;
pub mod prompt;
pub mod runner;
pub mod store;
pub mod switch;
pub mod tools;
pub mod usage;

pub use config::RunnerConfig;
pub use memory::{FactStore, InMemoryFactStore};
pub use runner::{RunRequest, Runner, RunnerBuilder};
pub use store::{ConversationStore, InMemoryStore, Session};
pub use tools::{FnTool, Tool, ToolOutput, ToolRegistry, ToolSet};
pub use usage::{InMemoryUsageTracker, UsageTracker};
