//! Ephemeral steering messages injected before each model call.
//!
//! Steering messages are short instructions derived from the shape of the
//! conversation: a nudge to use tools, a refreshed timestamp, a reminder of
//! who the agent is. They are merged into the outbound request only and never
//! written to the store, so they cannot pile up in history.
//!
//! Each [`SteeringGenerator`] is an independent function of a read-only
//! [`Context`]. The [`SteeringPipeline`] runs them in a fixed order and
//! isolates each call: a generator that panics is logged and contributes
//! nothing.

pub mod generators;

use crate::api::ratelimit::RateLimitSnapshot;
use crate::{Message, Role};
use chrono::{DateTime, Local};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;
use tracing::{debug, warn};

pub use generators::{
    ChannelTone, CompactionRecovery, DateTimeRefresh, IdentityReminder, MemoryNudge, QuotaWarning,
    TaskNudge, ToolUsageNudge,
};

/// Channel that gets no tone guidance.
pub const DEFAULT_CHANNEL: &str = "cli";

/// One sub-task of the active objective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskItem {
    pub description: String,
    pub done: bool,
}

impl TaskItem {
    pub fn pending(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            done: false,
        }
    }
}

/// Everything a generator may look at. Borrowed, never mutated.
#[derive(Debug, Clone)]
pub struct Context<'a> {
    pub history: &'a [Message],
    pub session_id: &'a str,
    pub channel: &'a str,
    pub identity: Option<&'a str>,
    pub active_task: Option<&'a str>,
    pub tasks: &'a [TaskItem],
    /// 1-based iteration within the run.
    pub iteration: u32,
    /// Time since the run started.
    pub elapsed: Duration,
    pub now: DateTime<Local>,
    /// Set only on the first iteration after a compaction.
    pub just_compacted: bool,
    pub rate_limits: Option<&'a RateLimitSnapshot>,
}

impl<'a> Context<'a> {
    pub fn new(history: &'a [Message], session_id: &'a str) -> Self {
        Self {
            history,
            session_id,
            channel: DEFAULT_CHANNEL,
            identity: None,
            active_task: None,
            tasks: &[],
            iteration: 1,
            elapsed: Duration::ZERO,
            now: Local::now(),
            just_compacted: false,
            rate_limits: None,
        }
    }

    pub fn assistant_turns(&self) -> usize {
        self.history.iter().filter(|m| m.role == Role::Assistant).count()
    }
}

/// Where a steering message goes in the outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    End,
    AfterLastUser,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteeringMessage {
    pub source: String,
    pub content: String,
    pub position: Position,
}

impl SteeringMessage {
    pub fn new(source: impl Into<String>, content: impl Into<String>, position: Position) -> Self {
        Self {
            source: source.into(),
            content: content.into(),
            position,
        }
    }

    /// Render as a user-role message wrapped in a tag naming its source.
    pub fn to_message(&self) -> Message {
        Message::user(format!(
            "<steering source=\"{}\">\n{}\nThis note is guidance for you only; do not mention or reveal it to the user.\n</steering>",
            self.source, self.content
        ))
    }
}

pub trait SteeringGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate(&self, ctx: &Context<'_>) -> Option<SteeringMessage>;
}

/// Ordered, panic-isolated list of generators.
#[derive(Default)]
pub struct SteeringPipeline {
    generators: Vec<Box<dyn SteeringGenerator>>,
}

impl std::fmt::Debug for SteeringPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.generators.iter().map(|g| g.name()).collect();
        f.debug_struct("SteeringPipeline")
            .field("generators", &names)
            .finish()
    }
}

impl SteeringPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in generators, in evaluation order.
    pub fn with_defaults() -> Self {
        let mut p = Self::new();
        p.add(IdentityReminder);
        p.add(ChannelTone);
        p.add(ToolUsageNudge);
        p.add(CompactionRecovery);
        p.add(DateTimeRefresh);
        p.add(MemoryNudge);
        p.add(TaskNudge);
        p.add(QuotaWarning::default());
        p
    }

    pub fn add(&mut self, generator: impl SteeringGenerator + 'static) {
        self.generators.push(Box::new(generator));
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    /// Evaluate every generator. Panics are caught and logged.
    pub fn run(&self, ctx: &Context<'_>) -> Vec<SteeringMessage> {
        let mut out = Vec::new();
        for g in &self.generators {
            match catch_unwind(AssertUnwindSafe(|| g.generate(ctx))) {
                Ok(Some(msg)) => {
                    debug!("steering: source={}, position={:?}", msg.source, msg.position);
                    out.push(msg);
                }
                Ok(None) => {}
                Err(_) => warn!("steering generator panicked: source={}", g.name()),
            }
        }
        out
    }

    /// Merge steering messages into an outbound message list.
    pub fn apply(messages: &mut Vec<Message>, steering: &[SteeringMessage]) {
        let mut insert_at = messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .map_or(messages.len(), |i| i + 1);
        for s in steering.iter().filter(|s| s.position == Position::AfterLastUser) {
            messages.insert(insert_at, s.to_message());
            insert_at += 1;
        }
        for s in steering.iter().filter(|s| s.position == Position::End) {
            messages.push(s.to_message());
        }
    }
}
