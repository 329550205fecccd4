//! Built-in steering generators.

use super::{Context, DEFAULT_CHANNEL, Position, SteeringGenerator, SteeringMessage};
use crate::{Message, Role};
use regex::Regex;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

const IDENTITY_EVERY: usize = 8;
const TOOL_NUDGE_AFTER: usize = 5;
const DATETIME_AFTER: Duration = Duration::from_secs(30 * 60);
const DATETIME_EVERY: u32 = 5;
const MEMORY_NUDGE_AFTER: usize = 10;
const TASK_LIST_EVERY: u32 = 8;
const QUOTA_WARN_BELOW: f64 = 0.2;

/// Memory tools whose calls count as "memory written".
const MEMORY_WRITE_TOOLS: &[&str] = &["memory_write", "memory_store", "save_memory", "remember", "memory_save"];

static SELF_DISCLOSURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(my name is|call me|i am a|i'm a|i live in|i work (at|for|as)|i prefer|i'm allergic|i am allergic|my (wife|husband|partner|son|daughter|kids?|dog|cat|birthday|job|boss)\b)")
        .expect("self-disclosure regex should compile")
});

fn last_user_text<'a>(history: &'a [Message], n: usize) -> impl Iterator<Item = &'a str> {
    history
        .iter()
        .rev()
        .filter(|m| m.role == Role::User)
        .take(n)
        .map(|m| m.content.as_str())
}

// ── Identity ───────────────────────────────────────────────────────

/// Re-states who the agent is on every 8th assistant turn.
pub struct IdentityReminder;

impl SteeringGenerator for IdentityReminder {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn generate(&self, ctx: &Context<'_>) -> Option<SteeringMessage> {
        let turns = ctx.assistant_turns();
        if turns == 0 || !turns.is_multiple_of(IDENTITY_EVERY) {
            return None;
        }
        let who = ctx.identity.unwrap_or("a capable personal assistant");
        Some(SteeringMessage::new(
            self.name(),
            format!("Remember who you are: {who}. Stay in character and keep the same voice as earlier in the conversation."),
            Position::AfterLastUser,
        ))
    }
}

// ── Channel tone ───────────────────────────────────────────────────

/// Formatting guidance for the channel the reply goes to.
pub struct ChannelTone;

impl SteeringGenerator for ChannelTone {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn generate(&self, ctx: &Context<'_>) -> Option<SteeringMessage> {
        let channel = ctx.channel.to_lowercase();
        if channel.is_empty() || channel == DEFAULT_CHANNEL {
            return None;
        }
        let tone = match channel.as_str() {
            "telegram" | "whatsapp" | "signal" | "sms" | "imessage" => {
                "This conversation happens in a chat app. Keep replies short and conversational; avoid headings and tables."
                    .to_string()
            }
            "slack" | "discord" => {
                "This conversation happens in a team chat. Be concise; light markdown is fine, long tables are not."
                    .to_string()
            }
            "email" => "You are replying by email. Write complete paragraphs with a short greeting and sign-off."
                .to_string(),
            "voice" => "Your reply will be spoken aloud. Use plain sentences without markdown, lists or URLs."
                .to_string(),
            other => format!("You are replying via {other}. Format the reply for that medium."),
        };
        Some(SteeringMessage::new(self.name(), tone, Position::AfterLastUser))
    }
}

// ── Tool usage ─────────────────────────────────────────────────────

/// Nudges toward tools when an objective is active but the last several
/// assistant turns were text only.
pub struct ToolUsageNudge;

impl SteeringGenerator for ToolUsageNudge {
    fn name(&self) -> &'static str {
        "tools"
    }

    fn generate(&self, ctx: &Context<'_>) -> Option<SteeringMessage> {
        let task = ctx.active_task?;
        let text_only = ctx
            .history
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .take_while(|m| m.tool_calls.is_empty())
            .count();
        if text_only < TOOL_NUDGE_AFTER {
            return None;
        }
        Some(SteeringMessage::new(
            self.name(),
            format!(
                "You have replied {text_only} times without using a tool while working on \"{task}\". \
                 If the objective needs information or actions, call the relevant tool instead of describing what you would do."
            ),
            Position::End,
        ))
    }
}

// ── Compaction recovery ────────────────────────────────────────────

/// One-time note right after the conversation was compacted.
pub struct CompactionRecovery;

impl SteeringGenerator for CompactionRecovery {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn generate(&self, ctx: &Context<'_>) -> Option<SteeringMessage> {
        if !ctx.just_compacted {
            return None;
        }
        Some(SteeringMessage::new(
            self.name(),
            "Earlier messages were compacted into a summary. Rely on the summary and the re-attached files; \
             re-read anything else you need instead of guessing its contents.",
            Position::End,
        ))
    }
}

// ── Date/time ──────────────────────────────────────────────────────

/// Refreshes the clock on long runs: after 30 minutes, every 5th iteration.
pub struct DateTimeRefresh;

impl SteeringGenerator for DateTimeRefresh {
    fn name(&self) -> &'static str {
        "datetime"
    }

    fn generate(&self, ctx: &Context<'_>) -> Option<SteeringMessage> {
        if ctx.elapsed < DATETIME_AFTER || !ctx.iteration.is_multiple_of(DATETIME_EVERY) {
            return None;
        }
        Some(SteeringMessage::new(
            self.name(),
            format!(
                "Current date and time: {}.",
                ctx.now.format("%A %Y-%m-%d %H:%M %Z")
            ),
            Position::End,
        ))
    }
}

// ── Memory ─────────────────────────────────────────────────────────

/// Suggests saving personal facts when the user discloses them and memory
/// has not been written for a while.
pub struct MemoryNudge;

impl SteeringGenerator for MemoryNudge {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn generate(&self, ctx: &Context<'_>) -> Option<SteeringMessage> {
        let mut turns_since_write = 0;
        for m in ctx.history.iter().rev() {
            if m.role == Role::Assistant
                && m.tool_calls
                    .iter()
                    .any(|c| MEMORY_WRITE_TOOLS.contains(&c.name.as_str()))
            {
                break;
            }
            if m.role == Role::User {
                turns_since_write += 1;
            }
        }
        if turns_since_write < MEMORY_NUDGE_AFTER {
            return None;
        }
        if !last_user_text(ctx.history, 3).any(|t| SELF_DISCLOSURE_RE.is_match(t)) {
            return None;
        }
        Some(SteeringMessage::new(
            self.name(),
            "The user recently shared something about themselves. If it is a durable fact or preference, \
             save it to memory so it is available in future conversations.",
            Position::End,
        ))
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

/// Keeps the active objective and its sub-tasks in view.
pub struct TaskNudge;

impl SteeringGenerator for TaskNudge {
    fn name(&self) -> &'static str {
        "tasks"
    }

    fn generate(&self, ctx: &Context<'_>) -> Option<SteeringMessage> {
        let objective = ctx.active_task?;
        let pending: Vec<_> = ctx.tasks.iter().filter(|t| !t.done).collect();
        let mut parts: Vec<String> = Vec::new();

        if ctx.tasks.is_empty() {
            parts.push(format!(
                "Break the objective \"{objective}\" into concrete sub-tasks before continuing."
            ));
        }
        let last_text_only = ctx
            .history
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .is_some_and(|m| m.tool_calls.is_empty());
        if !pending.is_empty() && last_text_only {
            parts.push(format!(
                "{} sub-task(s) are still pending. Keep working on them rather than stopping at a text reply.",
                pending.len()
            ));
        }
        if !ctx.tasks.is_empty() && ctx.iteration.is_multiple_of(TASK_LIST_EVERY) {
            let mut list = format!("Objective: {objective}\n");
            for t in ctx.tasks {
                let mark = if t.done { "x" } else { " " };
                let _ = writeln!(list, "- [{mark}] {}", t.description);
            }
            parts.push(list.trim_end().to_string());
        }

        if parts.is_empty() {
            return None;
        }
        Some(SteeringMessage::new(self.name(), parts.join("\n\n"), Position::End))
    }
}

// ── Quota ──────────────────────────────────────────────────────────

/// Warns once per session when a provider quota window runs low.
#[derive(Debug, Default)]
pub struct QuotaWarning {
    warned: Mutex<HashSet<String>>,
}

impl QuotaWarning {
    /// Forget which sessions were warned.
    pub fn reset(&self) {
        if let Ok(mut w) = self.warned.lock() {
            w.clear();
        }
    }
}

impl SteeringGenerator for QuotaWarning {
    fn name(&self) -> &'static str {
        "quota"
    }

    fn generate(&self, ctx: &Context<'_>) -> Option<SteeringMessage> {
        let remaining = ctx.rate_limits?.min_remaining()?;
        if remaining >= QUOTA_WARN_BELOW {
            return None;
        }
        let mut warned = self.warned.lock().ok()?;
        if !warned.insert(ctx.session_id.to_string()) {
            return None;
        }
        Some(SteeringMessage::new(
            self.name(),
            format!(
                "Provider usage quota is running low (~{:.0}% left). Prefer fewer, more targeted tool calls and finish efficiently.",
                remaining * 100.0
            ),
            Position::End,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::api::ratelimit::{RateLimitSnapshot, RateWindow};
    use crate::steering::TaskItem;
    use serde_json::json;

    fn chat(turns: usize) -> Vec<Message> {
        let mut h = Vec::new();
        for i in 0..turns {
            h.push(Message::user(format!("q{i}")));
            h.push(Message::assistant(format!("a{i}")));
        }
        h
    }

    #[test]
    fn identity_every_eighth_turn() {
        let h = chat(8);
        assert!(IdentityReminder.generate(&Context::new(&h, "s")).is_some());
        let h = chat(7);
        assert!(IdentityReminder.generate(&Context::new(&h, "s")).is_none());
        assert!(IdentityReminder.generate(&Context::new(&[], "s")).is_none());
    }

    #[test]
    fn channel_tone_skips_default() {
        let h = chat(1);
        let mut ctx = Context::new(&h, "s");
        assert!(ChannelTone.generate(&ctx).is_none());
        ctx.channel = "telegram";
        let msg = ChannelTone.generate(&ctx).unwrap();
        assert_eq!(msg.position, Position::AfterLastUser);
        assert!(msg.content.contains("chat app"));
    }

    #[test]
    fn tool_nudge_needs_task_and_five_text_turns() {
        let h = chat(5);
        let mut ctx = Context::new(&h, "s");
        assert!(ToolUsageNudge.generate(&ctx).is_none());
        ctx.active_task = Some("book flights");
        assert!(ToolUsageNudge.generate(&ctx).is_some());

        let mut h = chat(4);
        h.push(Message::assistant_tool_calls("", vec![ToolCall::new("1", "search", json!({}))]));
        let mut ctx = Context::new(&h, "s");
        ctx.active_task = Some("book flights");
        assert!(ToolUsageNudge.generate(&ctx).is_none());
    }

    #[test]
    fn datetime_after_thirty_minutes_every_fifth() {
        let h = chat(1);
        let mut ctx = Context::new(&h, "s");
        ctx.iteration = 5;
        assert!(DateTimeRefresh.generate(&ctx).is_none());
        ctx.elapsed = Duration::from_secs(31 * 60);
        assert!(DateTimeRefresh.generate(&ctx).unwrap().content.starts_with("Current date and time:"));
        ctx.iteration = 6;
        assert!(DateTimeRefresh.generate(&ctx).is_none());
    }

    #[test]
    fn memory_nudge_on_disclosure_after_ten_turns() {
        let mut h = chat(10);
        h.push(Message::user("by the way my name is Sam"));
        assert!(MemoryNudge.generate(&Context::new(&h, "s")).is_some());

        let mut short = chat(2);
        short.push(Message::user("my name is Sam"));
        assert!(MemoryNudge.generate(&Context::new(&short, "s")).is_none());

        let mut no_disclosure = chat(10);
        no_disclosure.push(Message::user("what's the weather"));
        assert!(MemoryNudge.generate(&Context::new(&no_disclosure, "s")).is_none());

        let mut written = chat(10);
        written.push(Message::assistant_tool_calls(
            "",
            vec![ToolCall::new("m", "memory_write", json!({"fact": "x"}))],
        ));
        written.push(Message::user("my name is Sam"));
        assert!(MemoryNudge.generate(&Context::new(&written, "s")).is_none());
    }

    #[test]
    fn task_nudges() {
        let h = chat(1);
        let mut ctx = Context::new(&h, "s");
        assert!(TaskNudge.generate(&ctx).is_none());

        ctx.active_task = Some("plan trip");
        assert!(TaskNudge.generate(&ctx).unwrap().content.contains("Break the objective"));

        let tasks = vec![TaskItem::pending("flights"), TaskItem { description: "hotel".into(), done: true }];
        ctx.tasks = &tasks;
        let msg = TaskNudge.generate(&ctx).unwrap();
        assert!(msg.content.contains("1 sub-task(s) are still pending"));

        ctx.iteration = 8;
        let msg = TaskNudge.generate(&ctx).unwrap();
        assert!(msg.content.contains("- [ ] flights"));
        assert!(msg.content.contains("- [x] hotel"));
    }

    #[test]
    fn quota_warns_once_per_session() {
        let snapshot = RateLimitSnapshot {
            primary: Some(RateWindow { used_fraction: 0.9, resets_at: None }),
            secondary: Some(RateWindow { used_fraction: 0.1, resets_at: None }),
            captured_at: chrono::Utc::now(),
        };
        let q = QuotaWarning::default();
        let h = chat(1);
        let mut ctx = Context::new(&h, "s1");
        ctx.rate_limits = Some(&snapshot);
        assert!(q.generate(&ctx).is_some());
        assert!(q.generate(&ctx).is_none());
        ctx.session_id = "s2";
        assert!(q.generate(&ctx).is_some());
        q.reset();
        ctx.session_id = "s1";
        assert!(q.generate(&ctx).is_some());
    }

    #[test]
    fn quota_silent_with_headroom_or_no_data() {
        let snapshot = RateLimitSnapshot {
            primary: Some(RateWindow { used_fraction: 0.5, resets_at: None }),
            secondary: None,
            captured_at: chrono::Utc::now(),
        };
        let q = QuotaWarning::default();
        let h = chat(1);
        let mut ctx = Context::new(&h, "s");
        assert!(q.generate(&ctx).is_none());
        ctx.rate_limits = Some(&snapshot);
        assert!(q.generate(&ctx).is_none());
    }
}
