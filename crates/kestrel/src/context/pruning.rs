//! Two-stage pruning of old tool results.
//!
//! Tool results are the largest context consumer in an agent loop and are
//! mostly irrelevant once the model has acted on them. Pruning rewrites them
//! on the in-memory copy of the conversation, without any LLM call:
//!
//! 1. **Soft trim** (estimate above `soft_ratio × budget`): long results keep
//!    their head and tail around an elision marker.
//! 2. **Hard clear** (still above `hard_ratio × budget`): results become a
//!    one-line label plus a placeholder.
//!
//! Both stages label what was pruned with a summary of the originating call
//! and whether it succeeded, and both leave `is_error` untouched. Everything
//! from the Nth-from-last assistant message onward is protected.

use crate::context::budget::estimate_messages;
use crate::{Message, Role, ToolCall};
use std::collections::HashMap;
use tracing::debug;

/// Placeholder for hard-cleared results.
pub const CLEARED_PLACEHOLDER: &str = "[Old tool result content cleared]";

/// Argument keys rendered into call summaries, in order.
pub const SUMMARY_KEYS: &[&str] = &[
    "action", "url", "profile", "resource", "path", "command", "query",
];

const SUMMARY_VALUE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone)]
pub struct PruningConfig {
    /// Assistant messages (counted from the end) whose span is protected.
    pub keep_last_assistants: usize,
    pub soft_ratio: f64,
    pub hard_ratio: f64,
    /// Results longer than this (chars) are soft-trimmed.
    pub soft_trim_max_chars: usize,
    pub soft_trim_head_chars: usize,
    pub soft_trim_tail_chars: usize,
    /// Results longer than this (chars) are hard-cleared.
    pub hard_clear_min_chars: usize,
    pub hard_clear_placeholder: String,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            keep_last_assistants: 3,
            soft_ratio: 0.3,
            hard_ratio: 0.5,
            soft_trim_max_chars: 4_000,
            soft_trim_head_chars: 1_500,
            soft_trim_tail_chars: 1_500,
            hard_clear_min_chars: 256,
            hard_clear_placeholder: CLEARED_PLACEHOLDER.to_string(),
        }
    }
}

impl PruningConfig {
    pub fn with_keep_last_assistants(mut self, n: usize) -> Self {
        self.keep_last_assistants = n;
        self
    }

    pub fn with_ratios(mut self, soft: f64, hard: f64) -> Self {
        self.soft_ratio = soft;
        self.hard_ratio = hard;
        self
    }
}

/// What a pruning pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub soft_trimmed: usize,
    pub hard_cleared: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Index where the protected region starts: the Nth-from-last assistant
/// message. With fewer than N assistant messages the whole conversation is
/// protected; with N = 0 nothing is.
pub fn protected_start(messages: &[Message], keep_last_assistants: usize) -> usize {
    if keep_last_assistants == 0 {
        return messages.len();
    }
    let mut seen = 0;
    for (i, m) in messages.iter().enumerate().rev() {
        if m.role == Role::Assistant {
            seen += 1;
            if seen == keep_last_assistants {
                return i;
            }
        }
    }
    0
}

/// Render `name(key: value, ...)` from recognized argument keys, or the bare
/// tool name when none are present.
pub fn summarize_tool_call(call: &ToolCall) -> String {
    let Some(obj) = call.input.as_object() else {
        return call.name.clone();
    };
    let parts: Vec<String> = SUMMARY_KEYS
        .iter()
        .filter_map(|k| {
            let v = obj.get(*k)?;
            let text = match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => return None,
                other => other.to_string(),
            };
            Some(format!("{k}: {}", truncate_chars(&text, SUMMARY_VALUE_MAX_CHARS)))
        })
        .collect();
    if parts.is_empty() {
        call.name.clone()
    } else {
        format!("{}({})", call.name, parts.join(", "))
    }
}

/// Index every assistant tool call by id.
pub fn index_tool_calls(messages: &[Message]) -> HashMap<String, ToolCall> {
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter())
        .map(|c| (c.id.clone(), c.clone()))
        .collect()
}

fn status_word(is_error: bool) -> &'static str {
    if is_error { "failed" } else { "succeeded" }
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Prune unprotected tool results until the estimate fits under the
/// configured ratios of `budget_tokens`.
pub fn prune(messages: &mut [Message], budget_tokens: usize, config: &PruningConfig) -> PruneReport {
    let tokens_before = estimate_messages(messages);
    let mut report = PruneReport {
        tokens_before,
        tokens_after: tokens_before,
        ..Default::default()
    };
    let soft_limit = (budget_tokens as f64 * config.soft_ratio) as usize;
    if tokens_before <= soft_limit {
        return report;
    }

    let start = protected_start(messages, config.keep_last_assistants);
    let calls = index_tool_calls(messages);
    let label = |id: &str, is_error: bool| {
        let summary = calls
            .get(id)
            .map(summarize_tool_call)
            .unwrap_or_else(|| "tool".to_string());
        format!("[{summary} — {}]", status_word(is_error))
    };

    // ── Stage 1: soft trim ──
    for m in messages.iter_mut().take(start).filter(|m| m.role == Role::Tool) {
        for r in &mut m.tool_results {
            let len = r.content.chars().count();
            if len <= config.soft_trim_max_chars {
                continue;
            }
            let head: String = r.content.chars().take(config.soft_trim_head_chars).collect();
            let tail: String = r
                .content
                .chars()
                .skip(len.saturating_sub(config.soft_trim_tail_chars))
                .collect();
            r.content = format!(
                "{}\n{head}\n...\n{tail}",
                label(&r.tool_call_id, r.is_error)
            );
            report.soft_trimmed += 1;
        }
    }

    let hard_limit = (budget_tokens as f64 * config.hard_ratio) as usize;
    if estimate_messages(messages) > hard_limit {
        // ── Stage 2: hard clear ──
        for m in messages.iter_mut().take(start).filter(|m| m.role == Role::Tool) {
            for r in &mut m.tool_results {
                if r.content.chars().count() <= config.hard_clear_min_chars
                    || r.content.ends_with(&config.hard_clear_placeholder)
                {
                    continue;
                }
                r.content = format!(
                    "{}\n{}",
                    label(&r.tool_call_id, r.is_error),
                    config.hard_clear_placeholder
                );
                report.hard_cleared += 1;
            }
        }
    }

    report.tokens_after = estimate_messages(messages);
    if report.soft_trimmed + report.hard_cleared > 0 {
        debug!(
            "pruned tool results: soft={}, hard={}, tokens {} -> {}",
            report.soft_trimmed, report.hard_cleared, report.tokens_before, report.tokens_after
        );
    }
    report
}
