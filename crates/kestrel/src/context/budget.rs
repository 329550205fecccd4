//! Token estimation and budget thresholds.
//!
//! Estimates are character based: 4 characters per token over each
//! message's content plus its serialized tool calls and tool results. Cheap,
//! deterministic, and conservative enough for pruning decisions.

use crate::Message;

/// Characters per token used for every estimate.
pub const CHARS_PER_TOKEN: f64 = 4.0;

/// Default context window when a model declares none.
pub const DEFAULT_CONTEXT_TOKENS: usize = 200_000;

/// Estimate tokens for a string.
pub fn estimate_text(text: &str) -> usize {
    (text.len() as f64 / CHARS_PER_TOKEN).ceil() as usize
}

/// Estimate tokens for one message.
pub fn estimate_message(message: &Message) -> usize {
    let mut chars = message.content.len();
    if !message.tool_calls.is_empty() {
        chars += serde_json::to_string(&message.tool_calls).map_or(0, |s| s.len());
    }
    if !message.tool_results.is_empty() {
        chars += serde_json::to_string(&message.tool_results).map_or(0, |s| s.len());
    }
    (chars as f64 / CHARS_PER_TOKEN).ceil() as usize
}

/// Estimate tokens for a message list.
pub fn estimate_messages(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message).sum()
}

/// Thresholds for one model's context window.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    /// Usable context window in tokens.
    pub max_tokens: usize,
    /// Tokens reserved for the response.
    pub output_reserve: usize,
    /// Fraction at which micro-compaction switches to its higher floor.
    pub warning_ratio: f64,
    /// Fraction above which the runner flushes memory and compacts.
    pub hard_ratio: f64,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_CONTEXT_TOKENS,
            output_reserve: 4096,
            warning_ratio: 0.6,
            hard_ratio: 0.85,
        }
    }
}

impl ContextBudget {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            ..Default::default()
        }
    }

    pub fn with_output_reserve(mut self, tokens: usize) -> Self {
        self.output_reserve = tokens;
        self
    }

    /// Tokens available to the prompt.
    pub fn available(&self) -> usize {
        self.max_tokens.saturating_sub(self.output_reserve)
    }

    pub fn warning_tokens(&self) -> usize {
        (self.available() as f64 * self.warning_ratio) as usize
    }

    pub fn hard_limit_tokens(&self) -> usize {
        (self.available() as f64 * self.hard_ratio) as usize
    }

    pub fn is_over_hard_limit(&self, messages: &[Message]) -> bool {
        estimate_messages(messages) > self.hard_limit_tokens()
    }

    /// Usage as a fraction of the available budget.
    pub fn usage_pct(&self, messages: &[Message]) -> f64 {
        let available = self.available().max(1);
        estimate_messages(messages) as f64 / available as f64
    }
}
