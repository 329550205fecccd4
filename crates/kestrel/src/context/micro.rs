//! Continuous micro-compaction of large tool results.
//!
//! Runs every iteration, independent of pruning. Only results from
//! allow-listed tool families are candidates; the most recent results are
//! always kept. Over the warning threshold, candidates are trimmed in
//! priority order (file, then shell, then web, then other allow-listed tools;
//! oldest first within a family) until the estimate drops under it. Under the
//! threshold every candidate is planned, held back by a lower floor. If the
//! planned savings are below the floor the pass does nothing: small gains are
//! not worth disturbing the prompt cache.
//!
//! A trimmed result becomes `[trimmed: <summary> — ~N tokens]` and the input
//! of its originating call is replaced by a marker, so neither half keeps
//! the bulk.

use crate::context::budget::{estimate_messages, estimate_text};
use crate::context::pruning::{index_tool_calls, summarize_tool_call};
use crate::{Message, Role};
use std::collections::HashSet;
use tracing::debug;

/// Prefix of trimmed tool results.
pub const TRIMMED_PREFIX: &str = "[trimmed:";

/// Marker stored in place of a trimmed call's arguments.
pub const TRIMMED_INPUT_MARKER: &str = "[trimmed: arguments elided]";

/// Tool family, in trimming priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ToolCategory {
    File,
    Shell,
    Web,
    Other,
}

const FILE_TOOLS: &[&str] = &[
    "read_file", "write_file", "edit_file", "list_files", "find_files", "grep", "glob", "read",
    "list_directory",
];
const SHELL_TOOLS: &[&str] = &["shell", "bash", "exec", "run_command", "terminal"];
const WEB_TOOLS: &[&str] = &["web_fetch", "web_search", "fetch", "browse", "browser", "http_get"];

#[derive(Debug, Clone)]
pub struct MicroCompactConfig {
    /// Most recent tool results that are never trimmed.
    pub keep_recent: usize,
    /// Minimum savings (tokens) when the conversation is over the warning
    /// threshold.
    pub floor_over_warning: usize,
    /// Minimum savings (tokens) while under the warning threshold.
    pub floor_under_warning: usize,
    /// Warning threshold in tokens.
    pub warning_threshold_tokens: usize,
    /// Extra tool names allow-listed as [`ToolCategory::Other`].
    pub extra_tools: HashSet<String>,
}

impl Default for MicroCompactConfig {
    fn default() -> Self {
        Self {
            keep_recent: 3,
            floor_over_warning: 20_000,
            floor_under_warning: 5_000,
            warning_threshold_tokens: 120_000,
            extra_tools: ["search", "code_search", "screenshot"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl MicroCompactConfig {
    pub fn with_keep_recent(mut self, n: usize) -> Self {
        self.keep_recent = n;
        self
    }

    pub fn with_warning_threshold(mut self, tokens: usize) -> Self {
        self.warning_threshold_tokens = tokens;
        self
    }

    pub fn allow_tool(mut self, name: impl Into<String>) -> Self {
        self.extra_tools.insert(name.into());
        self
    }

    /// Category of an allow-listed tool, or `None` if it is not a candidate.
    pub fn categorize(&self, name: &str) -> Option<ToolCategory> {
        let lower = name.to_lowercase();
        if FILE_TOOLS.contains(&lower.as_str()) {
            Some(ToolCategory::File)
        } else if SHELL_TOOLS.contains(&lower.as_str()) {
            Some(ToolCategory::Shell)
        } else if WEB_TOOLS.contains(&lower.as_str()) {
            Some(ToolCategory::Web)
        } else if self.extra_tools.contains(name) {
            Some(ToolCategory::Other)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MicroReport {
    pub trimmed: usize,
    pub tokens_saved: usize,
}

struct Candidate {
    message: usize,
    result: usize,
    call_id: String,
    category: ToolCategory,
    replacement: String,
    savings: usize,
}

pub fn micro_compact(messages: &mut [Message], config: &MicroCompactConfig) -> MicroReport {
    let calls = index_tool_calls(messages);

    // Every tool result position, oldest first.
    let positions: Vec<(usize, usize)> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::Tool)
        .flat_map(|(i, m)| (0..m.tool_results.len()).map(move |j| (i, j)))
        .collect();
    let unprotected = positions.len().saturating_sub(config.keep_recent);

    let mut candidates: Vec<Candidate> = positions
        .into_iter()
        .take(unprotected)
        .filter_map(|(i, j)| {
            let r = &messages[i].tool_results[j];
            if r.content.starts_with(TRIMMED_PREFIX) {
                return None;
            }
            let call = calls.get(&r.tool_call_id)?;
            let category = config.categorize(&call.name)?;
            let tokens = estimate_text(&r.content);
            let replacement = format!("{TRIMMED_PREFIX} {} — ~{tokens} tokens]", summarize_tool_call(call));
            let savings = tokens.saturating_sub(estimate_text(&replacement));
            (savings > 0).then(|| Candidate {
                message: i,
                result: j,
                call_id: r.tool_call_id.clone(),
                category,
                replacement,
                savings,
            })
        })
        .collect();
    // Stable sort keeps age order within a category.
    candidates.sort_by_key(|c| c.category);

    let total = estimate_messages(messages);
    let over_warning = total > config.warning_threshold_tokens;
    let floor = if over_warning {
        config.floor_over_warning
    } else {
        config.floor_under_warning
    };

    let mut planned = Vec::new();
    let mut savings = 0;
    for c in candidates {
        if over_warning && total.saturating_sub(savings) <= config.warning_threshold_tokens {
            break;
        }
        savings += c.savings;
        planned.push(c);
    }
    if planned.is_empty() || savings < floor {
        debug!("micro-compaction skipped: savings={savings}, floor={floor}");
        return MicroReport::default();
    }

    let trimmed_ids: HashSet<String> = planned.iter().map(|c| c.call_id.clone()).collect();
    for c in &planned {
        messages[c.message].tool_results[c.result].content = c.replacement.clone();
    }
    for m in messages.iter_mut().filter(|m| m.role == Role::Assistant) {
        for call in &mut m.tool_calls {
            if trimmed_ids.contains(&call.id) {
                call.input = serde_json::json!({ "_trimmed": TRIMMED_INPUT_MARKER });
            }
        }
    }

    let report = MicroReport {
        trimmed: planned.len(),
        tokens_saved: total.saturating_sub(estimate_messages(messages)),
    };
    debug!(
        "micro-compaction: trimmed={}, tokens_saved={}",
        report.trimmed, report.tokens_saved
    );
    report
}
