//! Compaction summaries.
//!
//! The runner asks the cheapest model to fold the compacted span into the
//! running session summary. When no model answers, [`fallback_summary`]
//! produces a deterministic one so compaction never blocks on the network.

use crate::context::pruning::{summarize_tool_call, truncate_chars};
use crate::{Message, Role};
use std::fmt::Write as _;

const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation messages concisely. Focus on:
- What was accomplished (completed subtasks, files modified)
- Key findings and decisions made
- Failed approaches (what was tried and why it failed)
- File paths and function names mentioned
- Current plan state and what remains to be done

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve file paths, function names, and error messages verbatim.
- Be concise. Every token must earn its place.
- If there is an existing summary, merge the new information into it to produce a single \
  cohesive summary. Integrate, deduplicate, and update rather than append. The result \
  must be a standalone summary that replaces the existing one entirely.";

/// Per-message cap when rendering a span for the summarizer.
const SPAN_MESSAGE_MAX_CHARS: usize = 4_000;
const FALLBACK_LINE_MAX_CHARS: usize = 160;
const FALLBACK_MAX_LINES: usize = 40;

/// Build the `(system, user)` pair for a one-shot summarization call.
pub fn build_summarization_request(span: &[Message], existing: Option<&str>) -> (String, String) {
    let mut content = String::new();
    if let Some(existing) = existing.filter(|s| !s.trim().is_empty()) {
        content.push_str("=== EXISTING SUMMARY ===\n");
        content.push_str(existing);
        content.push_str("\n\n=== NEW MESSAGES TO SUMMARIZE ===\n");
    }
    for msg in span {
        let _ = write!(content, "[{}]: ", msg.role);
        if !msg.content.is_empty() {
            content.push_str(&truncate_chars(&msg.content, SPAN_MESSAGE_MAX_CHARS));
        }
        for call in &msg.tool_calls {
            let _ = write!(content, "\n  -> {}", summarize_tool_call(call));
        }
        for r in &msg.tool_results {
            let status = if r.is_error { "error" } else { "ok" };
            let _ = write!(
                content,
                "\n  <- [{status}] {}",
                truncate_chars(&r.content, SPAN_MESSAGE_MAX_CHARS)
            );
        }
        content.push_str("\n\n");
    }
    (SUMMARIZATION_PROMPT.to_string(), content)
}

/// Deterministic summary: the existing summary followed by one line per user
/// request, assistant reply and tool call in the span.
pub fn fallback_summary(span: &[Message], existing: Option<&str>) -> String {
    let mut lines: Vec<String> = Vec::new();
    for msg in span {
        match msg.role {
            Role::User if !msg.content.trim().is_empty() => lines.push(format!(
                "- user asked: {}",
                one_line(&msg.content)
            )),
            Role::Assistant => {
                if !msg.content.trim().is_empty() {
                    lines.push(format!("- assistant: {}", one_line(&msg.content)));
                }
                for call in &msg.tool_calls {
                    lines.push(format!("- called {}", summarize_tool_call(call)));
                }
            }
            _ => {}
        }
    }
    if lines.len() > FALLBACK_MAX_LINES {
        let skip = lines.len() - FALLBACK_MAX_LINES;
        lines.drain(..skip);
        lines.insert(0, format!("- ({skip} earlier entries omitted)"));
    }

    let mut out = String::new();
    if let Some(existing) = existing.filter(|s| !s.trim().is_empty()) {
        out.push_str(existing.trim_end());
        out.push_str("\n\n");
    }
    out.push_str("Earlier in this conversation:\n");
    out.push_str(&lines.join("\n"));
    out
}

fn one_line(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&flat, FALLBACK_LINE_MAX_CHARS)
}
