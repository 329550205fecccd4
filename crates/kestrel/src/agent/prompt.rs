//! System prompt assembly.
//!
//! The prompt is a static prefix (identity, tool guidance, channel) followed
//! by a dynamic suffix that changes every turn (current time, active
//! objective, compaction summary). Keeping the volatile parts last keeps the
//! prefix stable across turns for backends that cache prompt prefixes.

use chrono::{DateTime, Local};

/// Builder for multi-section system prompts.
///
/// Sections are joined with blank lines. Empty sections are skipped.
///
/// ```
/// use kestrel::agent::prompt::SystemPromptBuilder;
///
/// let prompt = SystemPromptBuilder::new("You are helpful.")
///     .section("Context", "Today is Monday.")
///     .section_opt("Missing", None::<String>)
///     .build();
///
/// assert!(prompt.contains("## Context"));
/// assert!(!prompt.contains("## Missing"));
/// ```
#[derive(Debug, Clone)]
pub struct SystemPromptBuilder {
    sections: Vec<String>,
}

impl SystemPromptBuilder {
    pub fn new(preamble: impl Into<String>) -> Self {
        let preamble = preamble.into();
        Self {
            sections: if preamble.trim().is_empty() {
                Vec::new()
            } else {
                vec![preamble]
            },
        }
    }

    /// Append a `## heading` section. Skipped if `content` is empty.
    pub fn section(mut self, heading: &str, content: impl Into<String>) -> Self {
        let content = content.into();
        if !content.trim().is_empty() {
            self.sections.push(format!("## {heading}\n\n{content}"));
        }
        self
    }

    pub fn section_opt(self, heading: &str, content: Option<impl Into<String>>) -> Self {
        match content {
            Some(c) => self.section(heading, c),
            None => self,
        }
    }

    pub fn section_if(self, condition: bool, heading: &str, content_fn: impl FnOnce() -> String) -> Self {
        if condition {
            self.section(heading, content_fn())
        } else {
            self
        }
    }

    pub fn build(self) -> String {
        self.sections.join("\n\n")
    }
}

const TOOL_GUIDANCE: &str = "\
- Use tools to act instead of describing what you would do.
- Read before you write; check results before reporting success.
- When a tool fails, read the error and adjust instead of repeating the same call.
- Keep the user informed with short status notes during long tasks.";

/// Inputs for one turn's system prompt.
#[derive(Debug, Clone)]
pub struct PromptParts<'a> {
    pub identity: &'a str,
    pub channel: &'a str,
    pub has_tools: bool,
    pub now: DateTime<Local>,
    pub active_task: Option<&'a str>,
    pub summary: Option<&'a str>,
}

/// Assemble the system prompt: static sections first, dynamic suffix last.
pub fn build_system_prompt(parts: &PromptParts<'_>) -> String {
    SystemPromptBuilder::new(parts.identity)
        .section_if(parts.has_tools, "Tools", || TOOL_GUIDANCE.to_string())
        .section("Channel", format!("You are talking to the user over `{}`.", parts.channel))
        .section(
            "Current Time",
            parts.now.format("%A, %Y-%m-%d %H:%M %Z").to_string(),
        )
        .section_opt("Active Objective", parts.active_task)
        .section_opt("Conversation Summary", parts.summary)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts<'a>() -> PromptParts<'a> {
        PromptParts {
            identity: "You are a test agent.",
            channel: "cli",
            has_tools: true,
            now: Local::now(),
            active_task: None,
            summary: None,
        }
    }

    #[test]
    fn static_sections_precede_dynamic_suffix() {
        let p = build_system_prompt(&PromptParts {
            active_task: Some("ship the release"),
            summary: Some("user wants a changelog"),
            ..parts()
        });
        assert!(p.starts_with("You are a test agent."));
        let tools = p.find("## Tools").unwrap();
        let time = p.find("## Current Time").unwrap();
        let task = p.find("## Active Objective").unwrap();
        let summary = p.find("## Conversation Summary").unwrap();
        assert!(tools < time && time < task && task < summary);
    }

    #[test]
    fn optional_sections_are_skipped() {
        let p = build_system_prompt(&PromptParts {
            has_tools: false,
            ..parts()
        });
        assert!(!p.contains("## Tools"));
        assert!(!p.contains("## Active Objective"));
        assert!(!p.contains("## Conversation Summary"));
    }

    #[test]
    fn empty_preamble_is_dropped() {
        let p = SystemPromptBuilder::new("").section("A", "x").build();
        assert_eq!(p, "## A\n\nx");
    }
}
