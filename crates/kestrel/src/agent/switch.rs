//! Explicit model-switch requests in user messages.
//!
//! Only short imperative messages count ("switch to opus", "use the local
//! one", "/model haiku"). The named model is resolved through the
//! [`FuzzyMatcher`]; a phrase that resolves to nothing is not a switch.

use crate::config::ModelRef;
use crate::routing::FuzzyMatcher;
use crate::{Message, Role};
use regex::Regex;
use std::sync::LazyLock;

/// Longer messages are treated as ordinary requests.
const MAX_SWITCH_CHARS: usize = 80;

static SWITCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)^\s*
        (?:hey\s*,?\s*)?(?:please\s+|can\s+you\s+|could\s+you\s+)?
        (?:
            /model\s+(?P<slash>.+?)
          | (?:switch|change|swap)\s+(?:the\s+model\s+|models?\s+)?(?:over\s+)?to\s+(?:model\s+)?(?P<switch>.+?)
          | (?:use|try)\s+(?:model\s+)?(?P<use>.+?)(?:\s+(?:model|instead|from\s+now\s+on|for\s+now))*
        )
        \s*(?:please|pls)?\s*[.!?]*\s*$",
    )
    .expect("switch regex should compile")
});

/// A resolved switch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSwitch {
    /// The words the user used for the model.
    pub phrase: String,
    pub target: ModelRef,
}

/// Extract the model phrase from a switch request, without resolving it.
pub fn switch_phrase(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() || text.chars().count() > MAX_SWITCH_CHARS || text.contains('\n') {
        return None;
    }
    let caps = SWITCH_RE.captures(text)?;
    let phrase = caps
        .name("slash")
        .or_else(|| caps.name("switch"))
        .or_else(|| caps.name("use"))?
        .as_str()
        .trim();
    (!phrase.is_empty()).then(|| phrase.to_string())
}

/// Detect a switch request in the last user message.
pub fn detect_switch(history: &[Message], matcher: &FuzzyMatcher) -> Option<ModelSwitch> {
    let last = history.iter().rev().find(|m| m.role == Role::User)?;
    let phrase = switch_phrase(&last.content)?;
    let found = matcher.find(&phrase)?;
    Some(ModelSwitch {
        phrase,
        target: found.target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KestrelConfig;

    const CONFIG: &str = r#"
[[providers]]
id = "anthropic"
kind = "anthropic"
api_key = "k"
default_model = "claude-sonnet-4-5"

[[providers.models]]
id = "claude-sonnet-4-5"

[[providers.models]]
id = "claude-opus-4-1"

[[providers]]
id = "ollama"
kind = "ollama"
default_model = "qwen2.5-coder:7b"

[[providers.models]]
id = "qwen2.5-coder:7b"
"#;

    fn matcher() -> FuzzyMatcher {
        FuzzyMatcher::from_config(&KestrelConfig::from_toml_str(CONFIG).unwrap())
    }

    #[test]
    fn phrases() {
        assert_eq!(switch_phrase("switch to opus").as_deref(), Some("opus"));
        assert_eq!(switch_phrase("Please change the model to sonnet!").as_deref(), Some("sonnet"));
        assert_eq!(switch_phrase("/model haiku").as_deref(), Some("haiku"));
        assert_eq!(switch_phrase("use the local one instead").as_deref(), Some("the local one"));
        assert_eq!(switch_phrase("what time is it?"), None);
        assert_eq!(switch_phrase("switch to opus\nand then summarize the report"), None);
    }

    #[test]
    fn resolves_through_matcher() {
        let m = matcher();
        let history = vec![Message::assistant("hi"), Message::user("switch to opus")];
        let s = detect_switch(&history, &m).unwrap();
        assert_eq!(s.target.to_string(), "anthropic/claude-opus-4-1");
        assert_eq!(s.phrase, "opus");

        let local = vec![Message::user("use the local one")];
        assert_eq!(
            detect_switch(&local, &m).unwrap().target.to_string(),
            "ollama/qwen2.5-coder:7b"
        );
    }

    #[test]
    fn unresolvable_phrase_is_not_a_switch() {
        let m = matcher();
        assert!(detect_switch(&[Message::user("use a spreadsheet")], &m).is_none());
        assert!(detect_switch(&[Message::assistant("switch to opus")], &m).is_none());
    }
}
