//! Recently-touched file tracking and post-compaction re-injection.
//!
//! Compaction replaces old turns with a summary, so the model loses the
//! contents of files it was working on. [`FileAccessTracker`] records file
//! paths from tool call arguments; after compaction the most recent ones are
//! re-read from disk and re-injected as one synthetic user message.

use crate::{Message, Role};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Limits for the re-injection message.
#[derive(Debug, Clone)]
pub struct ReinjectionConfig {
    pub max_files: usize,
    pub max_chars_per_file: usize,
    pub max_total_chars: usize,
    /// Relative paths resolve against this directory.
    pub root: Option<PathBuf>,
}

impl Default for ReinjectionConfig {
    fn default() -> Self {
        Self {
            max_files: 5,
            max_chars_per_file: 8_000,
            max_total_chars: 30_000,
            root: None,
        }
    }
}

impl ReinjectionConfig {
    pub fn with_max_files(mut self, n: usize) -> Self {
        self.max_files = n;
        self
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }
}

/// The kind of file access recorded by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccessType {
    Read,
    Write,
}

impl std::fmt::Display for FileAccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileAccessType::Read => write!(f, "read"),
            FileAccessType::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Clone)]
struct FileAccess {
    path: String,
    iteration: usize,
    access_type: FileAccessType,
}

/// Most-recently-touched files, newest last, deduplicated by path.
#[derive(Debug, Clone)]
pub struct FileAccessTracker {
    recent: VecDeque<FileAccess>,
    capacity: usize,
}

impl Default for FileAccessTracker {
    fn default() -> Self {
        Self::new(16)
    }
}

impl FileAccessTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Rebuild the tracker from the tool calls in a conversation.
    pub fn from_history(messages: &[Message]) -> Self {
        let mut tracker = Self::default();
        let mut iteration = 0;
        for m in messages.iter().filter(|m| m.role == Role::Assistant) {
            iteration += 1;
            for call in &m.tool_calls {
                tracker.record_tool_access(&call.name, &call.input, iteration);
            }
        }
        tracker
    }

    /// Record a file access from a tool call. Unknown tools and arguments
    /// without a path are ignored. A repeated path moves to the newest slot.
    pub fn record_tool_access(&mut self, tool_name: &str, arguments: &Value, iteration: usize) {
        let access_type = match tool_name {
            "read_file" | "read" | "view_file" => FileAccessType::Read,
            "write_file" | "edit_file" | "create_file" => FileAccessType::Write,
            _ => return,
        };
        let Some(path) = extract_path(arguments) else {
            return;
        };

        self.recent.retain(|f| f.path != path);
        self.recent.push_back(FileAccess {
            path,
            iteration,
            access_type,
        });
        while self.recent.len() > self.capacity {
            self.recent.pop_front();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    /// Paths, newest first.
    pub fn recent_paths(&self) -> Vec<&str> {
        self.recent.iter().rev().map(|f| f.path.as_str()).collect()
    }

    /// Re-read the newest files and render them into one user message.
    /// Missing or unreadable files are skipped; returns `None` when nothing
    /// could be read.
    pub async fn build_reinjection(&self, config: &ReinjectionConfig) -> Option<Message> {
        let mut body = String::from(
            "Files you were working on before the conversation was compacted \
             (current contents, line-numbered):\n",
        );
        let header_len = body.len();
        let mut total = 0;
        let mut included = 0;

        for access in self.recent.iter().rev() {
            if included >= config.max_files || total >= config.max_total_chars {
                break;
            }
            let path = resolve(&access.path, config.root.as_deref());
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(t) => t,
                Err(e) => {
                    debug!("re-injection skipped {}: {e}", path.display());
                    continue;
                }
            };
            let budget = config
                .max_chars_per_file
                .min(config.max_total_chars - total);
            let numbered = number_lines(&text, budget);
            total += numbered.chars().count();
            included += 1;
            let _ = write!(
                body,
                "\n=== {} ({}, iteration {}) ===\n{numbered}",
                access.path, access.access_type, access.iteration
            );
        }

        if body.len() == header_len {
            return None;
        }
        debug!("re-injected {included} files ({total} chars)");
        Some(Message::user(body))
    }
}

fn resolve(path: &str, root: Option<&Path>) -> PathBuf {
    let p = Path::new(path);
    match root {
        Some(root) if p.is_relative() => root.join(p),
        _ => p.to_path_buf(),
    }
}

/// Prefix each line with its 1-based number, stopping at `max_chars`.
fn number_lines(text: &str, max_chars: usize) -> String {
    let mut out = String::new();
    let mut used = 0;
    for (i, line) in text.lines().enumerate() {
        let rendered = format!("{:>5}\t{line}\n", i + 1);
        let len = rendered.chars().count();
        if used + len > max_chars {
            out.push_str("[... truncated]\n");
            break;
        }
        used += len;
        out.push_str(&rendered);
    }
    out
}

fn extract_path(arguments: &Value) -> Option<String> {
    let obj = arguments.as_object()?;
    for key in ["path", "file_path", "file"] {
        if let Some(v) = obj.get(key).and_then(|v| v.as_str())
            && !v.is_empty()
        {
            return Some(v.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use serde_json::json;

    #[test]
    fn dedup_moves_to_newest() {
        let mut t = FileAccessTracker::new(5);
        t.record_tool_access("read_file", &json!({"path": "a.rs"}), 1);
        t.record_tool_access("read_file", &json!({"path": "b.rs"}), 2);
        t.record_tool_access("edit_file", &json!({"file_path": "a.rs"}), 3);
        assert_eq!(t.recent_paths(), vec!["a.rs", "b.rs"]);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut t = FileAccessTracker::new(2);
        for (i, p) in ["a", "b", "c"].iter().enumerate() {
            t.record_tool_access("read_file", &json!({"path": p}), i);
        }
        assert_eq!(t.recent_paths(), vec!["c", "b"]);
    }

    #[test]
    fn unknown_tools_and_pathless_args_ignored() {
        let mut t = FileAccessTracker::new(5);
        t.record_tool_access("shell", &json!({"path": "x"}), 1);
        t.record_tool_access("read_file", &json!({"other": 1}), 1);
        t.record_tool_access("read_file", &json!("a.rs"), 1);
        assert!(t.is_empty());
    }

    #[test]
    fn from_history_walks_tool_calls() {
        let msgs = vec![
            Message::user("go"),
            Message::assistant_tool_calls("", vec![ToolCall::new("1", "read_file", json!({"path": "x.rs"}))]),
            Message::assistant_tool_calls("", vec![ToolCall::new("2", "write_file", json!({"path": "y.rs"}))]),
        ];
        let t = FileAccessTracker::from_history(&msgs);
        assert_eq!(t.recent_paths(), vec!["y.rs", "x.rs"]);
    }

    #[test]
    fn number_lines_respects_cap() {
        assert_eq!(number_lines("a\nb", 100), "    1\ta\n    2\tb\n");
        let capped = number_lines(&"line\n".repeat(100), 30);
        assert!(capped.ends_with("[... truncated]\n"));
        assert!(capped.starts_with("    1\tline\n"));
    }

    #[tokio::test]
    async fn reinjection_reads_newest_files_with_caps() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["one.rs", "two.rs", "three.rs"] {
            std::fs::write(dir.path().join(name), format!("// {name}\nfn main() {{}}\n")).unwrap();
        }
        let mut t = FileAccessTracker::new(10);
        t.record_tool_access("read_file", &json!({"path": "one.rs"}), 1);
        t.record_tool_access("read_file", &json!({"path": "missing.rs"}), 2);
        t.record_tool_access("read_file", &json!({"path": "two.rs"}), 3);
        t.record_tool_access("write_file", &json!({"path": "three.rs"}), 4);

        let config = ReinjectionConfig::default().with_max_files(2).with_root(dir.path());
        let msg = t.build_reinjection(&config).await.unwrap();
        assert_eq!(msg.role, Role::User);
        assert!(msg.content.contains("=== three.rs (write, iteration 4) ==="));
        assert!(msg.content.contains("    1\t// two.rs"));
        assert!(!msg.content.contains("one.rs"));
    }

    #[tokio::test]
    async fn reinjection_none_when_nothing_readable() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = FileAccessTracker::new(4);
        t.record_tool_access("read_file", &json!({"path": "gone.rs"}), 1);
        let config = ReinjectionConfig::default().with_root(dir.path());
        assert!(t.build_reinjection(&config).await.is_none());
        assert!(FileAccessTracker::default().build_reinjection(&config).await.is_none());
    }
}
