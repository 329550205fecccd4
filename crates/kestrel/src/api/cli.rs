//! Subprocess adapter for autonomous coding CLIs that speak a line-delimited
//! JSON event protocol (`--output-format stream-json`).
//!
//! The CLI runs its own tools, so [`Provider::handles_tools`] is true and the
//! tool calls and results it reports are relayed for display only. The
//! conversation is rendered into a transcript on stdin; each call is a fresh
//! process. Cancellation kills the child and closes its pipes before the
//! stream is closed.

use crate::api::provider::{Provider, filter_orphans, merged_system};
use crate::api::streaming::{self, EventSender, EventStream};
use crate::api::{LineDecoder, SseFlow};
use crate::{ChatRequest, Error, Result, Role, ToolCall, ToolResult, Usage};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Arguments used when a CLI provider configures none. `{model}` is replaced
/// with the requested model id.
pub const DEFAULT_ARGS: &[&str] = &[
    "-p",
    "--output-format",
    "stream-json",
    "--verbose",
    "--model",
    "{model}",
];

/// Bytes of stderr kept for the error message of a failed run.
const STDERR_TAIL_BYTES: usize = 4096;

pub struct CliProvider {
    id: String,
    command: String,
    args: Vec<String>,
}

impl CliProvider {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args: DEFAULT_ARGS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replace the argument template. An empty list keeps the defaults.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        if !args.is_empty() {
            self.args = args;
        }
        self
    }

    fn spawn(&self, model: &str) -> Result<Child> {
        let args: Vec<String> = self.args.iter().map(|a| a.replace("{model}", model)).collect();
        debug!("cli spawn: provider={}, command={} {:?}", self.id, self.command, args);
        Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transport(format!("failed to spawn {}: {e}", self.command)))
    }
}

#[async_trait]
impl Provider for CliProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn handles_tools(&self) -> bool {
        true
    }

    async fn stream(&self, cancel: CancellationToken, request: ChatRequest) -> Result<EventStream> {
        let mut child = self.spawn(&request.model)?;
        let transcript = render_transcript(&request);

        if let Some(mut stdin) = child.stdin.take() {
            // Written from a separate task so a large transcript cannot
            // deadlock against unread stdout. Dropping stdin sends EOF.
            let provider = self.id.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(transcript.as_bytes()).await {
                    warn!("cli {provider}: failed to write prompt: {e}");
                }
            });
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("child stdout unavailable".into()))?;

        // Drained concurrently: a child blocked on a full stderr pipe would
        // never close stdout.
        let stderr = child.stderr.take().map(|err| tokio::spawn(drain_tail(err)));

        let provider = self.id.clone();
        let (mut tx, rx) = streaming::channel();
        tokio::spawn(async move {
            let result = pump_child(&provider, child, stdout, stderr, &cancel, &mut tx).await;
            tx.finish(result).await;
        });
        Ok(rx)
    }
}

async fn pump_child(
    provider: &str,
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    stderr: Option<JoinHandle<String>>,
    cancel: &CancellationToken,
    tx: &mut EventSender,
) -> Result<Usage> {
    let mut lines = BufReader::new(stdout).lines();
    let mut decoder = CliDecoder::default();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                info!("cli {provider}: cancelled, killing child");
                kill(provider, &mut child).await;
                return Err(Error::Cancelled);
            }
            l = lines.next_line() => l.map_err(|e| Error::Stream(format!("failed to read CLI output: {e}")))?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        if let SseFlow::Done(usage) = decoder.on_line(line, tx).await? {
            if let Err(e) = child.wait().await {
                warn!("cli {provider}: failed to reap child: {e}");
            }
            return Ok(usage);
        }
        if tx.is_closed() {
            kill(provider, &mut child).await;
            return Err(Error::Cancelled);
        }
    }

    // Stdout closed without a result record: let the exit status decide.
    let status = child
        .wait()
        .await
        .map_err(|e| Error::Stream(format!("failed to wait for CLI: {e}")))?;
    if status.success() {
        return Ok(decoder.close(tx).await);
    }
    let stderr = match stderr {
        Some(handle) => handle.await.unwrap_or_else(|e| {
            warn!("cli {provider}: stderr reader failed: {e}");
            String::new()
        }),
        None => String::new(),
    };
    let tail: String = stderr
        .chars()
        .rev()
        .take(500)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    Err(Error::Stream(format!(
        "{provider} exited with {status}: {}",
        tail.trim()
    )))
}

async fn kill(provider: &str, child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("cli {provider}: failed to kill child: {e}");
    }
}

/// Read a pipe to EOF, keeping only its last [`STDERR_TAIL_BYTES`].
async fn drain_tail(mut pipe: ChildStderr) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    let excess = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
            Err(e) => {
                debug!("stderr read ended: {e}");
                break;
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

/// Render the conversation as a plain transcript for the CLI's stdin.
pub(crate) fn render_transcript(request: &ChatRequest) -> String {
    let messages = filter_orphans(&request.messages);
    let system = merged_system(request, &messages);
    let mut out = String::new();
    if !system.is_empty() {
        out.push_str("<system>\n");
        out.push_str(&system);
        out.push_str("\n</system>\n\n");
    }
    for m in &messages {
        match m.role {
            Role::System => {}
            Role::User | Role::Assistant => {
                if !m.content.trim().is_empty() {
                    out.push_str(&format!("[{}]: {}\n\n", m.role, m.content));
                }
                for c in &m.tool_calls {
                    out.push_str(&format!("[tool call {}]: {}({})\n\n", c.id, c.name, c.input));
                }
            }
            Role::Tool => {
                for r in &m.tool_results {
                    let status = if r.is_error { "error" } else { "ok" };
                    out.push_str(&format!(
                        "[tool result {} ({status})]: {}\n\n",
                        r.tool_call_id, r.content
                    ));
                }
            }
        }
    }
    out
}

#[derive(Default)]
struct CliDecoder {
    seen_calls: std::collections::HashSet<String>,
}

#[async_trait]
impl LineDecoder for CliDecoder {
    async fn on_line(&mut self, line: String, tx: &mut EventSender) -> Result<SseFlow> {
        let event: Value = match serde_json::from_str::<Value>(&line) {
            Ok(v) if v.is_object() => v,
            // Plain-text CLIs: pass output through as text.
            _ => {
                tx.text(format!("{line}\n")).await;
                return Ok(SseFlow::Continue);
            }
        };

        match event["type"].as_str().unwrap_or_default() {
            "assistant" => {
                for block in content_blocks(&event) {
                    match block["type"].as_str() {
                        Some("text") => {
                            tx.text(block["text"].as_str().unwrap_or_default()).await;
                        }
                        Some("thinking") => {
                            tx.thinking(block["thinking"].as_str().unwrap_or_default())
                                .await;
                        }
                        Some("tool_use") => {
                            let id = block["id"].as_str().unwrap_or_default().to_string();
                            if !self.seen_calls.insert(id.clone()) {
                                continue;
                            }
                            let name = block["name"].as_str().unwrap_or("tool");
                            tx.tool_call(ToolCall::new(id, name, block["input"].clone()))
                                .await;
                        }
                        _ => {}
                    }
                }
            }
            "user" => {
                for block in content_blocks(&event) {
                    if block["type"].as_str() != Some("tool_result") {
                        continue;
                    }
                    let result = ToolResult {
                        tool_call_id: block["tool_use_id"].as_str().unwrap_or_default().to_string(),
                        content: result_text(&block["content"]),
                        is_error: block["is_error"].as_bool().unwrap_or(false),
                    };
                    tx.send(crate::StreamEvent::ToolResult(result)).await;
                }
            }
            "result" => {
                let failed = event["is_error"].as_bool().unwrap_or(false)
                    || event["subtype"].as_str().is_some_and(|s| s.starts_with("error"));
                if failed {
                    let message = event["result"]
                        .as_str()
                        .or(event["subtype"].as_str())
                        .unwrap_or("CLI reported an error");
                    return Err(Error::Stream(message.to_string()));
                }
                let usage = Usage {
                    input_tokens: event["usage"]["input_tokens"].as_u64().unwrap_or(0),
                    output_tokens: event["usage"]["output_tokens"].as_u64().unwrap_or(0),
                };
                return Ok(SseFlow::Done(usage));
            }
            "system" => debug!("cli system event: {}", event["subtype"]),
            other => {
                if !other.is_empty() {
                    warn!("cli: ignoring unknown event type {other}");
                }
            }
        }
        Ok(SseFlow::Continue)
    }

    async fn close(&mut self, _tx: &mut EventSender) -> Usage {
        Usage::default()
    }
}

fn content_blocks(event: &Value) -> Vec<Value> {
    event["message"]["content"]
        .as_array()
        .cloned()
        .unwrap_or_default()
}

fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, StreamEvent};
    use serde_json::json;

    #[test]
    fn transcript_includes_pairs() {
        let req = ChatRequest::new(
            "m",
            vec![
                Message::user("fix the build"),
                Message::assistant_tool_calls("", vec![ToolCall::new("t1", "bash", json!({"command": "make"}))]),
                Message::tool_results(vec![ToolResult::error("t1", "missing target")]),
            ],
        )
        .with_system("sys");
        let t = render_transcript(&req);
        assert!(t.starts_with("<system>\nsys\n</system>"));
        assert!(t.contains("[user]: fix the build"));
        assert!(t.contains("[tool result t1 (error)]: missing target"));
    }

    #[tokio::test]
    async fn decoder_relays_tools_and_result() {
        let (mut tx, mut rx) = streaming::channel();
        let mut d = CliDecoder::default();
        let lines = [
            json!({"type": "system", "subtype": "init"}),
            json!({"type": "assistant", "message": {"content": [
                {"type": "text", "text": "Looking."},
                {"type": "tool_use", "id": "tu1", "name": "Bash", "input": {"command": "ls"}}
            ]}}),
            json!({"type": "user", "message": {"content": [
                {"type": "tool_result", "tool_use_id": "tu1", "content": [{"type": "text", "text": "a.rs"}]}
            ]}}),
        ];
        for l in lines {
            assert!(matches!(d.on_line(l.to_string(), &mut tx).await.unwrap(), SseFlow::Continue));
        }
        let done = json!({"type": "result", "subtype": "success", "usage": {"input_tokens": 5, "output_tokens": 7}});
        let SseFlow::Done(usage) = d.on_line(done.to_string(), &mut tx).await.unwrap() else {
            panic!("expected done");
        };
        assert_eq!(usage.output_tokens, 7);
        drop(tx);

        assert_eq!(rx.recv().await, Some(StreamEvent::Text("Looking.".into())));
        assert!(matches!(rx.recv().await, Some(StreamEvent::ToolCall(c)) if c.name == "Bash"));
        assert!(matches!(rx.recv().await, Some(StreamEvent::ToolResult(r)) if r.content == "a.rs"));
    }

    #[tokio::test]
    async fn error_result_fails_the_stream() {
        let (mut tx, _rx) = streaming::channel();
        let mut d = CliDecoder::default();
        let line = json!({"type": "result", "subtype": "error_max_turns", "is_error": true, "result": "too many turns"});
        let err = d.on_line(line.to_string(), &mut tx).await.unwrap_err();
        assert!(err.to_string().contains("too many turns"));
    }

    #[tokio::test]
    async fn missing_binary_is_an_immediate_transport_error() {
        let p = CliProvider::new("ghost", "/definitely/not/a/kestrel-cli");
        let err = p
            .stream(CancellationToken::new(), ChatRequest::new("m", vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn plain_text_cli_output_streams_as_text() {
        // `cat` echoes the transcript back: a plain-text "CLI".
        let p = CliProvider::new("echo", "cat").with_args(vec!["-".into()]);
        let rx = p
            .stream(CancellationToken::new(), ChatRequest::new("m", vec![Message::user("ping")]))
            .await
            .unwrap();
        let completion = streaming::collect(rx).await.unwrap();
        assert!(completion.text.contains("[user]: ping"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn noisy_stderr_does_not_stall_a_failing_child() {
        // Far more stderr than a pipe buffer holds, then a failing exit.
        let script = "head -c 200000 /dev/zero | tr '\\0' e >&2; echo boom >&2; exit 3";
        let p = CliProvider::new("noisy", "sh").with_args(vec!["-c".into(), script.into()]);
        let rx = p
            .stream(CancellationToken::new(), ChatRequest::new("m", vec![Message::user("hi")]))
            .await
            .unwrap();
        let err = tokio::time::timeout(std::time::Duration::from_secs(10), streaming::collect(rx))
            .await
            .expect("child should not stall on stderr")
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exited with"), "{msg}");
        assert!(msg.contains("boom"), "{msg}");
        assert!(msg.len() < 1_000);
    }
}
