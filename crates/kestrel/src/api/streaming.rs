//! The shared streaming contract and the building blocks adapters use to
//! honor it.
//!
//! Every adapter translates its backend payloads into [`StreamEvent`]s
//! exactly once, at the adapter boundary, and pushes them through an
//! [`EventSender`] into a bounded channel. The sender enforces the terminal
//! rule: a stream ends with exactly one `Done`, or with one `Error` and no
//! `Done`. Nothing is sent after the terminal event.
//!
//! Wire helpers:
//! - [`LineBuffer`]: splits a chunked byte stream into complete lines without
//!   breaking multi-byte characters across chunk boundaries.
//! - [`sse_data`]: extracts the payload of an SSE `data:` line.
//! - [`ToolCallAccumulator`]: merges fragmented tool-call arguments by index
//!   and guarantees at most one `ToolCall` per logical call.

use crate::{Message, ToolCall, ToolResult, Usage};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Capacity of the adapter → consumer event queue. A full queue blocks the
/// producer; events are never dropped.
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 64;

/// A single event in a provider or run stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental text delta.
    Text(String),
    /// An incremental reasoning/thinking delta.
    Thinking(String),
    /// A complete tool call (arguments fully accumulated).
    ToolCall(ToolCall),
    /// A tool result, either observed from an autonomous CLI backend or
    /// produced by the runner's own tool execution.
    ToolResult(ToolResult),
    /// A complete message persisted by the runner.
    Message(Message),
    /// Terminal failure. No `Done` follows.
    Error(String),
    /// Terminal success, with the token usage reported for the stream.
    Done(Usage),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done(_) | StreamEvent::Error(_))
    }
}

/// Receiving half of an event stream.
pub type EventStream = mpsc::Receiver<StreamEvent>;

/// Create a bounded event channel with the default capacity.
pub fn channel() -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::channel(DEFAULT_STREAM_BUFFER_SIZE);
    (EventSender::new(tx), rx)
}

// ── EventSender ────────────────────────────────────────────────────

/// Sending half of an event stream that enforces the terminal rule.
#[derive(Debug)]
pub struct EventSender {
    tx: mpsc::Sender<StreamEvent>,
    finished: bool,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            finished: false,
        }
    }

    /// Send an event. Returns `false` once the stream is finished or the
    /// receiver has gone away, so producers can stop reading the transport.
    pub async fn send(&mut self, event: StreamEvent) -> bool {
        if self.finished {
            trace!("dropping event after terminal: {event:?}");
            return false;
        }
        if event.is_terminal() {
            self.finished = true;
        }
        self.tx.send(event).await.is_ok() && !self.finished
    }

    pub async fn text(&mut self, delta: impl Into<String>) -> bool {
        let delta = delta.into();
        if delta.is_empty() {
            return !self.finished;
        }
        self.send(StreamEvent::Text(delta)).await
    }

    pub async fn thinking(&mut self, delta: impl Into<String>) -> bool {
        let delta = delta.into();
        if delta.is_empty() {
            return !self.finished;
        }
        self.send(StreamEvent::Thinking(delta)).await
    }

    pub async fn tool_call(&mut self, call: ToolCall) -> bool {
        self.send(StreamEvent::ToolCall(call)).await
    }

    pub async fn done(&mut self, usage: Usage) {
        self.send(StreamEvent::Done(usage)).await;
    }

    pub async fn error(&mut self, message: impl Into<String>) {
        self.send(StreamEvent::Error(message.into())).await;
    }

    /// Close the stream from a producer result: `Ok` → `Done`, `Err` → `Error`.
    /// A no-op if a terminal event was already sent.
    pub async fn finish(&mut self, result: crate::Result<Usage>) {
        match result {
            Ok(usage) => self.done(usage).await,
            Err(e) => self.error(e.to_string()).await,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ── Wire helpers ───────────────────────────────────────────────────

/// Splits a chunked byte stream into complete, trimmed lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed. Blank lines are
    /// skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush a trailing line that had no newline.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// Payload of an SSE `data:` line. Comments (`:`), `event:` and other fields
/// yield `None`.
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

// ── ToolCallAccumulator ────────────────────────────────────────────

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates streamed tool-call fragments keyed by stream index.
///
/// Some backends re-send the complete argument object after streaming it in
/// fragments; a fragment that is itself a complete JSON value equal to (or
/// replacing) what was already accumulated is treated as a resend, not
/// appended. An empty `{}` placeholder announced before the real fragments is
/// discarded. Ids already emitted are never emitted again.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    pending: BTreeMap<usize, PartialToolCall>,
    emitted: HashSet<String>,
    generated: usize,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the id and/or name for a call. Later non-empty values win.
    pub fn start(&mut self, index: usize, id: Option<&str>, name: Option<&str>) {
        let entry = self.pending.entry(index).or_default();
        if let Some(id) = id
            && !id.is_empty()
        {
            entry.id = id.to_string();
        }
        if let Some(name) = name
            && !name.is_empty()
        {
            entry.name = name.to_string();
        }
    }

    /// Append an argument fragment.
    pub fn push_arguments(&mut self, index: usize, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        let entry = self.pending.entry(index).or_default();
        if matches!(entry.arguments.trim(), "" | "{}") {
            entry.arguments = fragment.to_string();
            return;
        }
        if is_complete_json(&entry.arguments)
            && is_complete_json(fragment)
        {
            if entry.arguments.trim() != fragment.trim() {
                debug!(
                    "tool call index={index} received replacement arguments ({} bytes)",
                    fragment.len()
                );
                entry.arguments = fragment.to_string();
            } else {
                trace!("tool call index={index} ignoring duplicate argument resend");
            }
            return;
        }
        entry.arguments.push_str(fragment);
    }

    /// Whether anything is buffered for `index`.
    pub fn has(&self, index: usize) -> bool {
        self.pending.contains_key(&index)
    }

    /// Close one call and return it, unless it has no name or its id was
    /// already emitted.
    pub fn finish(&mut self, index: usize) -> Option<ToolCall> {
        let partial = self.pending.remove(&index)?;
        self.complete(partial)
    }

    /// Close every buffered call in index order.
    pub fn finish_all(&mut self) -> Vec<ToolCall> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_values()
            .filter_map(|p| self.complete(p))
            .collect()
    }

    fn complete(&mut self, mut partial: PartialToolCall) -> Option<ToolCall> {
        if partial.name.is_empty() {
            warn!("dropping tool call fragment without a name (id={})", partial.id);
            return None;
        }
        if partial.id.is_empty() {
            self.generated += 1;
            partial.id = format!("call_{}", self.generated);
        }
        if !self.emitted.insert(partial.id.clone()) {
            debug!("suppressing duplicate tool call id={}", partial.id);
            return None;
        }
        let input = parse_arguments(&partial.arguments);
        Some(ToolCall::new(partial.id, partial.name, input))
    }
}

fn is_complete_json(s: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(s).is_ok()
}

/// Parse accumulated arguments. Empty means no arguments; unparseable text is
/// preserved under `_raw` so the tool layer can report it back to the model.
pub fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!("tool call arguments are not valid JSON: {e}");
            serde_json::json!({ "_raw": raw })
        }
    }
}

// ── Collection ─────────────────────────────────────────────────────

/// A fully drained stream.
#[derive(Debug, Default, Clone)]
pub struct Completion {
    pub text: String,
    pub thinking: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

/// Drain a stream into a [`Completion`]. An `Error` event becomes
/// [`crate::Error::Stream`]; a stream that closes without a terminal event is
/// treated as complete.
pub async fn collect(mut events: EventStream) -> crate::Result<Completion> {
    let mut out = Completion::default();
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Text(t) => out.text.push_str(&t),
            StreamEvent::Thinking(t) => out.thinking.push_str(&t),
            StreamEvent::ToolCall(c) => out.tool_calls.push(c),
            StreamEvent::Done(usage) => {
                out.usage = usage;
                break;
            }
            StreamEvent::Error(e) => return Err(crate::Error::Stream(e)),
            StreamEvent::ToolResult(_) | StreamEvent::Message(_) => {}
        }
    }
    Ok(out)
}
