//! OpenAI-compatible chat completions adapter (SSE).
//!
//! Works against OpenAI itself and the many servers that mimic it. Those
//! servers differ in small ways this adapter irons out: some omit the
//! `[DONE]` sentinel, some re-send the complete argument object after the
//! fragments, and some put reasoning under `reasoning` instead of
//! `reasoning_content`.

use crate::api::provider::{Provider, filter_orphans, merged_system};
use crate::api::ratelimit::RateLimitSnapshot;
use crate::api::streaming::{self, EventSender, EventStream, ToolCallAccumulator};
use crate::api::{LineDecoder, RateLimitCell, SseFlow, http_client, post_json, pump_lines};
use crate::{ChatRequest, Error, Result, Role, Usage};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    id: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    rate_limits: RateLimitCell,
}

impl OpenAiProvider {
    pub fn new(id: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: http_client()?,
            rate_limits: RateLimitCell::default(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn rate_limits(&self) -> Option<RateLimitSnapshot> {
        self.rate_limits.get()
    }

    async fn stream(&self, cancel: CancellationToken, request: ChatRequest) -> Result<EventStream> {
        let body = request_body(&request);
        debug!(
            "openai request: provider={}, model={}, messages={}",
            self.id,
            request.model,
            body["messages"].as_array().map_or(0, Vec::len)
        );

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        let resp = post_json(&self.id, builder, &cancel).await?;
        self.rate_limits.update(resp.headers());

        let (mut tx, rx) = streaming::channel();
        tokio::spawn(async move {
            let mut decoder = ChunkDecoder::default();
            let result = pump_lines(resp, &cancel, &mut tx, &mut decoder).await;
            tx.finish(result).await;
        });
        Ok(rx)
    }
}

// ── Request translation ────────────────────────────────────────────

pub(crate) fn request_body(request: &ChatRequest) -> Value {
    let messages = filter_orphans(&request.messages);
    let system = merged_system(request, &messages);

    let mut out: Vec<Value> = Vec::new();
    if !system.is_empty() {
        out.push(json!({"role": "system", "content": system}));
    }
    for m in &messages {
        match m.role {
            Role::System => {}
            Role::User => out.push(json!({"role": "user", "content": m.content})),
            Role::Assistant => {
                let mut msg = json!({"role": "assistant", "content": m.content});
                if !m.tool_calls.is_empty() {
                    msg["tool_calls"] = m
                        .tool_calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": {"name": c.name, "arguments": c.input.to_string()},
                            })
                        })
                        .collect();
                }
                out.push(msg);
            }
            // One message per result: the schema pairs each by tool_call_id.
            Role::Tool => {
                for r in &m.tool_results {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": r.tool_call_id,
                        "content": r.content,
                    }));
                }
            }
        }
    }

    let mut body = json!({
        "model": request.model,
        "messages": out,
        "stream": true,
        "stream_options": {"include_usage": true},
    });
    if request.max_tokens > 0 {
        body["max_tokens"] = json!(request.max_tokens);
    }
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect();
    }
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    body
}

// ── Stream decoding ────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<ChunkUsage>,
    error: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
    reasoning: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct StreamToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize, Debug)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Default)]
struct ChunkDecoder {
    calls: ToolCallAccumulator,
    usage: Usage,
}

impl ChunkDecoder {
    async fn flush_calls(&mut self, tx: &mut EventSender) {
        for call in self.calls.finish_all() {
            tx.tool_call(call).await;
        }
    }
}

#[async_trait]
impl LineDecoder for ChunkDecoder {
    async fn on_line(&mut self, line: String, tx: &mut EventSender) -> Result<SseFlow> {
        let Some(data) = streaming::sse_data(&line) else {
            return Ok(SseFlow::Continue);
        };
        if data == "[DONE]" {
            return Ok(SseFlow::Done(self.close(tx).await));
        }
        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                warn!("openai: skipping undecodable SSE chunk: {e}");
                return Ok(SseFlow::Continue);
            }
        };
        if let Some(err) = chunk.error {
            let message = err["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Err(Error::Stream(message));
        }
        if let Some(u) = chunk.usage {
            self.usage = Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            };
        }

        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(r) = delta.reasoning_content.or(delta.reasoning) {
                    tx.thinking(r).await;
                }
                if let Some(c) = delta.content {
                    tx.text(c).await;
                }
                for tc in delta.tool_calls.unwrap_or_default() {
                    let index = tc.index.unwrap_or(0);
                    let (name, args) = match tc.function {
                        Some(f) => (f.name, f.arguments),
                        None => (None, None),
                    };
                    self.calls.start(index, tc.id.as_deref(), name.as_deref());
                    if let Some(args) = args {
                        self.calls.push_arguments(index, &args);
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                trace!("openai: finish_reason={reason}");
                self.flush_calls(tx).await;
            }
        }
        Ok(SseFlow::Continue)
    }

    async fn close(&mut self, tx: &mut EventSender) -> Usage {
        self.flush_calls(tx).await;
        self.usage
    }
}
