//! Anthropic Messages API adapter (SSE).
//!
//! Text arrives as `text_delta`, reasoning as `thinking_delta`, and tool
//! arguments as `input_json_delta` fragments that are buffered per content
//! block until `content_block_stop`. A stream that ends without
//! `message_stop` is closed normally after flushing buffered calls.

use crate::api::provider::{Provider, filter_orphans, merged_system};
use crate::api::ratelimit::RateLimitSnapshot;
use crate::api::streaming::{self, EventSender, EventStream, ToolCallAccumulator};
use crate::api::{LineDecoder, RateLimitCell, SseFlow, http_client, post_json, pump_lines};
use crate::{ChatRequest, Error, Result, Role, Usage};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    id: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    rate_limits: RateLimitCell,
}

impl AnthropicProvider {
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

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn rate_limits(&self) -> Option<RateLimitSnapshot> {
        self.rate_limits.get()
    }

    async fn stream(&self, cancel: CancellationToken, request: ChatRequest) -> Result<EventStream> {
        let body = request_body(&request);
        debug!(
            "anthropic request: provider={}, model={}, messages={}",
            self.id,
            request.model,
            body["messages"].as_array().map_or(0, Vec::len)
        );

        let builder = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body);
        let resp = post_json(&self.id, builder, &cancel).await?;
        self.rate_limits.update(resp.headers());

        let (mut tx, rx) = streaming::channel();
        tokio::spawn(async move {
            let mut decoder = SseState::default();
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
    for m in messages.iter().filter(|m| m.role != Role::System) {
        let (role, blocks) = match m.role {
            Role::User => ("user", vec![json!({"type": "text", "text": m.content})]),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !m.content.trim().is_empty() {
                    blocks.push(json!({"type": "text", "text": m.content}));
                }
                for c in &m.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": c.id,
                        "name": c.name,
                        "input": c.input,
                    }));
                }
                ("assistant", blocks)
            }
            Role::Tool => (
                "user",
                m.tool_results
                    .iter()
                    .map(|r| {
                        json!({
                            "type": "tool_result",
                            "tool_use_id": r.tool_call_id,
                            "content": r.content,
                            "is_error": r.is_error,
                        })
                    })
                    .collect(),
            ),
            Role::System => continue,
        };
        if blocks.is_empty() {
            continue;
        }
        // The API requires alternating roles: fold consecutive same-role
        // messages into one.
        if let Some(last) = out.last_mut()
            && last["role"] == role
            && let Some(content) = last["content"].as_array_mut()
        {
            content.extend(blocks);
            continue;
        }
        out.push(json!({"role": role, "content": blocks}));
    }

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "messages": out,
        "stream": true,
    });
    if !system.is_empty() {
        body["system"] = json!(system);
    }
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
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

#[derive(Default)]
struct SseState {
    calls: ToolCallAccumulator,
    usage: Usage,
}

#[async_trait]
impl LineDecoder for SseState {
    async fn on_line(&mut self, line: String, tx: &mut EventSender) -> Result<SseFlow> {
        let Some(data) = streaming::sse_data(&line) else {
            return Ok(SseFlow::Continue);
        };
        let event: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                warn!("anthropic: skipping undecodable SSE data: {e}");
                return Ok(SseFlow::Continue);
            }
        };

        match event["type"].as_str().unwrap_or_default() {
            "message_start" => {
                if let Some(n) = event["message"]["usage"]["input_tokens"].as_u64() {
                    self.usage.input_tokens = n;
                }
            }
            "content_block_start" => {
                let index = block_index(&event);
                let block = &event["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => {
                        self.calls
                            .start(index, block["id"].as_str(), block["name"].as_str());
                        if let Some(input) = block["input"].as_object()
                            && !input.is_empty()
                        {
                            self.calls
                                .push_arguments(index, &block["input"].to_string());
                        }
                    }
                    Some("text") => {
                        if let Some(t) = block["text"].as_str() {
                            tx.text(t).await;
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let index = block_index(&event);
                let delta = &event["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        tx.text(delta["text"].as_str().unwrap_or_default()).await;
                    }
                    Some("thinking_delta") => {
                        tx.thinking(delta["thinking"].as_str().unwrap_or_default())
                            .await;
                    }
                    Some("input_json_delta") => {
                        self.calls
                            .push_arguments(index, delta["partial_json"].as_str().unwrap_or_default());
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(call) = self.calls.finish(block_index(&event)) {
                    tx.tool_call(call).await;
                }
            }
            "message_delta" => {
                if let Some(n) = event["usage"]["output_tokens"].as_u64() {
                    self.usage.output_tokens = n;
                }
            }
            "message_stop" => return Ok(SseFlow::Done(self.close(tx).await)),
            "error" => {
                let message = event["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error");
                let kind = event["error"]["type"].as_str().unwrap_or("error");
                return Err(Error::Stream(format!("{kind}: {message}")));
            }
            _ => {}
        }
        Ok(SseFlow::Continue)
    }

    /// Flush calls whose block never closed and report usage.
    async fn close(&mut self, tx: &mut EventSender) -> Usage {
        for call in self.calls.finish_all() {
            tx.tool_call(call).await;
        }
        self.usage
    }
}

fn block_index(event: &Value) -> usize {
    event["index"].as_u64().unwrap_or(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, ToolCall, ToolDefinition, ToolResult};

    #[test]
    fn body_translates_tool_pairs_and_folds_roles() {
        let request = ChatRequest::new(
            "claude-test",
            vec![
                Message::system("be brief"),
                Message::user("list files"),
                Message::assistant_tool_calls(
                    "on it",
                    vec![ToolCall::new("t1", "shell", json!({"command": "ls"}))],
                ),
                Message::tool_results(vec![ToolResult::error("t1", "permission denied")]),
                Message::user("try again"),
            ],
        )
        .with_system("You are kestrel.")
        .with_tools(vec![ToolDefinition::new("shell", "run", json!({"type": "object"}))]);

        let body = request_body(&request);
        assert_eq!(body["system"], "You are kestrel.\n\nbe brief");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][1]["type"], "tool_use");
        // Tool result and the following user text share one user turn.
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["is_error"], true);
        assert_eq!(messages[2]["content"][1]["text"], "try again");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn body_drops_orphaned_calls() {
        let request = ChatRequest::new(
            "m",
            vec![
                Message::user("x"),
                Message::assistant_tool_calls("", vec![ToolCall::new("lost", "grep", json!({}))]),
            ],
        );
        let body = request_body(&request);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }
}
