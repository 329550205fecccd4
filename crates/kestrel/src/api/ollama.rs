//! Local inference adapter for Ollama's `/api/chat` (newline-delimited JSON).
//!
//! Ollama delivers tool calls whole, with arguments as an object rather than
//! a string, and older versions omit call ids. Ids are generated when absent.

use crate::api::provider::{Provider, filter_orphans, merged_system};
use crate::api::streaming::{self, EventSender, EventStream, ToolCallAccumulator};
use crate::api::{LineDecoder, SseFlow, http_client, post_json, pump_lines};
use crate::{ChatRequest, Error, Result, Role, Usage};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    id: String,
    base_url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: http_client()?,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stream(&self, cancel: CancellationToken, request: ChatRequest) -> Result<EventStream> {
        let body = request_body(&request);
        debug!("ollama request: provider={}, model={}", self.id, request.model);

        let builder = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body);
        let resp = post_json(&self.id, builder, &cancel).await?;

        let (mut tx, rx) = streaming::channel();
        tokio::spawn(async move {
            let mut decoder = NdjsonDecoder::default();
            let result = pump_lines(resp, &cancel, &mut tx, &mut decoder).await;
            tx.finish(result).await;
        });
        Ok(rx)
    }
}

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
                        .map(|c| json!({"function": {"name": c.name, "arguments": c.input}}))
                        .collect();
                }
                out.push(msg);
            }
            Role::Tool => {
                for r in &m.tool_results {
                    out.push(json!({"role": "tool", "content": r.content}));
                }
            }
        }
    }

    let mut options = json!({});
    if request.max_tokens > 0 {
        options["num_predict"] = json!(request.max_tokens);
    }
    if let Some(t) = request.temperature {
        options["temperature"] = json!(t);
    }
    let mut body = json!({
        "model": request.model,
        "messages": out,
        "stream": true,
        "options": options,
    });
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
    body
}

#[derive(Default)]
struct NdjsonDecoder {
    calls: ToolCallAccumulator,
    next_index: usize,
    usage: Usage,
}

#[async_trait]
impl LineDecoder for NdjsonDecoder {
    async fn on_line(&mut self, line: String, tx: &mut EventSender) -> Result<SseFlow> {
        let chunk: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!("ollama: skipping undecodable line: {e}");
                return Ok(SseFlow::Continue);
            }
        };
        if let Some(err) = chunk["error"].as_str() {
            return Err(Error::Stream(err.to_string()));
        }

        let message = &chunk["message"];
        if let Some(t) = message["thinking"].as_str() {
            tx.thinking(t).await;
        }
        if let Some(t) = message["content"].as_str() {
            tx.text(t).await;
        }
        if let Some(calls) = message["tool_calls"].as_array() {
            for call in calls {
                let index = self.next_index;
                self.next_index += 1;
                let f = &call["function"];
                self.calls
                    .start(index, call["id"].as_str(), f["name"].as_str());
                let args = match &f["arguments"] {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                self.calls.push_arguments(index, &args);
                if let Some(c) = self.calls.finish(index) {
                    tx.tool_call(c).await;
                }
            }
        }

        if chunk["done"].as_bool() == Some(true) {
            self.usage = Usage {
                input_tokens: chunk["prompt_eval_count"].as_u64().unwrap_or(0),
                output_tokens: chunk["eval_count"].as_u64().unwrap_or(0),
            };
            return Ok(SseFlow::Done(self.close(tx).await));
        }
        Ok(SseFlow::Continue)
    }

    async fn close(&mut self, tx: &mut EventSender) -> Usage {
        for call in self.calls.finish_all() {
            tx.tool_call(call).await;
        }
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, ToolCall, ToolResult};

    #[test]
    fn body_uses_object_arguments_and_options() {
        let mut request = ChatRequest::new(
            "qwen",
            vec![
                Message::user("hi"),
                Message::assistant_tool_calls("", vec![ToolCall::new("a", "shell", json!({"command": "ls"}))]),
                Message::tool_results(vec![ToolResult::ok("a", "file.txt")]),
            ],
        )
        .with_max_tokens(256);
        request.temperature = Some(0.2);
        let body = request_body(&request);
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["arguments"]["command"], "ls");
        assert_eq!(body["messages"][2]["role"], "tool");
        assert_eq!(body["options"]["num_predict"], 256);
    }

    #[tokio::test]
    async fn decoder_generates_ids_and_reads_usage() {
        let (mut tx, mut rx) = streaming::channel();
        let mut d = NdjsonDecoder::default();
        let first = r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"shell","arguments":{"command":"pwd"}}}]},"done":false}"#;
        let last = r#"{"message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":12,"eval_count":4}"#;
        assert!(matches!(d.on_line(first.into(), &mut tx).await.unwrap(), SseFlow::Continue));
        let SseFlow::Done(usage) = d.on_line(last.into(), &mut tx).await.unwrap() else {
            panic!("expected done");
        };
        assert_eq!(usage.total(), 16);
        drop(tx);
        match rx.recv().await {
            Some(crate::StreamEvent::ToolCall(c)) => {
                assert_eq!(c.id, "call_1");
                assert_eq!(c.input["command"], "pwd");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
