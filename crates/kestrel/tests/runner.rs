//! End-to-end runner tests with scripted providers.

use async_trait::async_trait;
use kestrel::agent::usage::InMemoryUsageTracker;
use kestrel::api::provider::Provider;
use kestrel::api::streaming::{self, EventStream};
use kestrel::config::{KestrelConfig, ModelRef};
use kestrel::dedupe::ErrorDeduper;
use kestrel::prelude::*;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

// ── Scripted provider ──────────────────────────────────────────────

enum Step {
    Reply(Vec<StreamEvent>),
    Fail(Error),
}

struct Scripted {
    id: String,
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl Scripted {
    fn new(id: &str, steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for Scripted {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stream(&self, _cancel: CancellationToken, request: ChatRequest) -> Result<EventStream> {
        self.requests.lock().unwrap().push(request);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Reply(events)) => {
                let (mut tx, rx) = streaming::channel();
                tokio::spawn(async move {
                    for e in events {
                        tx.send(e).await;
                    }
                });
                Ok(rx)
            }
            None => Err(Error::Config(format!("{} script exhausted", self.id))),
        }
    }
}

fn text(t: &str) -> Step {
    Step::Reply(vec![
        StreamEvent::Text(t.into()),
        StreamEvent::Done(Usage {
            input_tokens: 10,
            output_tokens: 2,
        }),
    ])
}

fn call(id: &str, name: &str, input: serde_json::Value) -> Step {
    Step::Reply(vec![
        StreamEvent::ToolCall(ToolCall::new(id, name, input)),
        StreamEvent::Done(Usage {
            input_tokens: 10,
            output_tokens: 3,
        }),
    ])
}

fn http(provider: &str, status: u16, body: &str) -> Step {
    Step::Fail(Error::Http {
        provider: provider.into(),
        status,
        body: body.into(),
    })
}

const CONFIG: &str = r#"
[[providers]]
id = "alpha"
kind = "ollama"
default_model = "a1"

[[providers.models]]
id = "a1"
input_price = 1.0
output_price = 1.0

[[providers]]
id = "beta"
kind = "ollama"
default_model = "b1"

[[providers.models]]
id = "b1"
input_price = 5.0
output_price = 5.0

[routing]
general = "alpha/a1"

[routing.fallbacks]
general = ["beta/b1"]
"#;

fn catalog() -> KestrelConfig {
    KestrelConfig::from_toml_str(CONFIG).unwrap()
}

#[derive(Deserialize, JsonSchema)]
struct EchoArgs {
    text: String,
}

fn echo_tools() -> Arc<ToolSet> {
    Arc::new(ToolSet::new().with(FnTool::new(
        ToolDefinition::new("echo", "Echo text back", json_schema_for::<EchoArgs>()),
        |args: EchoArgs| async move { Ok::<_, String>(args.text) },
    )))
}

async fn drain(mut events: EventStream) -> Vec<StreamEvent> {
    let mut out = Vec::new();
    while let Some(e) = events.recv().await {
        out.push(e);
    }
    out
}

fn texts(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn text_reply_completes_and_persists() {
    let alpha = Scripted::new("alpha", vec![text("hello there")]);
    let store = Arc::new(InMemoryStore::new());
    let runner = Runner::builder(catalog())
        .with_provider(alpha.clone())
        .with_provider(Scripted::new("beta", vec![]))
        .with_store(store.clone())
        .build()
        .unwrap();

    let events = drain(runner.run(CancellationToken::new(), RunRequest::new("k", "ann", "hi").without_extraction())).await;

    assert_eq!(texts(&events), "hello there");
    assert!(matches!(events.last(), Some(StreamEvent::Done(_))));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let session = store.get_or_create("k", "ann").await.unwrap();
    let stored = store.get_messages(&session.id, 100).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].role, Role::User);
    assert_eq!(stored[1].content, "hello there");

    let req = &alpha.requests()[0];
    assert_eq!(req.model, "a1");
    assert!(req.system.contains("## Current Time"));
    assert!(!req.system.contains("## Tools"));
}

#[tokio::test]
async fn tool_calls_are_executed_and_fed_back() {
    let alpha = Scripted::new(
        "alpha",
        vec![call("c1", "echo", json!({"text": "ping"})), text("all done")],
    );
    let store = Arc::new(InMemoryStore::new());
    let runner = Runner::builder(catalog())
        .with_provider(alpha.clone())
        .with_store(store.clone())
        .with_tools(echo_tools())
        .build()
        .unwrap();

    let events = drain(runner.run(CancellationToken::new(), RunRequest::new("k", "ann", "echo ping").without_extraction())).await;

    let result = events.iter().find_map(|e| match e {
        StreamEvent::ToolResult(r) => Some(r.clone()),
        _ => None,
    });
    let result = result.unwrap();
    assert_eq!(result.tool_call_id, "c1");
    assert_eq!(result.content, "ping");
    assert!(!result.is_error);
    match events.last() {
        Some(StreamEvent::Done(usage)) => {
            assert_eq!(usage.input_tokens, 20);
            assert_eq!(usage.output_tokens, 5);
        }
        other => panic!("expected Done, got {other:?}"),
    }

    let requests = alpha.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools.len(), 1);
    let second = &requests[1].messages;
    assert!(second.iter().any(|m| m.tool_calls.iter().any(|c| c.id == "c1")));
    assert!(second.iter().any(|m| m.tool_results.iter().any(|r| r.content == "ping")));

    let session = store.get_or_create("k", "ann").await.unwrap();
    let roles: Vec<Role> = store
        .get_messages(&session.id, 100)
        .await
        .unwrap()
        .iter()
        .map(|m| m.role)
        .collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
}

#[tokio::test]
async fn unknown_tool_becomes_error_result() {
    let alpha = Scripted::new("alpha", vec![call("c1", "nope", json!({})), text("sorry")]);
    let runner = Runner::builder(catalog())
        .with_provider(alpha.clone())
        .with_tools(echo_tools())
        .build()
        .unwrap();

    let events = drain(runner.run(CancellationToken::new(), RunRequest::new("k", "u", "go").without_extraction())).await;
    let result = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::ToolResult(r) => Some(r.clone()),
            _ => None,
        })
        .unwrap();
    assert!(result.is_error);
    assert!(matches!(events.last(), Some(StreamEvent::Done(_))));
}

#[tokio::test]
async fn rate_limit_cools_down_and_reselects_silently() {
    let alpha = Scripted::new("alpha", vec![http("alpha", 429, "rate limit exceeded")]);
    let beta = Scripted::new("beta", vec![text("from beta")]);
    let usage = Arc::new(InMemoryUsageTracker::new());
    let runner = Runner::builder(catalog())
        .with_provider(alpha.clone())
        .with_provider(beta.clone())
        .with_usage(usage.clone())
        .build()
        .unwrap();

    let events = drain(runner.run(CancellationToken::new(), RunRequest::new("k", "u", "hi").without_extraction())).await;

    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error(_))));
    assert_eq!(texts(&events), "from beta");
    let a1 = ModelRef::new("alpha", "a1");
    assert!(runner.selector().is_cooling_down(&a1));
    assert_eq!(runner.selector().cooldown_state(&a1).unwrap().failure_count, 1);
    let profile = usage.profile("alpha/a1").unwrap();
    assert_eq!(profile.errors.get("rate_limit"), Some(&1));
    assert_eq!(usage.profile("beta/b1").unwrap().calls, 1);
}

#[tokio::test]
async fn exhausting_every_model_surfaces_no_model() {
    let runner = Runner::builder(catalog())
        .with_provider(Scripted::new("alpha", vec![http("alpha", 401, "invalid x-api-key")]))
        .with_provider(Scripted::new("beta", vec![http("beta", 402, "credit balance too low")]))
        .build()
        .unwrap();

    let events = drain(runner.run(CancellationToken::new(), RunRequest::new("k", "u", "hi").without_extraction())).await;
    match events.last() {
        Some(StreamEvent::Error(e)) => assert!(e.starts_with("no usable model"), "{e}"),
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn iteration_limit_is_fatal_and_verbatim() {
    let alpha = Scripted::new(
        "alpha",
        (0..3).map(|i| call(&format!("c{i}"), "echo", json!({"text": "again"}))).collect(),
    );
    let runner = Runner::builder(catalog())
        .with_config(RunnerConfig::default().with_max_iterations(3))
        .with_provider(alpha)
        .with_tools(echo_tools())
        .build()
        .unwrap();

    let events = drain(runner.run(CancellationToken::new(), RunRequest::new("k", "u", "loop").without_extraction())).await;
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Error("reached the maximum of 3 iterations without completing".into()))
    );
}

#[tokio::test]
async fn context_overflow_compacts_once_then_gives_up() {
    let alpha = Scripted::new(
        "alpha",
        vec![
            http("alpha", 400, "prompt is too long: 250000 tokens > 200000 maximum"),
            // The compaction summary is generated by the cheapest model.
            text("User greeted the assistant."),
            http("alpha", 400, "prompt is too long: 240000 tokens > 200000 maximum"),
        ],
    );
    let store = Arc::new(InMemoryStore::new());
    let runner = Runner::builder(catalog())
        .with_provider(alpha.clone())
        .with_store(store.clone())
        .build()
        .unwrap();

    let events = drain(runner.run(CancellationToken::new(), RunRequest::new("k", "u", "hi").without_extraction())).await;

    match events.last() {
        Some(StreamEvent::Error(e)) => assert!(e.contains("too large"), "{e}"),
        other => panic!("expected Error, got {other:?}"),
    }
    let session = store.get_or_create("k", "u").await.unwrap();
    assert_eq!(
        store.get_summary(&session.id).await.unwrap().as_deref(),
        Some("User greeted the assistant.")
    );
    let requests = alpha.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[2].system.contains("User greeted the assistant."));
}

#[tokio::test]
async fn role_ordering_rejection_is_retried_with_strict_roles() {
    let alpha = Scripted::new(
        "alpha",
        vec![http("alpha", 400, "messages: roles must alternate between user and assistant"), text("ok")],
    );
    let runner = Runner::builder(catalog())
        .with_provider(alpha.clone())
        .build()
        .unwrap();

    let events = drain(runner.run(CancellationToken::new(), RunRequest::new("k", "u", "hi").without_extraction())).await;
    assert_eq!(texts(&events), "ok");
    assert!(matches!(events.last(), Some(StreamEvent::Done(_))));
    assert_eq!(alpha.requests().len(), 2);
    assert!(!runner.selector().is_cooling_down(&ModelRef::new("alpha", "a1")));
}

#[tokio::test]
async fn repeated_role_ordering_rejections_never_reach_the_user() {
    let rejection = "messages: roles must alternate between user and assistant";
    let alpha = Scripted::new(
        "alpha",
        vec![
            http("alpha", 400, rejection),
            http("alpha", 400, rejection),
            http("alpha", 400, rejection),
            text("ok"),
        ],
    );
    let runner = Runner::builder(catalog())
        .with_provider(alpha.clone())
        .build()
        .unwrap();

    // The channel note adds a steering message next to the user turn.
    let events = drain(runner.run(
        CancellationToken::new(),
        RunRequest::new("k", "u", "hi").with_channel("telegram").without_extraction(),
    ))
    .await;

    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error(_))));
    assert_eq!(texts(&events), "ok");
    assert!(matches!(events.last(), Some(StreamEvent::Done(_))));

    let requests = alpha.requests();
    assert_eq!(requests.len(), 4);
    for retry in &requests[1..] {
        let roles: Vec<Role> = retry.messages.iter().map(|m| m.role).collect();
        assert!(roles.windows(2).all(|w| w[0] != w[1]), "{roles:?}");
        assert!(retry.messages.iter().any(|m| m.content.contains("<steering source=\"channel\">")));
    }
}

#[tokio::test]
async fn reordered_error_bodies_are_logged_once() {
    let errors = Arc::new(ErrorDeduper::default());
    let runner = Runner::builder(catalog())
        .with_provider(Scripted::new(
            "alpha",
            vec![http("alpha", 429, r#"{"type": "error", "error": {"type": "rate_limit_error", "message": "slow down"}}"#)],
        ))
        .with_provider(Scripted::new(
            "beta",
            vec![http("beta", 429, r#"{"error": {"message": "slow down", "type": "rate_limit_error"}, "type": "error"}"#)],
        ))
        .with_error_deduper(errors.clone())
        .build()
        .unwrap();

    drain(runner.run(CancellationToken::new(), RunRequest::new("k", "u", "hi").without_extraction())).await;
    assert_eq!(errors.duplicates(), 1);
}

#[tokio::test]
async fn explicit_switch_request_pins_the_model() {
    let alpha = Scripted::new("alpha", vec![]);
    let beta = Scripted::new("beta", vec![text("beta here")]);
    let runner = Runner::builder(catalog())
        .with_provider(alpha.clone())
        .with_provider(beta.clone())
        .build()
        .unwrap();

    let events = drain(runner.run(CancellationToken::new(), RunRequest::new("k", "u", "switch to beta").without_extraction())).await;
    assert_eq!(texts(&events), "beta here");
    assert!(alpha.requests().is_empty());
    assert_eq!(beta.requests()[0].model, "b1");
}

#[tokio::test]
async fn request_model_override_is_honored() {
    let beta = Scripted::new("beta", vec![text("pinned")]);
    let runner = Runner::builder(catalog())
        .with_provider(Scripted::new("alpha", vec![]))
        .with_provider(beta.clone())
        .build()
        .unwrap();

    let events = drain(runner.run(
        CancellationToken::new(),
        RunRequest::new("k", "u", "hello").with_model("beta/b1").without_extraction(),
    ))
    .await;
    assert_eq!(texts(&events), "pinned");
}

#[tokio::test]
async fn steering_reaches_the_request_but_not_the_store() {
    let alpha = Scripted::new("alpha", vec![text("hey")]);
    let store = Arc::new(InMemoryStore::new());
    let runner = Runner::builder(catalog())
        .with_provider(alpha.clone())
        .with_store(store.clone())
        .build()
        .unwrap();

    drain(runner.run(
        CancellationToken::new(),
        RunRequest::new("k", "u", "yo").with_channel("telegram").without_extraction(),
    ))
    .await;

    let sent = &alpha.requests()[0].messages;
    assert!(sent.iter().any(|m| m.content.contains("<steering source=\"channel\">")));
    let session = store.get_or_create("k", "u").await.unwrap();
    let stored = store.get_messages(&session.id, 100).await.unwrap();
    assert!(stored.iter().all(|m| !m.content.contains("<steering")));
}

#[tokio::test]
async fn facts_are_extracted_in_the_background() {
    let alpha = Scripted::new("alpha", vec![text("Noted!"), text("- Prefers green tea\n- Lives in Porto")]);
    let facts = Arc::new(InMemoryFactStore::new());
    let runner = Runner::builder(catalog())
        .with_provider(alpha.clone())
        .with_facts(facts.clone())
        .build()
        .unwrap();

    let events = drain(runner.run(CancellationToken::new(), RunRequest::new("k", "ann", "I live in Porto and drink green tea"))).await;
    assert!(matches!(events.last(), Some(StreamEvent::Done(_))));

    let mut saved = Vec::new();
    for _ in 0..100 {
        saved = facts.facts_for("ann");
        if !saved.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(saved, vec!["Prefers green tea", "Lives in Porto"]);
}

#[tokio::test]
async fn cancelled_run_ends_with_error() {
    let runner = Runner::builder(catalog())
        .with_provider(Scripted::new("alpha", vec![text("never")]))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let events = drain(runner.run(cancel, RunRequest::new("k", "u", "hi"))).await;
    assert_eq!(events, vec![StreamEvent::Error("run cancelled".into())]);
}
