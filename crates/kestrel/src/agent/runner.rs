//! The agentic loop.
//!
//! One [`Runner::run`] call handles one user message and produces one ordered
//! event stream. Each iteration:
//!
//! 1. Reload history from the store.
//! 2. Over the hard context limit and not yet compacted this run: flush
//!    durable facts, compact with a summary, re-inject recently used files.
//! 3. Detect an explicit model-switch request and pin it for the run.
//! 4. Select a model (override, task routing, then first loaded provider).
//! 5. Micro-compact, prune and strip acknowledged images from the outbound
//!    copy; assemble the system prompt; merge steering messages.
//! 6. Stream the call and forward events. Tool calls are executed and fed
//!    back; a turn without tool calls completes the run.
//!
//! Failures are classified, never retried blindly: context overflow gets one
//! compaction, rate-limit/auth and transport failures cool the model down
//! and reselect, role-ordering rejections are resent with stricter
//! normalization, and anything else ends the run.

use crate::agent::config::RunnerConfig;
use crate::agent::memory::{self, FactStore};
use crate::agent::prompt::{PromptParts, build_system_prompt};
use crate::agent::store::{ConversationStore, InMemoryStore, Session};
use crate::agent::switch::detect_switch;
use crate::agent::tools::{ToolRegistry, ToolSet};
use crate::agent::usage::UsageTracker;
use crate::api::Providers;
use crate::api::provider::Provider;
use crate::api::retry::{CooldownReason, ErrorClass, classify, cooldown_reason};
use crate::api::streaming::{self, Completion, EventSender, EventStream, StreamEvent};
use crate::api::tracing::{CostTracker, generate_span_id, generate_trace_id};
use crate::config::{KestrelConfig, ModelRef};
use crate::context::summarizer::{build_summarization_request, fallback_summary};
use crate::context::{ContextBudget, FileAccessTracker, images, micro_compact, prune};
use crate::dedupe::ErrorDeduper;
use crate::routing::{FuzzyMatcher, ModelSelector};
use crate::steering::{self, SteeringPipeline, TaskItem};
use crate::{ChatRequest, Error, Message, Result, Role, ToolResult, Usage};
use chrono::Local;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Shown when the context still overflows after compaction.
pub const CONTEXT_TOO_LARGE_MESSAGE: &str = "This conversation is too large for the model's context window, \
even after compacting it. Start a new session or send a shorter request.";

// ── RunRequest ─────────────────────────────────────────────────────

/// One user message to process.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_key: String,
    pub user: String,
    pub message: String,
    /// Channel the message arrived on. Defaults to the runner's channel.
    pub channel: Option<String>,
    /// Model override: `provider/model` or a free-form name.
    pub model: Option<String>,
    pub active_task: Option<String>,
    pub tasks: Vec<TaskItem>,
    /// Set to `false` to skip background fact extraction for this run.
    pub extract_facts: bool,
}

impl RunRequest {
    pub fn new(
        session_key: impl Into<String>,
        user: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            user: user.into(),
            message: message.into(),
            channel: None,
            model: None,
            active_task: None,
            tasks: Vec::new(),
            extract_facts: true,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_active_task(mut self, task: impl Into<String>) -> Self {
        self.active_task = Some(task.into());
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<TaskItem>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn without_extraction(mut self) -> Self {
        self.extract_facts = false;
        self
    }
}

// ── Builder ────────────────────────────────────────────────────────

pub struct RunnerBuilder {
    catalog: KestrelConfig,
    config: RunnerConfig,
    providers: Option<Providers>,
    selector: Option<Arc<ModelSelector>>,
    store: Option<Arc<dyn ConversationStore>>,
    tools: Option<Arc<dyn ToolRegistry>>,
    facts: Option<Arc<dyn FactStore>>,
    usage: Option<Arc<dyn UsageTracker>>,
    steering: Option<SteeringPipeline>,
    errors: Option<Arc<ErrorDeduper>>,
}

impl RunnerBuilder {
    fn new(catalog: KestrelConfig) -> Self {
        let config = RunnerConfig::default().with_overrides(&catalog.runner);
        Self {
            catalog,
            config,
            providers: None,
            selector: None,
            store: None,
            tools: None,
            facts: None,
            usage: None,
            steering: None,
            errors: None,
        }
    }

    /// Replace the runner configuration, including anything taken from the
    /// catalog's `[runner]` table.
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use these provider instances instead of building them from config.
    pub fn with_providers(mut self, providers: Providers) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers
            .get_or_insert_with(Providers::new)
            .insert(provider.id().to_string(), provider);
        self
    }

    /// Share a selector (and its cooldown state) between runners.
    pub fn with_selector(mut self, selector: Arc<ModelSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_facts(mut self, facts: Arc<dyn FactStore>) -> Self {
        self.facts = Some(facts);
        self
    }

    pub fn with_usage(mut self, usage: Arc<dyn UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_steering(mut self, steering: SteeringPipeline) -> Self {
        self.steering = Some(steering);
        self
    }

    /// Share provider-error suppression between runners.
    pub fn with_error_deduper(mut self, errors: Arc<ErrorDeduper>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn build(self) -> Result<Runner> {
        self.catalog.validate()?;
        let providers = match self.providers {
            Some(p) => p,
            None => crate::api::build_providers(&self.catalog)?,
        };
        let catalog = Arc::new(self.catalog);
        let selector = match self.selector {
            Some(s) => {
                s.set_loaded(providers.keys().cloned());
                s
            }
            None => Arc::new(
                ModelSelector::new(catalog.clone()).with_loaded(providers.keys().cloned()),
            ),
        };
        let matcher = FuzzyMatcher::from_config(&catalog);
        info!(
            "runner built: providers={}, max_iterations={}",
            providers.keys().cloned().collect::<Vec<_>>().join(","),
            self.config.max_iterations
        );
        Ok(Runner {
            inner: Arc::new(Inner {
                config: self.config,
                catalog,
                providers,
                selector,
                matcher,
                store: self
                    .store
                    .unwrap_or_else(|| Arc::new(InMemoryStore::new())),
                tools: self.tools.unwrap_or_else(|| Arc::new(ToolSet::new())),
                facts: self.facts,
                usage: self.usage,
                steering: self.steering.unwrap_or_else(SteeringPipeline::with_defaults),
                errors: self.errors.unwrap_or_default(),
            }),
        })
    }
}

// ── Runner ─────────────────────────────────────────────────────────

struct Inner {
    config: RunnerConfig,
    catalog: Arc<KestrelConfig>,
    providers: Providers,
    selector: Arc<ModelSelector>,
    matcher: FuzzyMatcher,
    store: Arc<dyn ConversationStore>,
    tools: Arc<dyn ToolRegistry>,
    facts: Option<Arc<dyn FactStore>>,
    usage: Option<Arc<dyn UsageTracker>>,
    steering: SteeringPipeline,
    errors: Arc<ErrorDeduper>,
}

/// Cheap to clone; clones share providers, selector state and the store.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.inner.config)
            .field("providers", &self.inner.providers.keys().collect::<Vec<_>>())
            .field("steering", &self.inner.steering)
            .finish()
    }
}

/// Per-run mutable state.
struct RunState {
    trace_id: String,
    started: Instant,
    cost: CostTracker,
    excluded: HashSet<ModelRef>,
    pinned: Option<ModelRef>,
    compacted: bool,
    just_compacted: bool,
    overflow_retried: bool,
    strict_roles: bool,
    role_retries: u32,
}

/// What one streamed turn produced.
#[derive(Debug, Default)]
struct Turn {
    text: String,
    tool_calls: Vec<crate::ToolCall>,
    usage: Usage,
}

impl Runner {
    pub fn builder(catalog: KestrelConfig) -> RunnerBuilder {
        RunnerBuilder::new(catalog)
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    pub fn selector(&self) -> &Arc<ModelSelector> {
        &self.inner.selector
    }

    pub fn matcher(&self) -> &FuzzyMatcher {
        &self.inner.matcher
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.inner.store
    }

    /// Process one message. Events arrive in order and end with exactly one
    /// `Done` or `Error`.
    pub fn run(&self, cancel: CancellationToken, request: RunRequest) -> EventStream {
        let (mut tx, rx) = streaming::channel();
        let inner = self.inner.clone();
        let trace_id = generate_trace_id();
        let span = info_span!("run", trace_id = %trace_id, session = %request.session_key);
        tokio::spawn(
            async move {
                let result = inner.run_loop(&cancel, request, trace_id, &mut tx).await;
                if let Err(ref e) = result {
                    warn!("run failed: {e}");
                }
                tx.finish(result).await;
            }
            .instrument(span),
        );
        rx
    }
}

impl Inner {
    async fn run_loop(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        req: RunRequest,
        trace_id: String,
        tx: &mut EventSender,
    ) -> Result<Usage> {
        let session = self.store.get_or_create(&req.session_key, &req.user).await?;
        self.store
            .append_message(&session.id, Message::user(&req.message))
            .await?;

        let channel = req.channel.clone().unwrap_or_else(|| self.config.channel.clone());
        let tool_defs = self.tools.list();
        let mut st = RunState {
            trace_id,
            started: Instant::now(),
            cost: CostTracker::new(),
            excluded: HashSet::new(),
            pinned: req.model.as_deref().and_then(|m| self.resolve_model(m)),
            compacted: false,
            just_compacted: false,
            overflow_retried: false,
            strict_roles: false,
            role_retries: 0,
        };
        info!(
            "run started: trace_id={}, session={}, channel={channel}, tools={}",
            st.trace_id,
            session.id,
            tool_defs.len()
        );

        let mut iteration: u32 = 0;
        loop {
            if cancel.is_cancelled() || tx.is_closed() {
                return Err(Error::Cancelled);
            }
            iteration += 1;
            if iteration > self.config.max_iterations {
                return Err(Error::IterationLimit(self.config.max_iterations));
            }

            let mut history = self
                .store
                .get_messages(&session.id, self.config.history_limit)
                .await?;

            if let Some(switch) = detect_switch(&history, &self.matcher)
                && st.pinned.as_ref() != Some(&switch.target)
            {
                info!("model switch requested: phrase={:?}, target={}", switch.phrase, switch.target);
                st.excluded.remove(&switch.target);
                st.pinned = Some(switch.target);
            }

            let model = self.pick_model(&history, &st)?;
            let Some(provider) = self.providers.get(&model.provider).cloned() else {
                warn!("no provider instance for {model}, excluding");
                st.excluded.insert(model);
                continue;
            };
            let budget = ContextBudget::new(
                self.catalog
                    .context_window(&model)
                    .unwrap_or(self.config.context_tokens),
            )
            .with_output_reserve(self.config.max_tokens as usize);

            if !st.compacted && budget.is_over_hard_limit(&history) {
                info!(
                    "context over hard limit: usage={:.0}%, compacting",
                    budget.usage_pct(&history) * 100.0
                );
                self.compact(cancel, &session, &history, &mut st).await?;
                history = self
                    .store
                    .get_messages(&session.id, self.config.history_limit)
                    .await?;
            }

            let mut outbound = history;
            let micro_config = self
                .config
                .micro
                .clone()
                .with_warning_threshold(budget.warning_tokens());
            let micro = micro_compact(&mut outbound, &micro_config);
            let pruned = prune(&mut outbound, budget.available(), &self.config.pruning);
            let images = images::strip_acknowledged_images(&mut outbound);
            if micro.trimmed > 0 || pruned.soft_trimmed + pruned.hard_cleared > 0 || images > 0 {
                debug!(
                    "context reduced: micro_trimmed={}, soft_trimmed={}, hard_cleared={}, images={}, tokens={}",
                    micro.trimmed, pruned.soft_trimmed, pruned.hard_cleared, images, pruned.tokens_after
                );
            }
            let summary = self.store.get_summary(&session.id).await?;
            let now = Local::now();
            let rate_limits = provider.rate_limits();
            let steering = {
                let ctx = steering::Context {
                    history: &outbound,
                    session_id: &session.id,
                    channel: &channel,
                    identity: Some(self.config.identity.as_str()),
                    active_task: req.active_task.as_deref(),
                    tasks: &req.tasks,
                    iteration,
                    elapsed: st.started.elapsed(),
                    now,
                    just_compacted: st.just_compacted,
                    rate_limits: rate_limits.as_ref(),
                };
                self.steering.run(&ctx)
            };
            st.just_compacted = false;
            SteeringPipeline::apply(&mut outbound, &steering);
            // After steering, so strict mode folds steering into the user turn.
            normalize_roles(&mut outbound, st.strict_roles);

            let system = build_system_prompt(&PromptParts {
                identity: &self.config.identity,
                channel: &channel,
                has_tools: !tool_defs.is_empty(),
                now,
                active_task: req.active_task.as_deref(),
                summary: summary.as_deref(),
            });
            let request = ChatRequest::new(&model.model, outbound)
                .with_system(system)
                .with_tools(tool_defs.clone())
                .with_max_tokens(self.config.max_tokens);

            debug!(
                "iteration start: span={}, model={model}, messages={}",
                generate_span_id(&st.trace_id, iteration),
                request.messages.len()
            );
            let handles_tools = provider.handles_tools();
            let outcome = match provider.stream(cancel.clone(), request).await {
                Ok(events) => forward(cancel, events, tx, handles_tools).await,
                Err(e) => Err(e),
            };

            let turn = match outcome {
                Ok(turn) => turn,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    self.recover(cancel, &session, &model, e, &mut st).await?;
                    continue;
                }
            };

            let profile = model.to_string();
            st.cost.record(turn.usage, &self.catalog.pricing(&model));
            if let Some(usage) = &self.usage {
                usage.record_usage(&profile, &turn.usage);
            }

            if turn.tool_calls.is_empty() || handles_tools {
                if !turn.text.trim().is_empty() {
                    self.persist(&session, Message::assistant(&turn.text), tx).await?;
                }
                if req.extract_facts && self.config.extract_facts {
                    self.spawn_extraction(&session);
                }
                info!(
                    "run finished: trace_id={}, iterations={iteration}, model={model}, {}",
                    st.trace_id,
                    st.cost.summary()
                );
                return Ok(st.cost.usage());
            }

            self.persist(
                &session,
                Message::assistant_tool_calls(&turn.text, turn.tool_calls.clone()),
                tx,
            )
            .await?;

            let mut results = Vec::with_capacity(turn.tool_calls.len());
            for call in &turn.tool_calls {
                if cancel.is_cancelled() {
                    break;
                }
                let out = self.tools.execute(cancel, call).await;
                let result = if out.is_error {
                    ToolResult::error(&call.id, out.content)
                } else {
                    ToolResult::ok(&call.id, out.content)
                };
                if !cancel.is_cancelled() {
                    tx.send(StreamEvent::ToolResult(result.clone())).await;
                }
                results.push(result);
            }
            if !results.is_empty() {
                self.persist(&session, Message::tool_results(results), tx).await?;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }
    }

    /// Recover from a failed call or return the error that ends the run.
    async fn recover(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        session: &Session,
        model: &ModelRef,
        error: Error,
        st: &mut RunState,
    ) -> Result<()> {
        let message = error.to_string();
        self.errors.log(&model.provider, &error_payload(&error));
        match classify(&error) {
            ErrorClass::ContextOverflow => {
                if st.overflow_retried {
                    return Err(Error::ContextTooLarge(CONTEXT_TOO_LARGE_MESSAGE.into()));
                }
                st.overflow_retried = true;
                info!("context overflow from {model}, compacting and retrying");
                let history = self
                    .store
                    .get_messages(&session.id, self.config.history_limit)
                    .await?;
                self.compact(cancel, session, &history, st).await
            }
            ErrorClass::RateLimitOrAuth => {
                let cooldown = self.selector.mark_failed(model);
                self.record_cooldown(model, cooldown_reason(&message));
                info!("{model} unavailable, cooling down {}s and reselecting", cooldown.as_secs());
                st.excluded.insert(model.clone());
                Ok(())
            }
            ErrorClass::Transport => {
                let cooldown = self.selector.mark_failed(model);
                let reason = match cooldown_reason(&message) {
                    CooldownReason::Timeout => CooldownReason::Timeout,
                    _ => CooldownReason::Other,
                };
                self.record_cooldown(model, reason);
                info!("transport failure on {model}, cooling down {}s and reselecting", cooldown.as_secs());
                st.excluded.insert(model.clone());
                Ok(())
            }
            ErrorClass::RoleOrdering => {
                // Never surfaced; the iteration limit bounds the retries.
                st.role_retries += 1;
                st.strict_roles = true;
                warn!(
                    "role ordering rejected by {model}, resending with strict normalization (attempt {})",
                    st.role_retries
                );
                Ok(())
            }
            ErrorClass::Other => Err(error),
        }
    }

    fn record_cooldown(&self, model: &ModelRef, reason: CooldownReason) {
        if let Some(usage) = &self.usage {
            usage.record_error_with_cooldown(&model.to_string(), reason);
        }
    }

    /// Pinned model if usable, else task routing, else the first loaded
    /// provider's default model.
    fn pick_model(&self, history: &[Message], st: &RunState) -> Result<ModelRef> {
        if let Some(pinned) = &st.pinned
            && self.selector.is_usable(pinned, &st.excluded)
        {
            return Ok(pinned.clone());
        }
        self.selector
            .select(history, &st.excluded)
            .or_else(|| self.selector.fallback(&st.excluded))
            .ok_or_else(|| {
                Error::NoModel(if st.excluded.is_empty() {
                    "no provider is configured with credentials".into()
                } else {
                    format!(
                        "every candidate model failed or is cooling down ({} excluded)",
                        st.excluded.len()
                    )
                })
            })
    }

    /// `provider/model` if configured, otherwise a fuzzy match.
    fn resolve_model(&self, name: &str) -> Option<ModelRef> {
        if let Some(r) = ModelRef::parse(name)
            && self.catalog.model(&r).is_some()
        {
            return Some(r);
        }
        let found = self.matcher.find(name);
        if found.is_none() {
            warn!("model override {name:?} matches no configured model, ignoring");
        }
        found.map(|f| f.target)
    }

    async fn persist(&self, session: &Session, message: Message, tx: &mut EventSender) -> Result<()> {
        self.store.append_message(&session.id, message.clone()).await?;
        tx.send(StreamEvent::Message(message.in_session(&session.id))).await;
        Ok(())
    }

    // ── Compaction ─────────────────────────────────────────────────

    /// Flush facts, replace history with a summary and re-inject recently
    /// used files. Summarization falls back to a deterministic summary.
    async fn compact(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        session: &Session,
        history: &[Message],
        st: &mut RunState,
    ) -> Result<()> {
        let cheap = self.selector.cheapest();
        let cheap_provider = cheap
            .as_ref()
            .and_then(|m| self.providers.get(&m.provider).cloned().map(|p| (m.clone(), p)));

        if let (Some(facts), Some((model, provider))) = (&self.facts, &cheap_provider)
            && let Some(request) = memory::flush_request(&model.model, history)
        {
            let facts = facts.clone();
            let user = session.user.clone();
            let call = complete(provider.clone(), cancel.child_token(), request);
            let saved = isolated("memory flush", self.config.background_timeout, async move {
                let completion = call.await?;
                let found = memory::parse_facts(&completion.text);
                let n = found.len();
                if n > 0 {
                    facts.save_facts(&user, found).await?;
                }
                Ok::<_, Error>((n, completion.usage))
            })
            .await;
            if let Some((n, usage)) = saved {
                debug!("memory flush saved {n} facts");
                st.cost.record(usage, &self.catalog.pricing(model));
            }
        }

        let existing = self.store.get_summary(&session.id).await?;
        let mut summary = None;
        if let Some((model, provider)) = &cheap_provider {
            let (system, user) = build_summarization_request(history, existing.as_deref());
            let request = ChatRequest::new(&model.model, vec![Message::user(user)])
                .with_system(system)
                .with_max_tokens(2048);
            let call = complete(provider.clone(), cancel.child_token(), request);
            if let Some(completion) =
                isolated("compaction summary", self.config.background_timeout, call).await
            {
                st.cost.record(completion.usage, &self.catalog.pricing(model));
                let text = completion.text.trim();
                if !text.is_empty() {
                    summary = Some(text.to_string());
                }
            }
        }
        let summary = summary.unwrap_or_else(|| {
            debug!("using deterministic compaction summary");
            fallback_summary(history, existing.as_deref())
        });

        self.store.compact(&session.id, &summary).await?;
        st.compacted = true;
        st.just_compacted = true;

        let tracker = FileAccessTracker::from_history(history);
        if !tracker.is_empty()
            && let Some(reinjection) = tracker.build_reinjection(&self.config.reinjection).await
        {
            self.store.append_message(&session.id, reinjection).await?;
        }
        info!("compacted session {}: summary_chars={}", session.id, summary.len());
        Ok(())
    }

    // ── Background extraction ──────────────────────────────────────

    fn spawn_extraction(self: &Arc<Self>, session: &Session) {
        let Some(facts) = self.facts.clone() else {
            return;
        };
        let Some(model) = self.selector.cheapest() else {
            debug!("fact extraction skipped: no usable model");
            return;
        };
        let Some(provider) = self.providers.get(&model.provider).cloned() else {
            return;
        };
        let inner = self.clone();
        let session = session.clone();
        tokio::spawn(
            async move {
                let history = match inner
                    .store
                    .get_messages(&session.id, inner.config.history_limit)
                    .await
                {
                    Ok(h) => h,
                    Err(e) => {
                        warn!("fact extraction skipped: {e}");
                        return;
                    }
                };
                let Some(request) = memory::extraction_request(&model.model, &history) else {
                    return;
                };
                let usage = inner.usage.clone();
                let profile = model.to_string();
                let user = session.user.clone();
                let call = complete(provider, CancellationToken::new(), request);
                let saved = isolated("fact extraction", inner.config.background_timeout, async move {
                    let completion = call.await?;
                    if let Some(usage) = &usage {
                        usage.record_usage(&profile, &completion.usage);
                    }
                    let found = memory::parse_facts(&completion.text);
                    let n = found.len();
                    if n > 0 {
                        facts.save_facts(&user, found).await?;
                    }
                    Ok::<_, Error>(n)
                })
                .await;
                if let Some(n) = saved {
                    debug!("fact extraction saved {n} facts");
                }
            }
            .instrument(info_span!("extract_facts")),
        );
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Forward a provider stream to the run stream and gather the turn.
async fn forward(
    cancel: &CancellationToken,
    mut events: EventStream,
    tx: &mut EventSender,
    handles_tools: bool,
) -> Result<Turn> {
    let mut turn = Turn::default();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            event = events.recv() => event,
        };
        let Some(event) = event else {
            debug!("provider stream closed without a terminal event");
            return Ok(turn);
        };
        match event {
            StreamEvent::Text(t) => {
                turn.text.push_str(&t);
                tx.send(StreamEvent::Text(t)).await;
            }
            StreamEvent::Thinking(t) => {
                tx.send(StreamEvent::Thinking(t)).await;
            }
            StreamEvent::ToolCall(call) => {
                tx.send(StreamEvent::ToolCall(call.clone())).await;
                turn.tool_calls.push(call);
            }
            StreamEvent::ToolResult(r) => {
                if handles_tools {
                    tx.send(StreamEvent::ToolResult(r)).await;
                }
            }
            StreamEvent::Message(_) => {}
            StreamEvent::Done(usage) => {
                turn.usage = usage;
                return Ok(turn);
            }
            StreamEvent::Error(e) => return Err(Error::Stream(e)),
        }
        if tx.is_closed() {
            return Err(Error::Cancelled);
        }
    }
}

/// The backend's own payload, so equivalent JSON bodies share a fingerprint.
fn error_payload(error: &Error) -> String {
    match error {
        Error::Http { body, .. } => body.clone(),
        Error::Stream(payload) | Error::Transport(payload) => payload.clone(),
        other => other.to_string(),
    }
}

/// One non-streaming call for background work.
async fn complete(
    provider: Arc<dyn Provider>,
    cancel: CancellationToken,
    request: ChatRequest,
) -> Result<Completion> {
    let events = provider.stream(cancel, request).await?;
    streaming::collect(events).await
}

/// Run `fut` on its own task with a timeout. Failures, timeouts and panics
/// are logged and yield `None`.
async fn isolated<T, F>(what: &str, timeout: Duration, fut: F) -> Option<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let mut handle = tokio::spawn(fut);
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(v))) => Some(v),
        Ok(Ok(Err(e))) => {
            warn!("{what} failed: {e}");
            None
        }
        Ok(Err(join)) => {
            warn!("{what} panicked: {join}");
            None
        }
        Err(_) => {
            handle.abort();
            warn!("{what} timed out after {}s", timeout.as_secs());
            None
        }
    }
}

/// Make the outbound sequence acceptable to strict backends.
///
/// Always: drop empty messages and any leading non-user messages. Strict
/// mode additionally flattens tool calls and results into plain text and
/// merges consecutive same-role messages, so roles strictly alternate.
pub fn normalize_roles(messages: &mut Vec<Message>, strict: bool) {
    messages.retain(|m| m.role == Role::System || !m.is_empty());
    if let Some(first_user) = messages.iter().position(|m| m.role == Role::User) {
        let mut idx = 0;
        messages.retain(|m| {
            let keep = idx >= first_user || m.role == Role::System;
            idx += 1;
            keep
        });
    }
    if !strict {
        return;
    }

    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for m in messages.drain(..) {
        let flat = match m.role {
            Role::System => m,
            Role::Assistant if !m.tool_calls.is_empty() => {
                let mut text = m.content.clone();
                for c in &m.tool_calls {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&format!("[called {}: {}]", c.name, c.input));
                }
                Message::assistant(text)
            }
            Role::Tool => {
                let text = m
                    .tool_results
                    .iter()
                    .map(|r| {
                        let tag = if r.is_error { "tool error" } else { "tool result" };
                        format!("[{tag}]\n{}", r.content)
                    })
                    .collect::<Vec<_>>()
                    .join("\n\n");
                Message::user(text)
            }
            _ => m,
        };
        match out.last_mut() {
            Some(prev) if prev.role == flat.role && flat.role != Role::System => {
                prev.content.push_str("\n\n");
                prev.content.push_str(&flat.content);
            }
            _ => out.push(flat),
        }
    }
    *messages = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use serde_json::json;

    #[test]
    fn lenient_normalization_drops_leading_non_user_and_empties() {
        let mut msgs = vec![
            Message::system("sys"),
            Message::assistant("stale"),
            Message::user("hi"),
            Message::assistant("  "),
            Message::assistant("hello"),
        ];
        normalize_roles(&mut msgs, false);
        let roles: Vec<Role> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    }

    #[test]
    fn strict_normalization_alternates_roles() {
        let mut msgs = vec![
            Message::user("read it"),
            Message::assistant_tool_calls("", vec![ToolCall::new("c1", "read_file", json!({"path": "a"}))]),
            Message::tool_results(vec![ToolResult::ok("c1", "contents")]),
            Message::user("and?"),
            Message::assistant("done"),
        ];
        normalize_roles(&mut msgs, true);
        let roles: Vec<Role> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
        assert!(msgs[1].content.contains("[called read_file"));
        assert!(msgs[2].content.starts_with("[tool result]\ncontents"));
        assert!(msgs[2].content.ends_with("and?"));
        assert!(msgs.iter().all(|m| m.tool_calls.is_empty() && m.tool_results.is_empty()));
    }

    #[test]
    fn run_request_builders() {
        let r = RunRequest::new("k", "u", "hi")
            .with_channel("telegram")
            .with_model("opus")
            .with_active_task("ship")
            .without_extraction();
        assert_eq!(r.channel.as_deref(), Some("telegram"));
        assert_eq!(r.model.as_deref(), Some("opus"));
        assert!(!r.extract_facts);
    }

    #[test]
    fn error_payload_is_the_raw_body() {
        let body = r#"{"error": {"type": "rate_limit_error"}}"#;
        let http = Error::Http {
            provider: "a".into(),
            status: 429,
            body: body.into(),
        };
        assert_eq!(error_payload(&http), body);
        assert_eq!(error_payload(&Error::Stream("Overloaded".into())), "Overloaded");
        assert_eq!(error_payload(&Error::Cancelled), "run cancelled");
    }

    #[tokio::test]
    async fn isolated_contains_panics_and_timeouts() {
        let ok = isolated("ok", Duration::from_secs(1), async { Ok::<_, Error>(5) }).await;
        assert_eq!(ok, Some(5));

        let panicked: Option<u8> = isolated("panic", Duration::from_secs(1), async {
            if true {
                panic!("boom");
            }
            Ok::<u8, Error>(0)
        })
        .await;
        assert!(panicked.is_none());

        let slow: Option<u8> = isolated("slow", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<u8, Error>(1)
        })
        .await;
        assert!(slow.is_none());

        let failed: Option<u8> =
            isolated("fail", Duration::from_secs(1), async { Err::<u8, _>(Error::Tool("x".into())) }).await;
        assert!(failed.is_none());
    }
}
