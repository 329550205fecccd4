//! Task classification, routing tables and failure cooldowns.
//!
//! Each model is either available or cooling down after a failure. Every
//! consecutive failure doubles the cooldown, starting at 5 s and capped at an
//! hour; a successful call does not reset it, only [`ModelSelector::clear_failed`]
//! does. Selection walks the task's primary model, then its fallback chain,
//! then the general primary, and returns the first usable entry.

use crate::config::{KestrelConfig, ModelRef, ProviderKind};
use crate::{Message, Role};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// First cooldown step.
pub const BASE_COOLDOWN: Duration = Duration::from_secs(5);

/// Upper bound for any cooldown.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(3600);

// ── Task classification ────────────────────────────────────────────

/// What the current turn needs from a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    General,
    Code,
    Reasoning,
    Vision,
    Audio,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::General => "general",
            TaskType::Code => "code",
            TaskType::Reasoning => "reasoning",
            TaskType::Vision => "vision",
            TaskType::Audio => "audio",
        }
    }

    /// Classify from the most recent user message. Media is detected from
    /// inline data URIs and file extensions before any keyword list.
    pub fn classify(messages: &[Message]) -> Self {
        let Some(text) = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.to_lowercase())
        else {
            return TaskType::General;
        };

        if text.contains("data:image/") || IMAGE_RE.is_match(&text) {
            TaskType::Vision
        } else if text.contains("data:audio/") || AUDIO_RE.is_match(&text) {
            TaskType::Audio
        } else if CODE_RE.is_match(&text) || text.contains("```") {
            TaskType::Code
        } else if REASONING_RE.is_match(&text) {
            TaskType::Reasoning
        } else {
            TaskType::General
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(png|jpe?g|gif|webp|bmp)\b|\b(screenshot|this image|this picture|this photo|look at (this|the) (image|picture|photo))\b")
        .expect("image regex should compile")
});

static AUDIO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(mp3|wav|ogg|m4a|flac|opus)\b|\b(transcribe|transcription|voice (note|message|memo)|audio (file|clip|recording))\b")
        .expect("audio regex should compile")
});

static CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(code|function|compile[sd]?|compiler|bug|refactor|debug|stack ?trace|unit tests?|implement|rust|python|javascript|typescript|golang|sql query|regex|api endpoint|cargo|npm)\b")
        .expect("code regex should compile")
});

static REASONING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(prove|proof|step by step|reason(ing)? (through|about)|think (it )?through|analy[sz]e|trade-?offs?|derive|logic puzzle|math(ematical)?|calculate|why does|why is)\b")
        .expect("reasoning regex should compile")
});

// ── Cooldowns ──────────────────────────────────────────────────────

/// Failure state for one model.
#[derive(Debug, Clone, Copy)]
pub struct CooldownState {
    pub failure_count: u32,
    pub failed_at: Instant,
    pub cooldown_until: Instant,
}

/// `min(5 s × 2^(n-1), 3600 s)` for the nth consecutive failure.
pub fn cooldown_for(failure_count: u32) -> Duration {
    let exp = failure_count.saturating_sub(1).min(20);
    BASE_COOLDOWN
        .saturating_mul(1u32 << exp)
        .min(MAX_COOLDOWN)
}

// ── Selector ───────────────────────────────────────────────────────

/// Routes turns to models and tracks which ones are cooling down.
#[derive(Debug)]
pub struct ModelSelector {
    config: Arc<KestrelConfig>,
    loaded: RwLock<HashSet<String>>,
    cooldowns: RwLock<HashMap<ModelRef, CooldownState>>,
}

impl ModelSelector {
    pub fn new(config: Arc<KestrelConfig>) -> Self {
        Self {
            config,
            loaded: RwLock::new(HashSet::new()),
            cooldowns: RwLock::new(HashMap::new()),
        }
    }

    /// Register the provider ids that have a live adapter instance.
    pub fn with_loaded<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_loaded(ids);
        self
    }

    pub fn set_loaded<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut loaded) = self.loaded.write() {
            *loaded = ids.into_iter().map(Into::into).collect();
        }
    }

    pub fn config(&self) -> &KestrelConfig {
        &self.config
    }

    /// Record a failure and return the cooldown it started.
    pub fn mark_failed(&self, model: &ModelRef) -> Duration {
        self.mark_failed_at(model, Instant::now())
    }

    fn mark_failed_at(&self, model: &ModelRef, now: Instant) -> Duration {
        let Ok(mut cooldowns) = self.cooldowns.write() else {
            return Duration::ZERO;
        };
        let failure_count = cooldowns.get(model).map_or(0, |s| s.failure_count) + 1;
        let cooldown = cooldown_for(failure_count);
        cooldowns.insert(
            model.clone(),
            CooldownState {
                failure_count,
                failed_at: now,
                cooldown_until: now + cooldown,
            },
        );
        info!(
            "model cooling down: model={model}, failures={failure_count}, secs={}",
            cooldown.as_secs()
        );
        cooldown
    }

    /// Reset every cooldown.
    pub fn clear_failed(&self) {
        if let Ok(mut cooldowns) = self.cooldowns.write() {
            cooldowns.clear();
        }
    }

    pub fn cooldown_state(&self, model: &ModelRef) -> Option<CooldownState> {
        self.cooldowns.read().ok()?.get(model).copied()
    }

    /// Time left on a model's cooldown, or `None` if it is available.
    pub fn cooldown_remaining(&self, model: &ModelRef) -> Option<Duration> {
        self.cooldown_remaining_at(model, Instant::now())
    }

    fn cooldown_remaining_at(&self, model: &ModelRef, now: Instant) -> Option<Duration> {
        let state = self.cooldown_state(model)?;
        let left = state.cooldown_until.saturating_duration_since(now);
        (!left.is_zero()).then_some(left)
    }

    pub fn is_cooling_down(&self, model: &ModelRef) -> bool {
        self.cooldown_remaining(model).is_some()
    }

    /// A provider instance is loaded for the model, or the model belongs to
    /// a CLI provider whose binary exists and which declares it.
    pub fn is_available(&self, model: &ModelRef) -> bool {
        let loaded = self
            .loaded
            .read()
            .map(|l| l.contains(&model.provider))
            .unwrap_or(false);
        if loaded {
            return true;
        }
        self.config.provider(&model.provider).is_some_and(|p| {
            p.kind == ProviderKind::Cli && p.declares(&model.model) && p.binary_present()
        })
    }

    pub fn is_usable(&self, model: &ModelRef, excluded: &HashSet<ModelRef>) -> bool {
        !excluded.contains(model) && !self.is_cooling_down(model) && self.is_available(model)
    }

    /// Ordered candidates for a task: primary, fallback chain, general primary.
    pub fn route(&self, task: TaskType) -> Vec<ModelRef> {
        let routing = &self.config.routing;
        let primary = match task {
            TaskType::General => &routing.general,
            TaskType::Code => &routing.code,
            TaskType::Reasoning => &routing.reasoning,
            TaskType::Vision => &routing.vision,
            TaskType::Audio => &routing.audio,
        };
        let mut chain: Vec<ModelRef> = Vec::new();
        let candidates = primary
            .iter()
            .chain(routing.fallbacks.get(task.as_str()).into_iter().flatten())
            .chain(routing.general.iter());
        for r in candidates.filter_map(|s| ModelRef::parse(s)) {
            if !chain.contains(&r) {
                chain.push(r);
            }
        }
        chain
    }

    /// First usable model for the conversation's task, if any.
    pub fn select(&self, messages: &[Message], excluded: &HashSet<ModelRef>) -> Option<ModelRef> {
        let task = TaskType::classify(messages);
        let picked = self
            .route(task)
            .into_iter()
            .find(|r| self.is_usable(r, excluded));
        debug!(
            "model selection: task={task}, picked={}",
            picked.as_ref().map_or("none".to_string(), ToString::to_string)
        );
        picked
    }

    /// Default model of the first loaded provider, unless it is excluded or
    /// cooling down.
    pub fn fallback(&self, excluded: &HashSet<ModelRef>) -> Option<ModelRef> {
        let loaded = self.loaded.read().ok()?;
        let provider = self.config.providers.iter().find(|p| loaded.contains(&p.id))?;
        let r = ModelRef::new(&provider.id, provider.default_model_id()?);
        (!excluded.contains(&r) && !self.is_cooling_down(&r)).then_some(r)
    }

    /// Model for background work: lowest `input + 2 × output` price among
    /// usable priced models, then a `cheap` tag, then `fast`, then anything
    /// active.
    pub fn cheapest(&self) -> Option<ModelRef> {
        let none = HashSet::new();
        let usable: Vec<(ModelRef, &crate::config::ModelConfig)> = self
            .config
            .active_models()
            .map(|(p, m)| (ModelRef::new(&p.id, &m.id), m))
            .filter(|(r, _)| self.is_usable(r, &none))
            .collect();

        let priced = usable
            .iter()
            .filter_map(|(r, m)| {
                let cost = m.input_price? + 2.0 * m.output_price?;
                Some((r, cost))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(r, _)| r.clone());
        let tagged = |tag: &str| {
            usable
                .iter()
                .find(|(_, m)| m.capabilities.iter().any(|c| c == tag))
                .map(|(r, _)| r.clone())
        };
        priced
            .or_else(|| tagged("cheap"))
            .or_else(|| tagged("fast"))
            .or_else(|| usable.first().map(|(r, _)| r.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[[providers]]
id = "anthropic"
kind = "anthropic"
api_key = "k"
default_model = "sonnet"

[[providers.models]]
id = "sonnet"
capabilities = ["code", "vision"]
input_price = 3.0
output_price = 15.0

[[providers.models]]
id = "haiku"
capabilities = ["fast"]
input_price = 1.0
output_price = 5.0

[[providers]]
id = "local"
kind = "ollama"

[[providers.models]]
id = "qwen"
capabilities = ["cheap"]

[routing]
general = "anthropic/sonnet"
code = "local/qwen"
vision = "anthropic/sonnet"

[routing.fallbacks]
code = ["anthropic/haiku"]
"#;

    fn selector() -> ModelSelector {
        let config = KestrelConfig::from_toml_str(CONFIG).unwrap();
        ModelSelector::new(Arc::new(config)).with_loaded(["anthropic", "local"])
    }

    fn r(s: &str) -> ModelRef {
        ModelRef::parse(s).unwrap()
    }

    #[test]
    fn classifies_tasks() {
        let c = |t: &str| TaskType::classify(&[Message::user(t)]);
        assert_eq!(c("what's in this screenshot?"), TaskType::Vision);
        assert_eq!(c("see data:image/png;base64,AAAA"), TaskType::Vision);
        assert_eq!(c("please transcribe memo.m4a"), TaskType::Audio);
        assert_eq!(c("refactor this function"), TaskType::Code);
        assert_eq!(c("prove that sqrt 2 is irrational"), TaskType::Reasoning);
        assert_eq!(c("hello there"), TaskType::General);
        assert_eq!(TaskType::classify(&[]), TaskType::General);
    }

    #[test]
    fn cooldown_doubles_and_caps() {
        assert_eq!(cooldown_for(1), Duration::from_secs(5));
        assert_eq!(cooldown_for(2), Duration::from_secs(10));
        assert_eq!(cooldown_for(3), Duration::from_secs(20));
        assert_eq!(cooldown_for(11), Duration::from_secs(3600));
        assert_eq!(cooldown_for(500), Duration::from_secs(3600));
    }

    #[test]
    fn mark_failed_grows_cooldown() {
        let s = selector();
        let m = r("anthropic/sonnet");
        let t0 = Instant::now();
        for expected in [5u64, 10, 20] {
            s.mark_failed_at(&m, t0);
            let left = s.cooldown_remaining_at(&m, t0).unwrap();
            assert!(left.as_secs().abs_diff(expected) <= 1, "{left:?} vs {expected}");
        }
        for _ in 0..20 {
            s.mark_failed_at(&m, t0);
        }
        assert_eq!(s.cooldown_remaining_at(&m, t0), Some(MAX_COOLDOWN));
        assert_eq!(s.cooldown_remaining_at(&m, t0 + MAX_COOLDOWN), None);

        s.clear_failed();
        assert!(!s.is_cooling_down(&m));
        assert!(s.cooldown_state(&m).is_none());
    }

    #[test]
    fn select_walks_primary_then_fallbacks_then_general() {
        let s = selector();
        let code = [Message::user("fix the bug in this function")];
        let none = HashSet::new();
        assert_eq!(s.select(&code, &none), Some(r("local/qwen")));

        s.mark_failed(&r("local/qwen"));
        assert_eq!(s.select(&code, &none), Some(r("anthropic/haiku")));

        let excluded: HashSet<ModelRef> = [r("anthropic/haiku")].into_iter().collect();
        assert_eq!(s.select(&code, &excluded), Some(r("anthropic/sonnet")));

        let all: HashSet<ModelRef> = [r("anthropic/haiku"), r("anthropic/sonnet")].into_iter().collect();
        assert_eq!(s.select(&code, &all), None);
    }

    #[test]
    fn unloaded_providers_are_unusable() {
        let config = KestrelConfig::from_toml_str(CONFIG).unwrap();
        let s = ModelSelector::new(Arc::new(config)).with_loaded(["local"]);
        let msgs = [Message::user("hello")];
        assert_eq!(s.select(&msgs, &HashSet::new()), None);
        assert!(!s.is_available(&r("anthropic/sonnet")));
    }

    #[test]
    fn fallback_respects_exclusion_and_cooldown() {
        let s = selector();
        let none = HashSet::new();
        assert_eq!(s.fallback(&none), Some(r("anthropic/sonnet")));
        s.mark_failed(&r("anthropic/sonnet"));
        assert_eq!(s.fallback(&none), None);
    }

    #[test]
    fn cheapest_prefers_price_then_tags() {
        let s = selector();
        assert_eq!(s.cheapest(), Some(r("anthropic/haiku")));
        s.mark_failed(&r("anthropic/haiku"));
        s.mark_failed(&r("anthropic/sonnet"));
        // Only the unpriced local model is left; it carries the cheap tag.
        assert_eq!(s.cheapest(), Some(r("local/qwen")));
        s.mark_failed(&r("local/qwen"));
        assert_eq!(s.cheapest(), None);
    }
}
