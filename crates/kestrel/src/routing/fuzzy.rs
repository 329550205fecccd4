//! Natural-language model name resolution.
//!
//! Users say "switch to sonnet", "use the local one" or "opus pls". The
//! matcher keeps an alias table built from configuration and scores every
//! alias against the input; the best-scoring model wins.
//!
//! Alias sources, highest priority first: user aliases, provider defaults
//! (the provider id resolves to its default model), capability tags, tokens
//! of model ids, and provider categories (`api`, `cli`/`terminal`, `local`).

use crate::config::{KestrelConfig, ModelRef, ProviderKind};
use std::collections::HashSet;

/// Matches scoring below this are rejected.
pub const MIN_SCORE: i32 = 30;

const GENERIC_TOKENS: &[&str] = &[
    "latest", "preview", "instruct", "chat", "model", "beta", "alpha", "exp", "experimental",
    "base", "online", "hf",
];

const VARIANT_TOKENS: &[&str] = &[
    "mini", "nano", "pro", "max", "turbo", "flash", "lite", "plus", "thinking",
];

const STOP_WORDS: &[&str] = &[
    "the", "to", "use", "switch", "model", "please", "pls", "one", "a", "an", "with", "and",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AliasSource {
    User,
    ProviderDefault,
    Capability,
    IdToken,
    Category,
}

impl AliasSource {
    fn bonus(self) -> i32 {
        match self {
            AliasSource::User => 12,
            AliasSource::ProviderDefault => 8,
            AliasSource::Capability => 6,
            AliasSource::IdToken => 4,
            AliasSource::Category => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    pub name: String,
    pub target: ModelRef,
    pub source: AliasSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzyMatch {
    pub target: ModelRef,
    pub alias: String,
    pub score: i32,
}

#[derive(Debug, Clone, Default)]
pub struct FuzzyMatcher {
    aliases: Vec<Alias>,
}

impl FuzzyMatcher {
    /// Build the alias table from configuration. Only active models are
    /// reachable; an alias pointing at the same model twice keeps its
    /// highest-priority source.
    pub fn from_config(config: &KestrelConfig) -> Self {
        let mut m = Self::default();
        let active: Vec<ModelRef> = config
            .active_models()
            .map(|(p, model)| ModelRef::new(&p.id, &model.id))
            .collect();

        for (alias, target) in &config.aliases {
            if let Some(r) = ModelRef::parse(target) {
                m.push(alias, r, AliasSource::User);
            }
        }
        for p in &config.providers {
            if let Some(model) = p.default_model_id() {
                m.push(&p.id, ModelRef::new(&p.id, model), AliasSource::ProviderDefault);
            }
        }
        for (p, model) in config.active_models() {
            for cap in &model.capabilities {
                m.push(cap, ModelRef::new(&p.id, &model.id), AliasSource::Capability);
            }
        }
        for r in &active {
            m.push(&r.model, r.clone(), AliasSource::IdToken);
            m.push(&r.to_string(), r.clone(), AliasSource::IdToken);
            for token in id_tokens(&r.model) {
                m.push(&token, r.clone(), AliasSource::IdToken);
            }
        }
        for p in &config.providers {
            let Some(model) = p.default_model_id() else {
                continue;
            };
            let r = ModelRef::new(&p.id, model);
            let categories: &[&str] = match p.kind {
                ProviderKind::Anthropic | ProviderKind::Openai => &["api"],
                ProviderKind::Cli => &["cli", "terminal"],
                ProviderKind::Ollama => &["local"],
            };
            for c in categories {
                m.push(c, r.clone(), AliasSource::Category);
            }
        }
        m
    }

    /// Add an alias. Duplicate `(name, target)` pairs keep the first source,
    /// which is the highest-priority one given the build order.
    pub fn push(&mut self, name: &str, target: ModelRef, source: AliasSource) {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return;
        }
        if self
            .aliases
            .iter()
            .any(|a| a.name == name && a.target == target)
        {
            return;
        }
        self.aliases.push(Alias {
            name,
            target,
            source,
        });
    }

    pub fn aliases(&self) -> &[Alias] {
        &self.aliases
    }

    /// Aliases that resolve to `target`.
    pub fn aliases_for(&self, target: &ModelRef) -> Vec<&str> {
        self.aliases
            .iter()
            .filter(|a| &a.target == target)
            .map(|a| a.name.as_str())
            .collect()
    }

    /// Best match for `input`, or `None` below [`MIN_SCORE`]. Ties go to the
    /// shortest model id, then to the lexically first reference.
    pub fn find(&self, input: &str) -> Option<FuzzyMatch> {
        let query = Query::new(input)?;
        let mut best: Option<FuzzyMatch> = None;
        for alias in &self.aliases {
            let score = score_alias(&query, alias);
            if score < MIN_SCORE {
                continue;
            }
            let candidate = FuzzyMatch {
                target: alias.target.clone(),
                alias: alias.name.clone(),
                score,
            };
            best = Some(match best {
                None => candidate,
                Some(current) => {
                    if better(&candidate, &current) {
                        candidate
                    } else {
                        current
                    }
                }
            });
        }
        best
    }
}

fn better(a: &FuzzyMatch, b: &FuzzyMatch) -> bool {
    (
        -a.score,
        a.target.model.len(),
        a.target.to_string(),
    ) < (-b.score, b.target.model.len(), b.target.to_string())
}

// ── Scoring ────────────────────────────────────────────────────────

struct Query {
    raw: String,
    normalized: String,
    words: Vec<String>,
}

impl Query {
    fn new(input: &str) -> Option<Self> {
        let lower = input.trim().to_lowercase();
        let all = split_words(&lower);
        let words: Vec<String> = all
            .iter()
            .filter(|w| !STOP_WORDS.contains(&w.as_str()))
            .cloned()
            .collect();
        // Filler words are dropped from the text compared against aliases.
        let raw = if words.is_empty() || words.len() == all.len() {
            lower
        } else {
            words.join(" ")
        };
        let normalized = normalize(&raw);
        if normalized.is_empty() {
            return None;
        }
        Some(Self {
            raw,
            normalized,
            words,
        })
    }
}

fn score_alias(q: &Query, alias: &Alias) -> i32 {
    let name = alias.name.as_str();
    let norm = normalize(name);
    if norm.is_empty() {
        return 0;
    }

    let mut base = 0;
    if q.raw == name {
        base = 100;
    } else if q.normalized == norm {
        base = 90;
    } else {
        let (shorter, longer) = if q.normalized.len() <= norm.len() {
            (&q.normalized, &norm)
        } else {
            (&norm, &q.normalized)
        };
        if shorter.len() >= 2 && longer.starts_with(shorter.as_str()) {
            base = base.max(40);
        } else if shorter.len() >= 3 && longer.contains(shorter.as_str()) {
            base = base.max(25);
        }
        let lev = [
            levenshtein_bounded(&q.raw, name, 2),
            levenshtein_bounded(&q.normalized, &norm, 2),
        ]
        .into_iter()
        .flatten()
        .min();
        if let Some(d) = lev
            && norm.len() >= 4
        {
            base = base.max(35 - 5 * d as i32);
        }
    }

    let model_tokens = split_words(&alias.target.model);
    let provider = alias.target.provider.to_lowercase();
    for w in q.words.iter().filter(|w| w.len() >= 2) {
        if split_words(name).contains(w) || model_tokens.contains(w) || &provider == w {
            base += 8;
        }
    }

    if base <= 0 {
        return base;
    }

    for v in VARIANT_TOKENS {
        let asked = q.words.iter().any(|w| w == v);
        let has = model_tokens.iter().any(|t| t == v);
        match (asked, has) {
            (true, true) => base += 10,
            (true, false) => base -= 10,
            (false, true) => base -= 5,
            (false, false) => {}
        }
    }
    base + alias.source.bonus()
}

/// Model-id fragments worth aliasing: at least three characters, not
/// numeric, not generic.
pub fn id_tokens(model: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    split_words(model)
        .into_iter()
        .filter(|t| t.len() >= 3)
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit() || c == '.'))
        .filter(|t| !GENERIC_TOKENS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

fn split_words(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '.')
        .map(|w| w.trim_matches('.'))
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect()
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Edit distance, or `None` once it must exceed `max`.
pub fn levenshtein_bounded(a: &str, b: &str, max: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return None;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        cur[0] = i;
        let mut row_min = cur[0];
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            cur[j] = (prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + cost);
            row_min = row_min.min(cur[j]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    let d = prev[b.len()];
    (d <= max).then_some(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[[providers]]
id = "anthropic"
kind = "anthropic"
api_key = "k"
default_model = "claude-sonnet-4-5"

[[providers.models]]
id = "claude-sonnet-4-5"
capabilities = ["code", "vision"]

[[providers.models]]
id = "claude-opus-4-1"
capabilities = ["reasoning"]

[[providers.models]]
id = "claude-haiku-4-5"
capabilities = ["fast", "cheap"]

[[providers]]
id = "openai"
kind = "openai"
api_key = "k"
default_model = "gpt-4o"

[[providers.models]]
id = "gpt-4o"

[[providers.models]]
id = "gpt-4o-mini"

[[providers]]
id = "claude-cli"
kind = "cli"
command = "claude"
default_model = "sonnet"

[[providers.models]]
id = "sonnet"

[[providers]]
id = "ollama"
kind = "ollama"
default_model = "qwen2.5-coder:7b"

[[providers.models]]
id = "qwen2.5-coder:7b"

[aliases]
smart = "anthropic/claude-opus-4-1"
"#;

    fn matcher() -> FuzzyMatcher {
        FuzzyMatcher::from_config(&KestrelConfig::from_toml_str(CONFIG).unwrap())
    }

    fn target(m: &FuzzyMatcher, input: &str) -> Option<String> {
        m.find(input).map(|f| f.target.to_string())
    }

    #[test]
    fn exact_and_user_aliases() {
        let m = matcher();
        assert_eq!(target(&m, "smart").as_deref(), Some("anthropic/claude-opus-4-1"));
        assert_eq!(target(&m, "gpt-4o").as_deref(), Some("openai/gpt-4o"));
        assert_eq!(target(&m, "anthropic/claude-haiku-4-5").as_deref(), Some("anthropic/claude-haiku-4-5"));
        assert_eq!(target(&m, "anthropic").as_deref(), Some("anthropic/claude-sonnet-4-5"));
    }

    #[test]
    fn tokens_variants_and_categories() {
        let m = matcher();
        assert_eq!(target(&m, "opus").as_deref(), Some("anthropic/claude-opus-4-1"));
        assert_eq!(target(&m, "gpt 4o mini").as_deref(), Some("openai/gpt-4o-mini"));
        assert_eq!(target(&m, "the local one").as_deref(), Some("ollama/qwen2.5-coder:7b"));
        assert_eq!(target(&m, "terminal").as_deref(), Some("claude-cli/sonnet"));
        assert_eq!(target(&m, "reasoning").as_deref(), Some("anthropic/claude-opus-4-1"));
    }

    #[test]
    fn typos_resolve_within_distance() {
        let m = matcher();
        assert_eq!(target(&m, "haikuu").as_deref(), Some("anthropic/claude-haiku-4-5"));
        assert_eq!(target(&m, "opuss").as_deref(), Some("anthropic/claude-opus-4-1"));
        assert_eq!(target(&m, "sonet").as_deref(), Some("claude-cli/sonnet"));
    }

    #[test]
    fn ties_go_to_shortest_model_id() {
        let m = matcher();
        // "sonnet" is an exact alias for both the CLI model and a token of
        // the API model id; the shorter id wins.
        assert_eq!(target(&m, "sonnet").as_deref(), Some("claude-cli/sonnet"));
    }

    #[test]
    fn garbage_is_rejected() {
        let m = matcher();
        assert_eq!(m.find("zzzzqqqq"), None);
        assert_eq!(m.find("   "), None);
        assert_eq!(m.find("x"), None);
    }

    #[test]
    fn deterministic() {
        let m = matcher();
        for input in ["claude", "gpt", "sonnet", "cheap", "qwen coder"] {
            let first = m.find(input);
            for _ in 0..5 {
                assert_eq!(m.find(input), first, "{input}");
            }
        }
    }

    #[test]
    fn id_tokens_skip_short_numeric_and_generic() {
        assert_eq!(id_tokens("claude-3.5-sonnet-latest"), vec!["claude", "sonnet"]);
        assert_eq!(id_tokens("qwen2.5-coder:7b"), vec!["qwen2.5", "coder"]);
    }

    #[test]
    fn bounded_levenshtein() {
        assert_eq!(levenshtein_bounded("kitten", "sitting", 3), Some(3));
        assert_eq!(levenshtein_bounded("kitten", "sitting", 2), None);
        assert_eq!(levenshtein_bounded("same", "same", 0), Some(0));
        assert_eq!(levenshtein_bounded("a", "abcd", 2), None);
    }
}
