//! Declarative provider/model configuration loaded from TOML.
//!
//! ```toml
//! [[providers]]
//! id = "anthropic"
//! kind = "anthropic"
//! api_key_env = "ANTHROPIC_API_KEY"
//! default_model = "claude-sonnet-4-5"
//!
//! [[providers.models]]
//! id = "claude-sonnet-4-5"
//! capabilities = ["code", "reasoning", "vision"]
//! input_price = 3.0
//! output_price = 15.0
//!
//! [routing]
//! general = "anthropic/claude-sonnet-4-5"
//! vision = "anthropic/claude-sonnet-4-5"
//!
//! [routing.fallbacks]
//! code = ["local/qwen2.5-coder"]
//!
//! [aliases]
//! smart = "anthropic/claude-opus-4-1"
//!
//! [runner]
//! max_iterations = 40
//! ```
//!
//! Model references are always `provider/model`; the model part may itself
//! contain slashes.

use crate::api::tracing::ModelPricing;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KestrelConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    /// User aliases: `alias = "provider/model"`.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub runner: RunnerOverrides,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    Openai,
    Ollama,
    Cli,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    /// Inline key. Prefer `api_key_env`.
    pub api_key: Option<String>,
    /// Environment variable holding the key.
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    /// Binary for CLI providers (defaults to the provider id).
    pub command: Option<String>,
    /// Argument template for CLI providers; `{model}` is substituted.
    #[serde(default)]
    pub args: Vec<String>,
    pub default_model: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    /// Capability tags such as `vision`, `code`, `reasoning`, `cheap`, `fast`.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// USD per million input tokens.
    pub input_price: Option<f64>,
    /// USD per million output tokens.
    pub output_price: Option<f64>,
    #[serde(default = "default_true")]
    pub active: bool,
    pub context_window: Option<usize>,
}

fn default_true() -> bool {
    true
}

/// Task routing: a primary model per task type plus fallback chains.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    pub general: Option<String>,
    pub code: Option<String>,
    pub reasoning: Option<String>,
    pub vision: Option<String>,
    pub audio: Option<String>,
    /// Task name → ordered fallback model references.
    #[serde(default)]
    pub fallbacks: BTreeMap<String, Vec<String>>,
}

/// `[runner]` table: optional overrides for [`crate::agent::RunnerConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerOverrides {
    pub max_iterations: Option<u32>,
    pub max_tokens: Option<u32>,
    pub context_tokens: Option<usize>,
    pub history_limit: Option<usize>,
    pub identity: Option<String>,
    pub extract_facts: Option<bool>,
    pub background_timeout_secs: Option<u64>,
}

// ── ModelRef ───────────────────────────────────────────────────────

/// A `provider/model` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Split at the first `/`. Both halves must be non-empty.
    pub fn parse(s: &str) -> Option<Self> {
        let (provider, model) = s.trim().split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

// ── Loading ────────────────────────────────────────────────────────

impl KestrelConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&text)?;
        debug!(
            "config loaded: path={}, providers={}",
            path.display(),
            config.providers.len()
        );
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duplicate provider ids and malformed references. Unknown
    /// targets are only warned about: the provider may be added later.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for p in &self.providers {
            if !seen.insert(p.id.as_str()) {
                return Err(Error::Config(format!("duplicate provider id: {}", p.id)));
            }
            if p.id.contains('/') {
                return Err(Error::Config(format!("provider id may not contain '/': {}", p.id)));
            }
        }

        let routing_refs = [
            &self.routing.general,
            &self.routing.code,
            &self.routing.reasoning,
            &self.routing.vision,
            &self.routing.audio,
        ];
        let refs = routing_refs
            .into_iter()
            .flatten()
            .chain(self.routing.fallbacks.values().flatten())
            .chain(self.aliases.values());
        for r in refs {
            let Some(model_ref) = ModelRef::parse(r) else {
                return Err(Error::Config(format!(
                    "invalid model reference {r:?}: expected provider/model"
                )));
            };
            if self.provider(&model_ref.provider).is_none() {
                warn!("model reference {r} names an unknown provider");
            }
        }
        Ok(())
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Configured model entry for a reference, if declared.
    pub fn model(&self, r: &ModelRef) -> Option<&ModelConfig> {
        self.provider(&r.provider)?
            .models
            .iter()
            .find(|m| m.id == r.model)
    }

    /// Every active declared model, in configuration order.
    pub fn active_models(&self) -> impl Iterator<Item = (&ProviderConfig, &ModelConfig)> {
        self.providers
            .iter()
            .flat_map(|p| p.models.iter().filter(|m| m.active).map(move |m| (p, m)))
    }

    /// Pricing for a model; undeclared or unpriced models cost nothing.
    pub fn pricing(&self, r: &ModelRef) -> ModelPricing {
        self.model(r)
            .map(|m| ModelPricing {
                input_per_million: m.input_price.unwrap_or(0.0),
                output_per_million: m.output_price.unwrap_or(0.0),
            })
            .unwrap_or_default()
    }

    /// Context window for a model, if declared.
    pub fn context_window(&self, r: &ModelRef) -> Option<usize> {
        self.model(r).and_then(|m| m.context_window)
    }
}

impl ProviderConfig {
    /// The API key from `api_key` or the `api_key_env` variable.
    pub fn api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key
            && !k.trim().is_empty()
        {
            return Some(k.clone());
        }
        let var = self.api_key_env.as_deref()?;
        std::env::var(var).ok().filter(|v| !v.trim().is_empty())
    }

    /// Whether this provider can serve requests: hosted APIs need a key,
    /// local inference needs nothing, CLIs need their binary on `PATH`.
    pub fn has_credentials(&self) -> bool {
        match self.kind {
            ProviderKind::Anthropic => self.api_key().is_some(),
            // OpenAI-compatible local servers often run keyless.
            ProviderKind::Openai => {
                self.api_key().is_some()
                    || (self.api_key.is_none() && self.api_key_env.is_none() && self.base_url.is_some())
            }
            ProviderKind::Ollama => true,
            ProviderKind::Cli => self.binary_present(),
        }
    }

    /// Whether the CLI binary can be found.
    pub fn binary_present(&self) -> bool {
        let command = self.command.as_deref().unwrap_or(&self.id);
        binary_on_path(command)
    }

    pub fn declares(&self, model: &str) -> bool {
        self.models.iter().any(|m| m.id == model && m.active)
    }

    /// `default_model`, else the first active model.
    pub fn default_model_id(&self) -> Option<&str> {
        self.default_model
            .as_deref()
            .or_else(|| self.models.iter().find(|m| m.active).map(|m| m.id.as_str()))
    }
}

/// Look a command up the way a shell would: paths are checked directly,
/// bare names against each `PATH` entry.
pub fn binary_on_path(command: &str) -> bool {
    let path = Path::new(command);
    if path.components().count() > 1 {
        return path.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).is_file()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[providers]]
id = "anthropic"
kind = "anthropic"
api_key = "sk-test"
default_model = "claude-sonnet"

[[providers.models]]
id = "claude-sonnet"
capabilities = ["code", "vision"]
input_price = 3.0
output_price = 15.0
context_window = 200000

[[providers.models]]
id = "claude-old"
active = false

[[providers]]
id = "local"
kind = "ollama"

[[providers.models]]
id = "library/qwen"

[routing]
general = "anthropic/claude-sonnet"

[routing.fallbacks]
general = ["local/library/qwen"]

[aliases]
smart = "anthropic/claude-sonnet"

[runner]
max_iterations = 7
"#;

    #[test]
    fn parses_sample() {
        let c = KestrelConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(c.providers.len(), 2);
        assert_eq!(c.providers[0].kind, ProviderKind::Anthropic);
        assert!(c.providers[0].has_credentials());
        assert!(c.providers[1].has_credentials());
        assert_eq!(c.active_models().count(), 2);
        assert_eq!(c.runner.max_iterations, Some(7));
        let r = ModelRef::parse("anthropic/claude-sonnet").unwrap();
        assert_eq!(c.pricing(&r).output_per_million, 15.0);
        assert_eq!(c.context_window(&r), Some(200_000));
    }

    #[test]
    fn model_refs_split_at_first_slash() {
        let r = ModelRef::parse("local/library/qwen").unwrap();
        assert_eq!(r.provider, "local");
        assert_eq!(r.model, "library/qwen");
        assert_eq!(r.to_string(), "local/library/qwen");
        assert!(ModelRef::parse("nослэша").is_none());
        assert!(ModelRef::parse("/x").is_none());
    }

    #[test]
    fn rejects_duplicates_and_bad_refs() {
        let dup = "[[providers]]\nid='a'\nkind='ollama'\n[[providers]]\nid='a'\nkind='ollama'\n";
        assert!(KestrelConfig::from_toml_str(dup).is_err());
        let bad = "[routing]\ngeneral = 'no-slash'\n";
        assert!(KestrelConfig::from_toml_str(bad).is_err());
    }

    #[test]
    fn credentials_from_missing_env_var() {
        let c = KestrelConfig::from_toml_str(
            "[[providers]]\nid='x'\nkind='anthropic'\napi_key_env='KESTREL_TEST_UNSET_KEY_VAR'\n",
        )
        .unwrap();
        assert!(!c.providers[0].has_credentials());
    }

    #[test]
    fn default_model_falls_back_to_first_active() {
        let c = KestrelConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(c.providers[1].default_model_id(), Some("library/qwen"));
    }

    #[test]
    fn binary_lookup() {
        assert!(!binary_on_path("kestrel-definitely-missing-binary"));
        assert!(!binary_on_path("/nonexistent/dir/tool"));
    }
}
