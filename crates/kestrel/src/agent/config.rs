//! Configuration for the [`Runner`](super::runner::Runner).
//!
//! Every knob has a default; override through the builder methods or from
//! the `[runner]` table of the provider config:
//!
//! ```ignore
//! let config = RunnerConfig::default()
//!     .with_max_iterations(40)
//!     .with_identity("You are Kestrel, a terse home assistant.")
//!     .with_overrides(&kestrel_config.runner);
//! ```

use crate::config::RunnerOverrides;
use crate::context::budget::DEFAULT_CONTEXT_TOKENS;
use crate::context::{MicroCompactConfig, PruningConfig, ReinjectionConfig};
use crate::steering::DEFAULT_CHANNEL;
use std::time::Duration;

/// Runner limits and module configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Model calls per run before the run fails. Default: 25.
    pub max_iterations: u32,
    /// Max output tokens per model call. Default: 4096.
    pub max_tokens: u32,
    /// Context window used when the model has none configured.
    pub context_tokens: usize,
    /// Messages loaded from the store each iteration. Default: 200.
    pub history_limit: usize,
    /// Agent identity line placed first in the system prompt.
    pub identity: String,
    /// Extract durable facts in the background after a completed run.
    pub extract_facts: bool,
    /// Timeout for background fact extraction and the pre-compaction flush.
    pub background_timeout: Duration,
    /// Default channel when a request names none.
    pub channel: String,
    pub pruning: PruningConfig,
    pub micro: MicroCompactConfig,
    pub reinjection: ReinjectionConfig,
}

pub const DEFAULT_IDENTITY: &str = "You are Kestrel, a capable autonomous assistant running on the user's machine. \
You can call tools to act on the user's behalf. Be direct and accurate.";

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            max_tokens: 4096,
            context_tokens: DEFAULT_CONTEXT_TOKENS,
            history_limit: 200,
            identity: DEFAULT_IDENTITY.to_string(),
            extract_facts: true,
            background_timeout: Duration::from_secs(30),
            channel: DEFAULT_CHANNEL.to_string(),
            pruning: PruningConfig::default(),
            micro: MicroCompactConfig::default(),
            reinjection: ReinjectionConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn with_context_tokens(mut self, n: usize) -> Self {
        self.context_tokens = n;
        self
    }

    pub fn with_history_limit(mut self, n: usize) -> Self {
        self.history_limit = n;
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_extract_facts(mut self, enabled: bool) -> Self {
        self.extract_facts = enabled;
        self
    }

    pub fn with_background_timeout(mut self, timeout: Duration) -> Self {
        self.background_timeout = timeout;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_pruning(mut self, pruning: PruningConfig) -> Self {
        self.pruning = pruning;
        self
    }

    pub fn with_micro(mut self, micro: MicroCompactConfig) -> Self {
        self.micro = micro;
        self
    }

    pub fn with_reinjection(mut self, reinjection: ReinjectionConfig) -> Self {
        self.reinjection = reinjection;
        self
    }

    /// Apply the `[runner]` table. Unset fields keep their current value.
    pub fn with_overrides(mut self, o: &RunnerOverrides) -> Self {
        if let Some(v) = o.max_iterations {
            self.max_iterations = v;
        }
        if let Some(v) = o.max_tokens {
            self.max_tokens = v;
        }
        if let Some(v) = o.context_tokens {
            self.context_tokens = v;
        }
        if let Some(v) = o.history_limit {
            self.history_limit = v;
        }
        if let Some(ref v) = o.identity {
            self.identity = v.clone();
        }
        if let Some(v) = o.extract_facts {
            self.extract_facts = v;
        }
        if let Some(v) = o.background_timeout_secs {
            self.background_timeout = Duration::from_secs(v);
        }
        self
    }
}
