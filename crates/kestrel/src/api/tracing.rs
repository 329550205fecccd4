//! Correlation ids and cost accounting for runs.
//!
//! Each run gets a `trace_id`; each iteration within it a span id derived
//! from it. Token usage is accumulated per run and priced with the
//! configured per-model rates.

use crate::Usage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Generate a unique trace id for a run.
pub fn generate_trace_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // Counter disambiguates calls within the same clock tick.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{ts:x}-{count:04x}")
}

/// Span id for one iteration of a run.
pub fn generate_span_id(trace_id: &str, iteration: u32) -> String {
    format!("{trace_id}:i{iteration}")
}

/// Per-model pricing (USD per 1M tokens).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn estimate_cost(&self, usage: Usage) -> f64 {
        (usage.input_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (usage.output_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

/// Cumulative usage and cost for one run, including background calls.
#[derive(Debug, Default, Clone)]
pub struct CostTracker {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
    pub calls: u32,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, usage: Usage, pricing: &ModelPricing) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.estimated_cost_usd += pricing.estimate_cost(usage);
        self.calls += 1;
    }

    pub fn usage(&self) -> Usage {
        Usage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "calls: {}, tokens: {} in + {} out = {} total, est. cost: ${:.4}",
            self.calls,
            self.input_tokens,
            self.output_tokens,
            self.input_tokens + self.output_tokens,
            self.estimated_cost_usd,
        )
    }
}
