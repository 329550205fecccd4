//! Optional per-profile usage and cooldown accounting.
//!
//! A "profile" is the model reference string (`provider/model`) that served
//! a call. The runner reports every completed call and every failure that put
//! a model on cooldown.

use crate::Usage;
use crate::api::retry::CooldownReason;
use std::collections::BTreeMap;
use std::sync::Mutex;

pub trait UsageTracker: Send + Sync {
    fn record_usage(&self, profile: &str, usage: &Usage);

    fn record_error_with_cooldown(&self, profile: &str, reason: CooldownReason);
}

/// Totals for one profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileUsage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub errors: BTreeMap<String, u64>,
}

/// Process-local tracker.
#[derive(Debug, Default)]
pub struct InMemoryUsageTracker {
    profiles: Mutex<BTreeMap<String, ProfileUsage>>,
}

impl InMemoryUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn profile(&self, profile: &str) -> Option<ProfileUsage> {
        self.profiles.lock().ok()?.get(profile).cloned()
    }

    pub fn reset(&self) {
        if let Ok(mut p) = self.profiles.lock() {
            p.clear();
        }
    }
}

impl UsageTracker for InMemoryUsageTracker {
    fn record_usage(&self, profile: &str, usage: &Usage) {
        if let Ok(mut p) = self.profiles.lock() {
            let entry = p.entry(profile.to_string()).or_default();
            entry.calls += 1;
            entry.input_tokens += usage.input_tokens;
            entry.output_tokens += usage.output_tokens;
        }
    }

    fn record_error_with_cooldown(&self, profile: &str, reason: CooldownReason) {
        if let Ok(mut p) = self.profiles.lock() {
            *p.entry(profile.to_string())
                .or_default()
                .errors
                .entry(reason.to_string())
                .or_default() += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_profile() {
        let t = InMemoryUsageTracker::new();
        let u = Usage {
            input_tokens: 10,
            output_tokens: 5,
        };
        t.record_usage("a/m", &u);
        t.record_usage("a/m", &u);
        t.record_error_with_cooldown("a/m", CooldownReason::RateLimit);
        let p = t.profile("a/m").unwrap();
        assert_eq!(p.calls, 2);
        assert_eq!(p.input_tokens, 20);
        assert_eq!(p.errors.get("rate_limit"), Some(&1));
        assert!(t.profile("b/m").is_none());
        t.reset();
        assert!(t.profile("a/m").is_none());
    }
}
