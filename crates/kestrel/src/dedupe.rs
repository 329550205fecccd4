//! Duplicate suppression with a TTL and a bounded population.
//!
//! [`DedupeCache`] answers "have I seen this key recently?". The first sighting
//! of a key returns `false` and records it; further sightings within the TTL
//! return `true`. When the population would exceed the maximum, the entry
//! seen longest ago is evicted first.
//!
//! [`ErrorDeduper`] builds on it to log each distinct provider error payload
//! once in full and repeats only as a short "duplicate" line.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for a [`DedupeCache`].
#[derive(Debug, Clone, Copy)]
pub struct DedupeConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_entries: 1024,
        }
    }
}

impl DedupeConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }
}

#[derive(Debug)]
struct Entries {
    last_seen: HashMap<String, Instant>,
}

/// Thread-safe TTL + LRU key cache.
#[derive(Debug)]
pub struct DedupeCache {
    config: DedupeConfig,
    inner: Mutex<Entries>,
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new(DedupeConfig::default())
    }
}

impl DedupeCache {
    pub fn new(config: DedupeConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Entries {
                last_seen: HashMap::new(),
            }),
        }
    }

    /// Record a sighting of `key`. Returns `true` if it was already seen
    /// within the TTL.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let Ok(mut entries) = self.inner.lock() else {
            // A poisoned lock only loses suppression, never correctness.
            return false;
        };
        let ttl = self.config.ttl;
        let seen_recently = entries
            .last_seen
            .get(key)
            .is_some_and(|t| now.saturating_duration_since(*t) < ttl);

        entries.last_seen.insert(key.to_string(), now);
        if !seen_recently {
            entries
                .last_seen
                .retain(|_, t| now.saturating_duration_since(*t) < ttl);
            while entries.last_seen.len() > self.config.max_entries {
                let oldest = entries
                    .last_seen
                    .iter()
                    .min_by_key(|(_, t)| **t)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        entries.last_seen.remove(&k);
                    }
                    None => break,
                }
            }
        }
        seen_recently
    }

    /// Forget every key.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.inner.lock() {
            entries.last_seen.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|e| e.last_seen.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Error fingerprints ─────────────────────────────────────────────

/// Canonical fingerprint of an error payload: JSON objects are rendered with
/// keys sorted at every depth, so payloads differing only in key order share
/// a fingerprint. Non-JSON payloads fingerprint as their trimmed text.
pub fn fingerprint(payload: &str) -> String {
    match serde_json::from_str::<Value>(payload) {
        Ok(v) => canonical_json(&v),
        Err(_) => payload.trim().to_string(),
    }
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Suppresses repeated logging of identical provider errors.
#[derive(Debug, Default)]
pub struct ErrorDeduper {
    cache: DedupeCache,
    duplicates: AtomicUsize,
}

impl ErrorDeduper {
    pub fn new(config: DedupeConfig) -> Self {
        Self {
            cache: DedupeCache::new(config),
            duplicates: AtomicUsize::new(0),
        }
    }

    /// Payloads logged as duplicates so far.
    pub fn duplicates(&self) -> usize {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Whether an identical payload was seen within the window. Records the
    /// sighting either way.
    pub fn is_recent_api_error(&self, payload: &str) -> bool {
        self.cache.check(&fingerprint(payload))
    }

    /// Log a provider error: in full the first time, as a one-liner for
    /// repeats within the window.
    pub fn log(&self, provider: &str, payload: &str) {
        if self.is_recent_api_error(payload) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!("duplicate provider error: provider={provider}");
        } else {
            warn!("provider error: provider={provider}, payload={payload}");
        }
    }

    pub fn clear(&self) {
        self.cache.clear();
        self.duplicates.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_false_then_true_within_ttl() {
        let cache = DedupeCache::new(DedupeConfig::default());
        assert!(!cache.check("k"));
        assert!(cache.check("k"));
        assert!(!cache.check("other"));
    }

    #[test]
    fn expires_after_ttl() {
        let cache = DedupeCache::new(DedupeConfig::default().with_ttl(Duration::from_millis(100)));
        let t0 = Instant::now();
        assert!(!cache.check_at("k", t0));
        assert!(cache.check_at("k", t0 + Duration::from_millis(50)));
        assert!(!cache.check_at("k", t0 + Duration::from_millis(500)));
    }

    #[test]
    fn population_is_bounded_and_oldest_goes_first() {
        let cache = DedupeCache::new(DedupeConfig::default().with_max_entries(3));
        let t0 = Instant::now();
        for (i, k) in ["a", "b", "c", "d"].iter().enumerate() {
            cache.check_at(k, t0 + Duration::from_millis(i as u64));
        }
        assert_eq!(cache.len(), 3);
        let later = t0 + Duration::from_millis(10);
        // "a" was evicted, so it reads as new; "d" is still present.
        assert!(cache.check_at("d", later));
        assert!(!cache.check_at("a", later));
        assert!(cache.len() <= 3);
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = r#"{"error": {"type": "overloaded", "message": "busy"}, "status": 529}"#;
        let b = r#"{"status": 529, "error": {"message": "busy", "type": "overloaded"}}"#;
        assert_eq!(fingerprint(a), fingerprint(b));
        assert_ne!(fingerprint(a), fingerprint(r#"{"status": 500}"#));
        assert_eq!(fingerprint("  plain text "), "plain text");
    }

    #[test]
    fn recent_api_error_false_then_true() {
        let d = ErrorDeduper::default();
        let a = r#"{"b": 1, "a": [1, {"y": 2, "x": 1}]}"#;
        let b = r#"{"a": [1, {"x": 1, "y": 2}], "b": 1}"#;
        assert!(!d.is_recent_api_error(a));
        assert!(d.is_recent_api_error(b));
        d.clear();
        assert!(!d.is_recent_api_error(b));
    }
}
