//! Rate-limit metadata parsed from response headers.
//!
//! Parsing is opportunistic: any header that is missing or malformed is
//! skipped, and a response with no recognizable headers yields `None`.

use chrono::{DateTime, Duration, Utc};
use reqwest::header::HeaderMap;

/// Usage of one rolling quota window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateWindow {
    /// Fraction of the window already consumed (0.0–1.0).
    pub used_fraction: f64,
    pub resets_at: Option<DateTime<Utc>>,
}

impl RateWindow {
    pub fn remaining_fraction(&self) -> f64 {
        (1.0 - self.used_fraction).clamp(0.0, 1.0)
    }
}

/// The latest quota picture reported by a provider.
///
/// `primary` is the short window (5h unified or per-minute tokens),
/// `secondary` the long one (7d unified or per-minute requests).
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitSnapshot {
    pub primary: Option<RateWindow>,
    pub secondary: Option<RateWindow>,
    pub captured_at: DateTime<Utc>,
}

impl RateLimitSnapshot {
    /// Smallest remaining fraction across both windows.
    pub fn min_remaining(&self) -> Option<f64> {
        [self.primary, self.secondary]
            .into_iter()
            .flatten()
            .map(|w| w.remaining_fraction())
            .reduce(f64::min)
    }
}

/// Parse rate-limit headers from Anthropic or OpenAI-style responses.
pub fn parse_headers(headers: &HeaderMap) -> Option<RateLimitSnapshot> {
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    parse_with(get, Utc::now())
}

fn parse_with<'a>(
    get: impl Fn(&str) -> Option<&'a str>,
    now: DateTime<Utc>,
) -> Option<RateLimitSnapshot> {
    // Anthropic unified subscription windows.
    let unified = |window: &str| -> Option<RateWindow> {
        let used = get(&format!("anthropic-ratelimit-unified-{window}-utilization"))?
            .trim()
            .parse::<f64>()
            .ok()?;
        let resets_at = get(&format!("anthropic-ratelimit-unified-{window}-reset"))
            .and_then(|s| s.trim().parse::<i64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        Some(RateWindow {
            used_fraction: used.clamp(0.0, 1.0),
            resets_at,
        })
    };

    // Anthropic per-resource limits.
    let anthropic = |resource: &str| -> Option<RateWindow> {
        let limit = parse_number(get(&format!("anthropic-ratelimit-{resource}-limit"))?)?;
        let remaining = parse_number(get(&format!("anthropic-ratelimit-{resource}-remaining"))?)?;
        let resets_at = get(&format!("anthropic-ratelimit-{resource}-reset"))
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|d| d.with_timezone(&Utc));
        window_from_counts(limit, remaining, resets_at)
    };

    // OpenAI-compatible limits.
    let openai = |resource: &str| -> Option<RateWindow> {
        let limit = parse_number(get(&format!("x-ratelimit-limit-{resource}"))?)?;
        let remaining = parse_number(get(&format!("x-ratelimit-remaining-{resource}"))?)?;
        let resets_at = get(&format!("x-ratelimit-reset-{resource}"))
            .and_then(parse_reset_duration)
            .map(|d| now + d);
        window_from_counts(limit, remaining, resets_at)
    };

    let primary = unified("5h")
        .or_else(|| anthropic("tokens"))
        .or_else(|| openai("tokens"));
    let secondary = unified("7d")
        .or_else(|| anthropic("requests"))
        .or_else(|| openai("requests"));

    if primary.is_none() && secondary.is_none() {
        return None;
    }
    Some(RateLimitSnapshot {
        primary,
        secondary,
        captured_at: now,
    })
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok()
}

fn window_from_counts(
    limit: f64,
    remaining: f64,
    resets_at: Option<DateTime<Utc>>,
) -> Option<RateWindow> {
    if limit <= 0.0 {
        return None;
    }
    Some(RateWindow {
        used_fraction: (1.0 - remaining / limit).clamp(0.0, 1.0),
        resets_at,
    })
}

/// Parse OpenAI reset durations such as `"6m0s"`, `"1.5s"` or `"250ms"`.
fn parse_reset_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let mut total_ms = 0.0_f64;
    let mut number = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let value: f64 = number.parse().ok()?;
        number.clear();
        let unit_ms = match c {
            'h' => 3_600_000.0,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1.0
            }
            'm' => 60_000.0,
            's' => 1_000.0,
            _ => return None,
        };
        total_ms += value * unit_ms;
    }
    if !number.is_empty() {
        // Bare number: seconds.
        total_ms += number.parse::<f64>().ok()? * 1_000.0;
    }
    Some(Duration::milliseconds(total_ms as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(pairs: &[(&str, &str)]) -> Option<RateLimitSnapshot> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        parse_with(|k| map.get(k).map(|s| s.as_str()), now)
    }

    #[test]
    fn absent_headers_are_not_an_error() {
        assert!(parse(&[]).is_none());
        assert!(parse(&[("content-type", "text/event-stream")]).is_none());
    }

    #[test]
    fn anthropic_unified_windows() {
        let snap = parse(&[
            ("anthropic-ratelimit-unified-5h-utilization", "0.85"),
            ("anthropic-ratelimit-unified-5h-reset", "1700003600"),
            ("anthropic-ratelimit-unified-7d-utilization", "0.4"),
        ])
        .unwrap();
        let primary = snap.primary.unwrap();
        assert!((primary.remaining_fraction() - 0.15).abs() < 1e-9);
        assert_eq!(primary.resets_at.unwrap().timestamp(), 1_700_003_600);
        assert!((snap.min_remaining().unwrap() - 0.15).abs() < 1e-9);
    }

    #[test]
    fn openai_token_and_request_windows() {
        let snap = parse(&[
            ("x-ratelimit-limit-tokens", "10000"),
            ("x-ratelimit-remaining-tokens", "9000"),
            ("x-ratelimit-reset-tokens", "6m0s"),
            ("x-ratelimit-limit-requests", "100"),
            ("x-ratelimit-remaining-requests", "10"),
        ])
        .unwrap();
        let primary = snap.primary.unwrap();
        assert!((primary.used_fraction - 0.1).abs() < 1e-9);
        assert_eq!(
            primary.resets_at.unwrap().timestamp(),
            1_700_000_000 + 360
        );
        assert!((snap.secondary.unwrap().remaining_fraction() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn malformed_values_are_skipped() {
        assert!(parse(&[("x-ratelimit-limit-tokens", "lots"), ("x-ratelimit-remaining-tokens", "1")]).is_none());
        assert!(parse(&[("x-ratelimit-limit-tokens", "0"), ("x-ratelimit-remaining-tokens", "0")]).is_none());
    }

    #[test]
    fn reset_durations() {
        assert_eq!(parse_reset_duration("1.5s"), Some(Duration::milliseconds(1500)));
        assert_eq!(parse_reset_duration("250ms"), Some(Duration::milliseconds(250)));
        assert_eq!(parse_reset_duration("1h2m"), Some(Duration::milliseconds(3_720_000)));
        assert_eq!(parse_reset_duration("soon"), None);
    }
}
