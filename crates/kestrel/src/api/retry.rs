//! Failure classification for provider errors.
//!
//! The runner never retries blindly. Each failure is sorted into an
//! [`ErrorClass`] that decides the recovery: compact, cool down and reselect,
//! normalize roles and resend, switch models, or surface the error.
//!
//! Classification looks at the HTTP status first and falls back to message
//! patterns, since mid-stream failures only arrive as text.

use crate::Error;

/// Recovery-relevant category of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Request exceeded the model's context window.
    ContextOverflow,
    /// Rate limit, quota, billing or credential failure.
    RateLimitOrAuth,
    /// The backend rejected the message role sequence.
    RoleOrdering,
    /// Connection, timeout or server-side failure.
    Transport,
    Other,
}

/// Reason passed to a usage tracker when a profile is put on cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownReason {
    Billing,
    RateLimit,
    Auth,
    Timeout,
    Other,
}

impl std::fmt::Display for CooldownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CooldownReason::Billing => "billing",
            CooldownReason::RateLimit => "rate_limit",
            CooldownReason::Auth => "auth",
            CooldownReason::Timeout => "timeout",
            CooldownReason::Other => "other",
        };
        f.write_str(s)
    }
}

const OVERFLOW_PATTERNS: &[&str] = &[
    "context length",
    "context_length_exceeded",
    "maximum context",
    "context window",
    "prompt is too long",
    "too many tokens",
    "request too large",
    "input is too long",
];

const ROLE_PATTERNS: &[&str] = &[
    "roles must alternate",
    "must alternate",
    "unexpected role",
    "incorrect role",
    "tool_use` ids were found without",
    "tool_result` block",
    "tool_use_id",
    "must be a response to a preceeding message with 'tool_calls'",
    "must be a response to a preceding message with 'tool_calls'",
    "first message must use the \"user\" role",
];

const RATE_AUTH_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota",
    "overloaded",
    "billing",
    "credit balance",
    "insufficient",
    "unauthorized",
    "invalid api key",
    "invalid x-api-key",
    "authentication",
    "permission",
];

const TRANSPORT_PATTERNS: &[&str] = &[
    "request failed:",
    "transport error",
    "stream error",
    "connection reset",
    "connection refused",
    "connection closed",
    "timed out",
    "timeout",
    "broken pipe",
    "network",
    "unexpected eof",
];

/// Classify a typed error.
pub fn classify(error: &Error) -> ErrorClass {
    match error {
        Error::Transport(_) | Error::Stream(_) | Error::Io(_) => {
            // Transport-shaped errors can still carry an overflow or quota
            // message from a proxy; let the text decide when it does.
            match classify_message(&error.to_string()) {
                ErrorClass::Other => ErrorClass::Transport,
                class => class,
            }
        }
        Error::Http { status, .. } => classify_status(*status, &error.to_string()),
        _ => classify_message(&error.to_string()),
    }
}

fn classify_status(status: u16, message: &str) -> ErrorClass {
    match status {
        429 | 401 | 402 | 403 | 529 => ErrorClass::RateLimitOrAuth,
        413 => ErrorClass::ContextOverflow,
        500..=599 => ErrorClass::Transport,
        _ => classify_message(message),
    }
}

/// Classify a failure known only by its message text.
pub fn classify_message(message: &str) -> ErrorClass {
    for status in ["429", "401", "402", "403", "529", "413", "500", "502", "503", "504"] {
        if message.contains(&format!("HTTP {status}"))
            && let Ok(code) = status.parse::<u16>()
        {
            let class = classify_status(code, "");
            if class != ErrorClass::Other {
                return class;
            }
        }
    }

    let lower = message.to_lowercase();
    let has = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if has(OVERFLOW_PATTERNS) {
        ErrorClass::ContextOverflow
    } else if has(ROLE_PATTERNS) {
        ErrorClass::RoleOrdering
    } else if has(RATE_AUTH_PATTERNS) {
        ErrorClass::RateLimitOrAuth
    } else if has(TRANSPORT_PATTERNS) {
        ErrorClass::Transport
    } else {
        ErrorClass::Other
    }
}

/// Map a rate-limit/auth failure message to the reason a usage tracker
/// records alongside the cooldown.
pub fn cooldown_reason(message: &str) -> CooldownReason {
    let lower = message.to_lowercase();
    if lower.contains("http 402")
        || ["billing", "credit", "payment", "insufficient_quota"]
            .iter()
            .any(|p| lower.contains(p))
    {
        CooldownReason::Billing
    } else if lower.contains("http 429")
        || lower.contains("http 529")
        || ["rate limit", "rate_limit", "too many requests", "overloaded", "quota"]
            .iter()
            .any(|p| lower.contains(p))
    {
        CooldownReason::RateLimit
    } else if lower.contains("http 401")
        || lower.contains("http 403")
        || ["unauthorized", "api key", "x-api-key", "authentication", "permission"]
            .iter()
            .any(|p| lower.contains(p))
    {
        CooldownReason::Auth
    } else if lower.contains("timeout") || lower.contains("timed out") {
        CooldownReason::Timeout
    } else {
        CooldownReason::Other
    }
}
