//! Crate-wide error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Non-success HTTP status from a backend. The `HTTP {status}` rendering
    /// is what [`crate::api::retry`] pattern-matches on.
    #[error("{provider} HTTP {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("no usable model: {0}")]
    NoModel(String),

    #[error("reached the maximum of {0} iterations without completing")]
    IterationLimit(u32),

    #[error("{0}")]
    ContextTooLarge(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Error::Http {
                provider: "http".into(),
                status: status.as_u16(),
                body: e.to_string(),
            };
        }
        Error::Transport(format!("request failed: {e}"))
    }
}

impl Error {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_renders_status_for_classification() {
        let e = Error::Http {
            provider: "anthropic".into(),
            status: 429,
            body: "slow down".into(),
        };
        assert_eq!(e.to_string(), "anthropic HTTP 429: slow down");
        assert_eq!(e.status(), Some(429));
    }

    #[test]
    fn iteration_limit_message_is_verbatim() {
        assert_eq!(
            Error::IterationLimit(25).to_string(),
            "reached the maximum of 25 iterations without completing"
        );
    }
}
