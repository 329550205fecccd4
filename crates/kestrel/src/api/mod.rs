//! Backend adapters and the streaming contract they share.
//!
//! - [`provider`]: the [`Provider`] trait and the orphan filter.
//! - [`streaming`]: [`StreamEvent`](crate::StreamEvent), the bounded event
//!   channel and wire helpers.
//! - [`anthropic`], [`openai`], [`ollama`], [`cli`]: one adapter per backend
//!   family.
//! - [`ratelimit`]: opportunistic rate-limit header parsing.
//! - [`retry`]: failure classification.
//! - [`tracing`]: run correlation ids and cost accounting.

pub mod anthropic;
pub mod cli;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod ratelimit;
pub mod retry;
pub mod streaming;
pub mod tracing;

pub use provider::{Provider, filter_orphans};
pub use streaming::{EventSender, EventStream, StreamEvent};

use crate::config::{KestrelConfig, ProviderKind};
use crate::{Error, Result, Usage};
use async_trait::async_trait;
use ratelimit::RateLimitSnapshot;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use ::tracing::{info, warn};

/// Loaded provider instances keyed by provider id.
pub type Providers = BTreeMap<String, Arc<dyn Provider>>;

/// Build an adapter for every provider that can actually serve requests:
/// API providers with credentials, local inference, and CLI providers whose
/// binary is on `PATH`. The rest stay unloaded placeholders.
pub fn build_providers(config: &KestrelConfig) -> Result<Providers> {
    let mut providers: Providers = BTreeMap::new();
    for p in &config.providers {
        if !p.has_credentials() {
            info!("provider {} not loaded: no credentials or binary", p.id);
            continue;
        }
        let key = p.api_key().unwrap_or_default();
        let instance: Arc<dyn Provider> = match p.kind {
            ProviderKind::Anthropic => {
                let mut a = anthropic::AnthropicProvider::new(&p.id, key)?;
                if let Some(url) = &p.base_url {
                    a = a.with_base_url(url);
                }
                Arc::new(a)
            }
            ProviderKind::Openai => {
                let mut o = openai::OpenAiProvider::new(&p.id, key)?;
                if let Some(url) = &p.base_url {
                    o = o.with_base_url(url);
                }
                Arc::new(o)
            }
            ProviderKind::Ollama => {
                let mut o = ollama::OllamaProvider::new(&p.id)?;
                if let Some(url) = &p.base_url {
                    o = o.with_base_url(url);
                }
                Arc::new(o)
            }
            ProviderKind::Cli => {
                let command = p.command.clone().unwrap_or_else(|| p.id.clone());
                Arc::new(cli::CliProvider::new(&p.id, command).with_args(p.args.clone()))
            }
        };
        info!("provider loaded: id={}, kind={:?}", p.id, p.kind);
        providers.insert(p.id.clone(), instance);
    }
    Ok(providers)
}

// ── Shared HTTP plumbing ───────────────────────────────────────────

pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("kestrel/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .read_timeout(Duration::from_secs(300))
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))
}

/// Send a request, racing it against cancellation, and turn a non-success
/// status into [`Error::Http`].
pub(crate) async fn post_json(
    provider: &str,
    builder: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> Result<reqwest::Response> {
    let resp = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        r = builder.send() => r.map_err(|e| Error::Transport(format!("request failed: {e}")))?,
    };
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        warn!("{provider} returned HTTP {status}");
        return Err(Error::Http {
            provider: provider.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp)
}

/// Outcome of decoding one line.
#[derive(Debug)]
pub(crate) enum SseFlow {
    Continue,
    /// The backend signalled completion.
    Done(Usage),
}

/// Per-backend line decoder driven by [`pump_lines`].
#[async_trait]
pub(crate) trait LineDecoder: Send {
    async fn on_line(&mut self, line: String, tx: &mut EventSender) -> Result<SseFlow>;

    /// Called when the body ends without a completion signal.
    async fn close(&mut self, tx: &mut EventSender) -> Usage;
}

/// Read a response body chunk by chunk, feeding complete lines to `decoder`
/// until it reports completion or the body ends.
pub(crate) async fn pump_lines<D: LineDecoder>(
    mut resp: reqwest::Response,
    cancel: &CancellationToken,
    tx: &mut EventSender,
    decoder: &mut D,
) -> Result<Usage> {
    let mut lines = streaming::LineBuffer::new();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            c = resp.chunk() => c.map_err(|e| Error::Stream(format!("failed to read streaming chunk: {e}")))?,
        };
        let Some(chunk) = chunk else { break };
        for line in lines.push(&chunk) {
            if let SseFlow::Done(usage) = decoder.on_line(line, tx).await? {
                return Ok(usage);
            }
        }
        if tx.is_closed() {
            return Err(Error::Cancelled);
        }
    }
    if let Some(line) = lines.finish()
        && let SseFlow::Done(usage) = decoder.on_line(line, tx).await?
    {
        return Ok(usage);
    }
    Ok(decoder.close(tx).await)
}

/// Latest rate-limit snapshot seen by an adapter.
#[derive(Debug, Default)]
pub(crate) struct RateLimitCell(RwLock<Option<RateLimitSnapshot>>);

impl RateLimitCell {
    pub(crate) fn update(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(snapshot) = ratelimit::parse_headers(headers)
            && let Ok(mut slot) = self.0.write()
        {
            *slot = Some(snapshot);
        }
    }

    pub(crate) fn get(&self) -> Option<RateLimitSnapshot> {
        self.0.read().ok().and_then(|s| s.clone())
    }
}
