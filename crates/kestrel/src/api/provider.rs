//! The [`Provider`] trait every backend adapter implements, plus the
//! orphan filter applied to every outbound request.

use crate::api::ratelimit::RateLimitSnapshot;
use crate::api::streaming::EventStream;
use crate::{ChatRequest, Message, Result, Role};
use async_trait::async_trait;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

/// A backend that can stream a chat completion.
///
/// `stream` either fails immediately (bad status, unreachable host) or
/// returns a bounded channel fed by a background task. The channel carries
/// [`StreamEvent`](crate::StreamEvent)s ending in exactly one `Done`, or one
/// `Error` without `Done`. Cancelling the token stops the background task.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider id as configured (e.g. `"anthropic"`, `"local"`).
    fn id(&self) -> &str;

    /// True for adapters wrapping an autonomous CLI that runs tools itself.
    /// The runner then only relays observed tool calls for display.
    fn handles_tools(&self) -> bool {
        false
    }

    /// Latest rate-limit picture parsed from response headers, if any.
    fn rate_limits(&self) -> Option<RateLimitSnapshot> {
        None
    }

    async fn stream(&self, cancel: CancellationToken, request: ChatRequest) -> Result<EventStream>;
}

/// Drop tool calls without a matching result and results without a matching
/// call, then drop messages left with nothing to send.
///
/// Every adapter applies this before translating messages into its vendor
/// schema, so no request ever carries a dangling half of a pair.
pub fn filter_orphans(messages: &[Message]) -> Vec<Message> {
    let call_ids: HashSet<&str> = messages
        .iter()
        .flat_map(|m| m.tool_calls.iter().map(|c| c.id.as_str()))
        .collect();
    let result_ids: HashSet<&str> = messages
        .iter()
        .flat_map(|m| m.tool_results.iter().map(|r| r.tool_call_id.as_str()))
        .collect();

    messages
        .iter()
        .filter_map(|m| {
            let mut m = m.clone();
            m.tool_calls.retain(|c| result_ids.contains(c.id.as_str()));
            m.tool_results
                .retain(|r| call_ids.contains(r.tool_call_id.as_str()));
            let keep = match m.role {
                Role::Tool => !m.tool_results.is_empty(),
                _ => !m.is_empty(),
            };
            keep.then_some(m)
        })
        .collect()
}

/// Concatenate system-role messages from the history onto the request's
/// system prompt. Backends with a dedicated system field use this.
pub fn merged_system(request: &ChatRequest, messages: &[Message]) -> String {
    let mut system = request.system.clone();
    for m in messages.iter().filter(|m| m.role == Role::System) {
        if m.content.trim().is_empty() {
            continue;
        }
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(&m.content);
    }
    system
}
