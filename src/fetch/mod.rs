//! Fetch strategies: interchangeable ways of retrieving a rendered page for
//! one address.

mod http;
mod proxy;
mod session;

pub use http::HttpFetch;
pub use proxy::ProxyFetch;
pub use session::SessionFetch;

use crate::config::WaitSettings;
use crate::error::LookupError;
use crate::types::Network;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Automated browser session from the pool
    Session,
    /// Direct HTTP with browser-like headers
    Http,
    /// HTTP through rotating outbound proxies
    Proxy,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::Session => "session",
            StrategyKind::Http => "http",
            StrategyKind::Proxy => "proxy",
        };
        f.write_str(name)
    }
}

/// What to fetch and how long the attempt may take.
#[derive(Debug, Clone)]
pub struct FetchTarget {
    pub address: String,
    pub network: Network,
    /// Strategies clamp their internal waits so the attempt ends by here.
    pub deadline: Instant,
    /// Session strategy may launch a temporary session beyond pool capacity.
    pub allow_overflow: bool,
}

/// Page content as served or rendered. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
    /// Pre-hydrated client-side state, when the page exposes it
    pub script_state: Option<Value>,
}

#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn fetch(&self, target: &FetchTarget) -> Result<RenderedPage, LookupError>;

    /// Discards whatever identity the upstream has just blocked.
    async fn invalidate(&self) {}
}

/// Page-content markers shared by every strategy.
pub(crate) fn find_marker<'a>(html: &str, markers: &'a [String]) -> Option<&'a str> {
    markers
        .iter()
        .map(String::as_str)
        .find(|m| !m.is_empty() && html.contains(m))
}

/// Classifies a fully loaded page body into a challenge, a block or success.
pub(crate) fn screen_page(url: &str, html: &str, wait: &WaitSettings) -> Result<(), LookupError> {
    if let Some(marker) = find_marker(html, &wait.block_markers) {
        return Err(LookupError::UpstreamBlocked(format!("{} ({})", url, marker)));
    }
    if find_marker(html, &wait.challenge_markers).is_some() {
        return Err(LookupError::ChallengeUnresolved(url.to_string()));
    }
    Ok(())
}
