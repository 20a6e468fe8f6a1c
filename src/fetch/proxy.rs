use super::http::{build_client, get_page};
use super::{FetchStrategy, FetchTarget, RenderedPage, StrategyKind};
use crate::config::{HttpSettings, TargetSettings, WaitSettings};
use crate::error::LookupError;
use crate::fingerprint::random_user_agent;
use crate::utils::{random_backoff, redact_proxy, remaining};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// HTTP fetch routed through a rotating list of outbound proxies.
///
/// Proxies are tried one after another, each with a fresh identity, until one
/// succeeds or the attempt budget runs out. Attempts are separated by a
/// uniformly random backoff.
pub struct ProxyFetch {
    settings: HttpSettings,
    target: TargetSettings,
    wait: WaitSettings,
    cursor: AtomicUsize,
}

impl ProxyFetch {
    pub fn new(settings: HttpSettings, target: TargetSettings, wait: WaitSettings) -> Self {
        Self {
            settings,
            target,
            wait,
            cursor: AtomicUsize::new(0),
        }
    }

    fn next_proxy(&self) -> Option<&str> {
        if self.settings.proxies.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.settings.proxies.len();
        self.settings.proxies.get(index).map(String::as_str)
    }
}

#[async_trait]
impl FetchStrategy for ProxyFetch {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Proxy
    }

    async fn fetch(&self, target: &FetchTarget) -> Result<RenderedPage, LookupError> {
        if self.settings.proxies.is_empty() {
            return Err(LookupError::TransportError("no proxies configured".to_string()));
        }

        let url = self.target.http_url(target.network, &target.address);
        let attempts = self.settings.proxy_attempts;
        let mut last_error = LookupError::TransportError("no proxy attempt was made".to_string());

        for attempt in 1..=attempts {
            let Some(proxy) = self.next_proxy() else {
                break;
            };
            debug!("Proxy attempt {}/{} via {}", attempt, attempts, redact_proxy(proxy));

            let client = build_client(&self.settings, &random_user_agent(&self.settings.user_agents), Some(proxy))?;
            match get_page(&client, &url, &self.wait, remaining(target.deadline)).await {
                Ok(page) => {
                    info!("Fetched {} via proxy {}", url, redact_proxy(proxy));
                    return Ok(page);
                }
                Err(e) => {
                    warn!("Proxy {} failed: {}", redact_proxy(proxy), e);
                    last_error = e;
                }
            }

            if attempt < attempts {
                let left = remaining(target.deadline);
                if left.is_zero() {
                    break;
                }
                let pause = random_backoff(self.settings.proxy_backoff_min, self.settings.proxy_backoff_max);
                tokio::time::sleep(pause.min(left)).await;
            }
        }

        Err(last_error)
    }

    async fn invalidate(&self) {
        // Skip past the proxy that was just blocked
        self.cursor.fetch_add(1, Ordering::Relaxed);
    }
}
