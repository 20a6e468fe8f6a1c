use super::{screen_page, FetchStrategy, FetchTarget, RenderedPage, StrategyKind};
use crate::config::{HttpSettings, TargetSettings, WaitSettings};
use crate::error::LookupError;
use crate::fingerprint::random_user_agent;
use crate::utils::{remaining, truncate_for_log};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONNECTION, UPGRADE_INSECURE_REQUESTS};
use reqwest::{Client, StatusCode};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builds a client that presents as a desktop browser. A fresh client also
/// means a fresh cookie jar.
pub(crate) fn build_client(
    settings: &HttpSettings,
    user_agent: &str,
    proxy: Option<&str>,
) -> Result<Client, LookupError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    if let Ok(lang) = HeaderValue::from_str(&settings.accept_language) {
        headers.insert(ACCEPT_LANGUAGE, lang);
    }
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));

    let mut builder = Client::builder()
        .user_agent(user_agent)
        .default_headers(headers)
        .cookie_store(true)
        .gzip(true)
        .timeout(settings.request_timeout);

    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy).map_err(|e| LookupError::Configuration(e.to_string()))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| LookupError::TransportError(format!("HTTP client build failed: {}", e)))
}

/// Sends one GET and classifies the response.
pub(crate) async fn get_page(
    client: &Client,
    url: &str,
    wait: &WaitSettings,
    budget: Duration,
) -> Result<RenderedPage, LookupError> {
    if budget.is_zero() {
        return Err(LookupError::NavigationTimeout(Duration::ZERO));
    }

    let response = client.get(url).timeout(budget).send().await.map_err(|e| {
        if e.is_timeout() {
            LookupError::NavigationTimeout(budget)
        } else {
            LookupError::from(e)
        }
    })?;

    let status = response.status();
    if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(LookupError::UpstreamBlocked(format!("HTTP {} from {}", status.as_u16(), url)));
    }
    if !status.is_success() {
        return Err(LookupError::TransportError(format!("HTTP {} from {}", status.as_u16(), url)));
    }

    let body = response.text().await?;
    screen_page(url, &body, wait)?;

    let script_state = match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    };

    debug!("Fetched {} ({} bytes): {}", url, body.len(), truncate_for_log(&body, 120));
    Ok(RenderedPage {
        url: url.to_string(),
        html: body,
        script_state,
    })
}

/// Direct HTTP fetch for endpoints that serve their data without JavaScript.
///
/// On HTTP 403 the identity (user agent and cookie jar) is recreated and the
/// request is retried exactly once.
pub struct HttpFetch {
    settings: HttpSettings,
    target: TargetSettings,
    wait: WaitSettings,
    client: RwLock<Client>,
}

impl HttpFetch {
    pub fn new(settings: HttpSettings, target: TargetSettings, wait: WaitSettings) -> Result<Self, LookupError> {
        let client = build_client(&settings, &random_user_agent(&settings.user_agents), None)?;
        Ok(Self {
            settings,
            target,
            wait,
            client: RwLock::new(client),
        })
    }

    fn client(&self) -> Client {
        self.client.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn recreate_identity(&self) -> Result<(), LookupError> {
        let user_agent = random_user_agent(&self.settings.user_agents);
        let client = build_client(&self.settings, &user_agent, None)?;
        *self.client.write().unwrap_or_else(|p| p.into_inner()) = client;
        info!("HTTP identity recreated");
        Ok(())
    }
}

#[async_trait]
impl FetchStrategy for HttpFetch {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Http
    }

    async fn fetch(&self, target: &FetchTarget) -> Result<RenderedPage, LookupError> {
        let url = self.target.http_url(target.network, &target.address);

        match get_page(&self.client(), &url, &self.wait, remaining(target.deadline)).await {
            Err(LookupError::UpstreamBlocked(reason)) if reason.starts_with("HTTP 403") => {
                warn!("{}; retrying once with a new identity", reason);
                self.recreate_identity()?;
                get_page(&self.client(), &url, &self.wait, remaining(target.deadline)).await
            }
            other => other,
        }
    }

    async fn invalidate(&self) {
        if let Err(e) = self.recreate_identity() {
            warn!("Could not recreate HTTP identity: {}", e);
        }
    }
}
