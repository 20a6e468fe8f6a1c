//! Automated browser sessions.
//!
//! `BrowserDriver` is the narrow surface the fetch strategies need from a
//! browser tab. `ChromiumLauncher` provides the real implementation on top of
//! chromiumoxide; tests substitute scripted drivers.

use crate::config::{create_browser_config, Config};
use crate::error::LookupError;
use crate::fingerprint::{Fingerprint, STEALTH_SCRIPT};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTimezoneOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), LookupError>;

    /// Current serialized DOM.
    async fn content(&self) -> Result<String, LookupError>;

    /// Evaluates `expression` in the page; `null`/`undefined` map to `None`.
    async fn evaluate_json(&self, expression: &str) -> Result<Option<Value>, LookupError>;

    /// False once the underlying browser connection has gone away.
    fn is_alive(&self) -> bool {
        true
    }

    async fn close(&self);

    async fn element_exists(&self, selector: &str) -> Result<bool, LookupError> {
        let quoted = serde_json::to_string(selector)?;
        let expr = format!("document.querySelector({}) !== null", quoted);
        Ok(matches!(self.evaluate_json(&expr).await?, Some(Value::Bool(true))))
    }

    async fn scroll_to_bottom(&self) -> Result<(), LookupError> {
        self.evaluate_json("window.scrollTo(0, document.body.scrollHeight); true")
            .await
            .map(|_| ())
    }

    /// URL of the document the tab currently shows.
    async fn current_url(&self) -> Result<Option<String>, LookupError> {
        Ok(self
            .evaluate_json("window.location.href")
            .await?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Drops whatever document the tab holds from its previous use.
    async fn reset(&self) -> Result<(), LookupError> {
        self.navigate(BLANK_PAGE).await
    }
}

pub const BLANK_PAGE: &str = "about:blank";

/// Creates new browser sessions for the pool.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, id: u64) -> Result<Arc<dyn BrowserDriver>, LookupError>;
}

pub struct ChromiumLauncher {
    config: Config,
}

impl ChromiumLauncher {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionLauncher for ChromiumLauncher {
    async fn launch(&self, id: u64) -> Result<Arc<dyn BrowserDriver>, LookupError> {
        let fingerprint = Fingerprint::for_session(&self.config.viewport, self.config.user_agent.as_deref());
        let browser_config = create_browser_config(
            &self.config,
            id,
            fingerprint.viewport_width,
            fingerprint.viewport_height,
            Some(&fingerprint.user_agent),
        )?;

        let (mut browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| LookupError::SessionLaunch(e.to_string()))?;

        // The handler drives the CDP connection and must be polled for the
        // browser's whole lifetime
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("Session handler error: {}", e);
                    break;
                }
            }
            debug!("Session handler stream ended");
        });

        let page = match prepare_page(&browser, &fingerprint).await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser.close().await;
                handler_task.abort();
                return Err(e);
            }
        };

        info!(
            "Browser session {} launched ({}x{}, tz {})",
            id, fingerprint.viewport_width, fingerprint.viewport_height, fingerprint.timezone
        );

        Ok(Arc::new(ChromiumDriver {
            id,
            browser: Mutex::new(browser),
            page,
            handler: handler_task,
        }))
    }
}

/// Opens the working tab and applies the desktop fingerprint to it.
async fn prepare_page(browser: &Browser, fingerprint: &Fingerprint) -> Result<Page, LookupError> {
    let launch_err = |e: chromiumoxide::error::CdpError| LookupError::SessionLaunch(e.to_string());

    let page = browser.new_page("about:blank").await.map_err(launch_err)?;

    page.execute(AddScriptToEvaluateOnNewDocumentParams::new(STEALTH_SCRIPT))
        .await
        .map_err(launch_err)?;
    page.execute(SetUserAgentOverrideParams::new(fingerprint.user_agent.clone()))
        .await
        .map_err(launch_err)?;
    page.execute(SetDeviceMetricsOverrideParams::new(
        i64::from(fingerprint.viewport_width),
        i64::from(fingerprint.viewport_height),
        fingerprint.device_scale_factor,
        false,
    ))
    .await
    .map_err(launch_err)?;

    // Timezone emulation is unsupported on some Chromium builds
    if let Err(e) = page
        .execute(SetTimezoneOverrideParams::new(fingerprint.timezone.clone()))
        .await
    {
        warn!("Timezone override rejected: {}", e);
    }

    Ok(page)
}

pub struct ChromiumDriver {
    id: u64,
    browser: Mutex<Browser>,
    page: Page,
    handler: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn navigate(&self, url: &str) -> Result<(), LookupError> {
        self.page.goto(url).await?;
        Ok(())
    }

    async fn content(&self) -> Result<String, LookupError> {
        Ok(self.page.content().await?)
    }

    async fn current_url(&self) -> Result<Option<String>, LookupError> {
        Ok(self.page.url().await?)
    }

    async fn evaluate_json(&self, expression: &str) -> Result<Option<Value>, LookupError> {
        let result = self.page.evaluate(expression).await?;
        Ok(result.value().filter(|v| !v.is_null()).cloned())
    }

    fn is_alive(&self) -> bool {
        !self.handler.is_finished()
    }

    async fn close(&self) {
        if let Err(e) = self.page.clone().close().await {
            debug!("Closing page of session {} failed: {}", self.id, e);
        }
        if let Err(e) = self.browser.lock().await.close().await {
            debug!("Closing browser of session {} failed: {}", self.id, e);
        }
        self.handler.abort();
    }
}
