use super::{find_marker, FetchStrategy, FetchTarget, RenderedPage, StrategyKind};
use crate::browser_pool::{BrowserSessionPool, SessionLease};
use crate::config::{TargetSettings, WaitSettings};
use crate::error::LookupError;
use crate::session::BrowserDriver;
use crate::utils::{remaining, truncate_for_log};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

/// Renders the page in a pooled browser session.
///
/// Waits for the content root, for loading overlays to clear and for a settle
/// period. Each wait gives up on its own; whatever HTML is present then is
/// returned.
pub struct SessionFetch {
    pool: Arc<BrowserSessionPool>,
    target: TargetSettings,
    wait: WaitSettings,
    acquire_timeout: Duration,
}

impl SessionFetch {
    pub fn new(
        pool: Arc<BrowserSessionPool>,
        target: TargetSettings,
        wait: WaitSettings,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            target,
            wait,
            acquire_timeout,
        }
    }

    async fn lease(&self, target: &FetchTarget) -> Result<SessionLease, LookupError> {
        if !target.allow_overflow || !self.pool.allows_overflow() {
            let wait = self.acquire_timeout.min(remaining(target.deadline));
            return self.pool.acquire(wait).await;
        }
        // Take a free slot if one exists right now, else go over capacity
        match self.pool.acquire(Duration::ZERO).await {
            Err(LookupError::PoolExhausted { .. }) => self.pool.acquire_overflow().await,
            other => other,
        }
    }

    async fn render(
        &self,
        lease: &SessionLease,
        driver: &dyn BrowserDriver,
        url: &str,
        deadline: Instant,
    ) -> Result<RenderedPage, LookupError> {
        let nav_budget = self.wait.navigation_timeout.min(remaining(deadline));
        match tokio::time::timeout(nav_budget, driver.reset()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Session {} failed to clear its previous page: {}", lease.id(), e);
                lease.mark_unhealthy();
                return Err(e);
            }
            Err(_) => {
                lease.mark_unhealthy();
                return Err(LookupError::NavigationTimeout(nav_budget));
            }
        }

        let nav_budget = self.wait.navigation_timeout.min(remaining(deadline));
        match tokio::time::timeout(nav_budget, driver.navigate(url)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Navigation to {} failed: {}", url, e);
                lease.mark_unhealthy();
                return Err(e);
            }
            Err(_) => {
                // The tab may still show an earlier document until the target commits
                let current = driver.current_url().await.ok().flatten();
                if !current.as_deref().map_or(false, |c| same_document(c, url)) {
                    warn!(
                        "Navigation to {} not committed after {:?} (tab at {:?})",
                        url, nav_budget, current
                    );
                    lease.mark_unhealthy();
                    return Err(LookupError::NavigationTimeout(nav_budget));
                }
                warn!("Navigation to {} still loading after {:?}, continuing", url, nav_budget);
            }
        }

        let root = [self.wait.root_selector.clone()];
        if !self
            .poll(driver, &root, true, self.wait.root_timeout, deadline)
            .await
        {
            warn!("Content root {:?} not found on {}", self.wait.root_selector, url);
        }

        if !self
            .poll(driver, &self.wait.overlay_selectors, false, self.wait.overlay_timeout, deadline)
            .await
        {
            warn!("Loading overlay still visible on {}", url);
        }

        sleep(self.wait.settle.min(remaining(deadline))).await;

        if self.wait.scroll_to_bottom {
            if let Err(e) = driver.scroll_to_bottom().await {
                debug!("Scroll on {} failed: {}", url, e);
            }
            sleep(self.wait.scroll_settle.min(remaining(deadline))).await;
        }

        let mut html = self.read_content(lease, driver).await?;

        if find_marker(&html, &self.wait.challenge_markers).is_some() {
            let grace = self.wait.challenge_grace.min(remaining(deadline));
            info!("Bot challenge on {}, waiting {:?} for it to clear", url, grace);
            sleep(grace).await;
            html = self.read_content(lease, driver).await?;

            if find_marker(&html, &self.wait.challenge_markers).is_some() {
                lease.mark_unhealthy();
                return Err(LookupError::ChallengeUnresolved(url.to_string()));
            }
        }

        if let Some(marker) = find_marker(&html, &self.wait.block_markers) {
            warn!("Session {} blocked on {}: {}", lease.id(), url, truncate_for_log(marker, 80));
            lease.mark_unhealthy();
            return Err(LookupError::UpstreamBlocked(format!("{} ({})", url, marker)));
        }

        let script_state = match driver.evaluate_json(&self.wait.script_state_expression).await {
            Ok(state) => state,
            Err(e) => {
                debug!("No script state on {}: {}", url, e);
                None
            }
        };

        Ok(RenderedPage {
            url: url.to_string(),
            html,
            script_state,
        })
    }

    async fn read_content(&self, lease: &SessionLease, driver: &dyn BrowserDriver) -> Result<String, LookupError> {
        driver.content().await.map_err(|e| {
            lease.mark_unhealthy();
            e
        })
    }

    /// Polls until any of `selectors` is present (`want_present`) or all are
    /// absent. Returns false when the wait ran out.
    async fn poll(
        &self,
        driver: &dyn BrowserDriver,
        selectors: &[String],
        want_present: bool,
        timeout: Duration,
        deadline: Instant,
    ) -> bool {
        if selectors.is_empty() {
            return true;
        }
        let until = Instant::now() + timeout.min(remaining(deadline));

        loop {
            let mut any_present = false;
            for selector in selectors {
                match driver.element_exists(selector).await {
                    Ok(true) => {
                        any_present = true;
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => debug!("Selector check {:?} failed: {}", selector, e),
                }
            }
            if any_present == want_present {
                return true;
            }
            if Instant::now() >= until {
                return false;
            }
            sleep(self.wait.poll_interval.min(remaining(until))).await;
        }
    }
}

/// True when `current` is the document `target` points at, ignoring query
/// string, fragment and a trailing slash.
fn same_document(current: &str, target: &str) -> bool {
    match (Url::parse(current), Url::parse(target)) {
        (Ok(current), Ok(target)) => {
            current.host_str() == target.host_str()
                && current.path().trim_end_matches('/') == target.path().trim_end_matches('/')
        }
        _ => false,
    }
}

#[async_trait]
impl FetchStrategy for SessionFetch {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Session
    }

    async fn fetch(&self, target: &FetchTarget) -> Result<RenderedPage, LookupError> {
        let url = self.target.session_url(target.network, &target.address);
        let lease = self.lease(target).await?;
        let driver = lease
            .driver()
            .cloned()
            .ok_or_else(|| LookupError::SessionLaunch("lease carries no session".to_string()))?;

        debug!("Session {} fetching {}", lease.id(), url);
        let result = self.render(&lease, driver.as_ref(), &url, target.deadline).await;
        lease.release();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::metrics::Metrics;
    use crate::session::BLANK_PAGE;
    use crate::testing::{FakeDriver, FakeLauncher};
    use crate::types::Network;
    use serde_json::json;

    fn quick_wait() -> WaitSettings {
        WaitSettings {
            navigation_timeout: Duration::from_millis(50),
            root_timeout: Duration::from_millis(50),
            overlay_timeout: Duration::from_millis(50),
            settle: Duration::from_millis(1),
            scroll_settle: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
            challenge_grace: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn strategy(launcher: Arc<FakeLauncher>, capacity: usize) -> (SessionFetch, Arc<BrowserSessionPool>) {
        let pool = BrowserSessionPool::new(
            launcher,
            PoolSettings {
                capacity,
                acquire_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            Arc::new(Metrics::new()),
        );
        let fetch = SessionFetch::new(pool.clone(), TargetSettings::default(), quick_wait(), Duration::from_millis(50));
        (fetch, pool)
    }

    fn target(allow_overflow: bool) -> FetchTarget {
        FetchTarget {
            address: "0x28c6c06298d514db089934071355e5743bf21d60".to_string(),
            network: Network::Eth,
            deadline: Instant::now() + Duration::from_secs(2),
            allow_overflow,
        }
    }

    #[tokio::test]
    async fn test_renders_page_and_reads_script_state() {
        let launcher = Arc::new(FakeLauncher::with_driver(|| {
            FakeDriver::new("<div class=\"container\">ok</div>")
                .with_present(&[".container"])
                .with_state(json!({"riskLevel": "High"}))
        }));
        let (fetch, pool) = strategy(launcher.clone(), 1);

        let page = fetch.fetch(&target(false)).await.unwrap();
        assert!(page.url.ends_with("/eth/0x28c6c06298d514db089934071355e5743bf21d60"));
        assert!(page.html.contains("ok"));
        assert_eq!(page.script_state, Some(json!({"riskLevel": "High"})));
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(launcher.driver(0).unwrap().scroll_count(), 1);
    }

    #[tokio::test]
    async fn test_wait_timeouts_still_return_html() {
        let launcher = Arc::new(FakeLauncher::with_driver(|| {
            FakeDriver::new("<div class=\"partial\">half</div>")
                .with_navigation_delay(Duration::from_millis(200))
                .with_present(&[".loading"])
        }));
        let (fetch, _pool) = strategy(launcher, 1);

        let page = fetch.fetch(&target(false)).await.unwrap();
        assert!(page.html.contains("half"));
    }

    #[tokio::test]
    async fn test_persistent_challenge_marks_session_unhealthy() {
        let launcher = Arc::new(FakeLauncher::with_driver(|| {
            FakeDriver::new("<p>Checking if the site connection is secure</p>")
        }));
        let (fetch, pool) = strategy(launcher.clone(), 1);

        let err = fetch.fetch(&target(false)).await.unwrap_err();
        assert!(matches!(err, LookupError::ChallengeUnresolved(_)));
        assert_eq!(pool.stats().idle, 0);

        fetch.fetch(&target(false)).await.unwrap_err();
        assert_eq!(launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_challenge_that_clears_during_grace_succeeds() {
        let launcher = Arc::new(FakeLauncher::with_driver(|| {
            FakeDriver::new("<p>Just a moment...</p>").then_content("<div class=\"risk-level\">Low</div>")
        }));
        let (fetch, _pool) = strategy(launcher, 1);

        let page = fetch.fetch(&target(false)).await.unwrap();
        assert!(page.html.contains("risk-level"));
    }

    #[tokio::test]
    async fn test_block_page_is_upstream_blocked() {
        let launcher = Arc::new(FakeLauncher::with_driver(|| FakeDriver::new("<h1>Access denied</h1>")));
        let (fetch, pool) = strategy(launcher, 1);

        let err = fetch.fetch(&target(false)).await.unwrap_err();
        assert!(matches!(err, LookupError::UpstreamBlocked(_)));
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[tokio::test]
    async fn test_navigation_error_destroys_session() {
        let launcher = Arc::new(FakeLauncher::with_driver(|| {
            FakeDriver::new("").with_navigation_error(LookupError::TransportError("net::ERR_ABORTED".into()))
        }));
        let (fetch, pool) = strategy(launcher, 1);

        let err = fetch.fetch(&target(false)).await.unwrap_err();
        assert!(matches!(err, LookupError::TransportError(_)));
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_overflow_when_pool_is_busy() {
        let launcher = Arc::new(FakeLauncher::with_driver(|| FakeDriver::new("<div>x</div>")));
        let (fetch, pool) = strategy(launcher.clone(), 1);
        let held = pool.acquire(Duration::from_millis(50)).await.unwrap();

        let err = fetch.fetch(&target(false)).await.unwrap_err();
        assert!(matches!(err, LookupError::PoolExhausted { .. }));

        assert!(fetch.fetch(&target(true)).await.is_ok());
        assert_eq!(pool.stats().overflow, 0);
        assert_eq!(launcher.launch_count(), 2);
        held.release();
    }

    const FIRST: &str = "0x28c6c06298d514db089934071355e5743bf21d60";
    const SECOND: &str = "0x52908400098527886e0f7030069857d2e4169ee7";

    fn target_for(address: &str) -> FetchTarget {
        FetchTarget {
            address: address.to_string(),
            ..target(false)
        }
    }

    #[tokio::test]
    async fn test_uncommitted_navigation_never_returns_previous_page() {
        let launcher = Arc::new(FakeLauncher::with_driver(|| {
            FakeDriver::new("")
                .with_page(FIRST, "<div class=\"container\">first address</div>")
                .with_page(SECOND, "<div class=\"container\">second address</div>")
                .with_slow_commit(SECOND, Duration::from_millis(500))
        }));
        let (fetch, pool) = strategy(launcher.clone(), 1);

        let first = fetch.fetch(&target_for(FIRST)).await.unwrap();
        assert!(first.html.contains("first address"));

        let err = fetch.fetch(&target_for(SECOND)).await.unwrap_err();
        assert!(matches!(err, LookupError::NavigationTimeout(_)), "got {:?}", err);
        assert_eq!(launcher.launch_count(), 1);
        assert_eq!(launcher.driver(0).unwrap().url(), BLANK_PAGE);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[tokio::test]
    async fn test_reused_session_starts_from_blank_page() {
        let launcher = Arc::new(FakeLauncher::with_driver(|| {
            FakeDriver::new("")
                .with_page(FIRST, "<div class=\"container\">first address</div>")
                .with_page(SECOND, "<div class=\"container\">second address</div>")
        }));
        let (fetch, _pool) = strategy(launcher.clone(), 1);

        fetch.fetch(&target_for(FIRST)).await.unwrap();
        let second = fetch.fetch(&target_for(SECOND)).await.unwrap();
        assert!(second.html.contains("second address"));
        assert!(!second.html.contains("first address"));
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_wait_is_bounded_by_deadline() {
        let launcher = Arc::new(FakeLauncher::default());
        let (_, pool) = strategy(launcher, 1);
        let fetch = SessionFetch::new(pool.clone(), TargetSettings::default(), quick_wait(), Duration::from_secs(5));
        let held = pool.acquire(Duration::from_millis(50)).await.unwrap();

        let started = Instant::now();
        let err = fetch
            .fetch(&FetchTarget {
                deadline: Instant::now() + Duration::from_millis(50),
                ..target(false)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::PoolExhausted { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
        held.release();
    }

    #[test]
    fn test_same_document_ignores_query_and_trailing_slash() {
        assert!(same_document("https://up.test/eth/0xabc/?tab=risk", "https://up.test/eth/0xabc"));
        assert!(!same_document("https://up.test/eth/0xdef", "https://up.test/eth/0xabc"));
        assert!(!same_document(BLANK_PAGE, "https://up.test/eth/0xabc"));
    }
}
