//! Configuration management with serde serialization/deserialization
//!
//! Settings for the lookup pipeline: upstream URL templates, browser pool
//! sizing, fetch timeouts and retries, page wait heuristics, HTTP identities,
//! cache TTL and batch chunking.

use crate::error::LookupError;
use crate::extractor::ExtractionRules;
use crate::fetch::StrategyKind;
use crate::types::Network;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the lookup service
///
/// # Examples
///
/// ```rust
/// use aml_lookup::Config;
///
/// let config = Config::default();
/// assert_eq!(config.pool.capacity, 3);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub target: TargetSettings,
    pub pool: PoolSettings,
    pub fetch: FetchSettings,
    pub wait: WaitSettings,
    pub http: HttpSettings,
    pub cache: CacheSettings,
    pub batch: BatchSettings,
    pub viewport: Viewport,
    pub extraction: ExtractionRules,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Fixed User-Agent for browser sessions (default: randomized per session)
    pub user_agent: Option<String>,
}

/// Upstream endpoints. `{network}` expands to the lower-case network token
/// and `{address}` to the address.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetSettings {
    /// Page rendered by browser sessions
    pub url_template: String,

    /// Endpoint fetched by the HTTP strategies; it must not need JavaScript
    pub http_url_template: String,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            url_template: "https://misttrack.io/aml_risks/{network}/{address}".to_string(),
            http_url_template: "https://light.misttrack.io/address/{network}/{address}".to_string(),
        }
    }
}

impl TargetSettings {
    pub fn render(template: &str, network: Network, address: &str) -> String {
        template
            .replace("{network}", &network.as_str().to_ascii_lowercase())
            .replace("{address}", address)
    }

    pub fn session_url(&self, network: Network, address: &str) -> String {
        Self::render(&self.url_template, network, address)
    }

    pub fn http_url(&self, network: Network, address: &str) -> String {
        Self::render(&self.http_url_template, network, address)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum simultaneous browser sessions (default: 3)
    pub capacity: usize,

    /// How long `acquire` waits for a free session (default: 30 seconds)
    pub acquire_timeout: Duration,

    /// Upper bound on launching one browser (default: 30 seconds)
    pub launch_timeout: Duration,

    /// Sessions are destroyed after this many uses (default: 50)
    pub max_session_uses: usize,

    /// Sessions older than this are destroyed on release (default: 30 minutes)
    pub max_session_age: Duration,

    /// Permit one temporary session beyond capacity when the pool is exhausted
    /// (default: true)
    pub allow_overflow: bool,

    /// Run Chrome headless (default: true)
    pub headless: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 3,
            acquire_timeout: Duration::from_secs(30),
            launch_timeout: Duration::from_secs(30),
            max_session_uses: 50,
            max_session_age: Duration::from_secs(30 * 60),
            allow_overflow: true,
            headless: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Bound on a single strategy attempt (default: 30 seconds)
    pub attempt_timeout: Duration,

    /// Bound on the whole fetch loop for one address (default: 90 seconds)
    pub overall_timeout: Duration,

    /// Total fetch attempts across all strategies (default: 3)
    pub max_retries: usize,

    /// Consecutive unresolved challenges before moving to the next strategy
    /// (default: 2)
    pub challenge_threshold: usize,

    /// Backoff between attempts
    pub retry: RetryConfig,

    /// Strategy order, most reliable first
    pub strategies: Vec<StrategyKind>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            overall_timeout: Duration::from_secs(90),
            max_retries: 3,
            challenge_threshold: 2,
            retry: RetryConfig::default(),
            strategies: vec![StrategyKind::Session, StrategyKind::Http, StrategyKind::Proxy],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Page wait heuristics used by browser sessions. Every wait times out on its
/// own without failing the fetch.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WaitSettings {
    /// Bound on the initial page load (default: 20 seconds)
    pub navigation_timeout: Duration,

    /// Element that signals the main content has rendered
    pub root_selector: String,
    pub root_timeout: Duration,

    /// Loading overlays that must disappear before reading the page
    pub overlay_selectors: Vec<String>,
    pub overlay_timeout: Duration,

    /// Pause after the page settles for asynchronous content (default: 5 seconds)
    pub settle: Duration,

    /// Scroll to the bottom to trigger lazy-loaded sections (default: true)
    pub scroll_to_bottom: bool,
    pub scroll_settle: Duration,

    /// Interval between marker polls
    pub poll_interval: Duration,

    /// Page text that indicates a bot challenge interstitial
    pub challenge_markers: Vec<String>,

    /// Extra wait granted once when a challenge is detected (default: 15 seconds)
    pub challenge_grace: Duration,

    /// Page text that indicates the session was blocked outright
    pub block_markers: Vec<String>,

    /// JavaScript expression returning the pre-hydrated state blob, or null
    pub script_state_expression: String,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(20),
            root_selector: ".container".to_string(),
            root_timeout: Duration::from_secs(10),
            overlay_selectors: vec![".loading".to_string(), ".el-loading-mask".to_string()],
            overlay_timeout: Duration::from_secs(10),
            settle: Duration::from_secs(5),
            scroll_to_bottom: true,
            scroll_settle: Duration::from_secs(2),
            poll_interval: Duration::from_millis(250),
            challenge_markers: vec![
                "Checking if the site connection is secure".to_string(),
                "Just a moment...".to_string(),
                "cf-challenge".to_string(),
            ],
            challenge_grace: Duration::from_secs(15),
            block_markers: vec![
                "Access denied".to_string(),
                "Error 1020".to_string(),
                "Sorry, you have been blocked".to_string(),
            ],
            script_state_expression: "(() => { try { return window.__NUXT__.state.address.addressInfo || null; } catch (e) { return null; } })()".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Per-request timeout (default: 30 seconds)
    pub request_timeout: Duration,

    /// User agents rotated when an HTTP identity is recreated
    pub user_agents: Vec<String>,

    pub accept_language: String,

    /// Outbound proxies for the proxy-rotated strategy, e.g. `http://host:port`
    pub proxies: Vec<String>,

    /// Attempts made by the proxy-rotated strategy (default: 5)
    pub proxy_attempts: usize,

    /// Randomized backoff between proxy attempts (default: 2 to 5 seconds)
    pub proxy_backoff_min: Duration,
    pub proxy_backoff_max: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agents: crate::fingerprint::DESKTOP_USER_AGENTS
                .iter()
                .map(|ua| ua.to_string())
                .collect(),
            accept_language: "en-US,en;q=0.9".to_string(),
            proxies: Vec::new(),
            proxy_attempts: 5,
            proxy_backoff_min: Duration::from_secs(2),
            proxy_backoff_max: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,

    /// Entry lifetime (default: 24 hours)
    pub ttl: Duration,

    /// Key prefix separating this service's entries in a shared store
    pub namespace: String,

    /// Redis host; the in-process store is used when unset
    pub host: Option<String>,

    pub port: u16,

    pub db: i64,

    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(86_400),
            namespace: "aml".to_string(),
            host: None,
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Addresses processed concurrently per chunk (default: 5)
    pub chunk_size: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { chunk_size: 5 }
    }
}

/// Browser viewport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    pub device_scale_factor: f64,

    /// Pick a common desktop resolution per session instead of the fixed size
    /// (default: false)
    pub randomize: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            randomize: false,
        }
    }
}

impl Config {
    /// Loads a JSON config file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LookupError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Applies `AML_*` environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), LookupError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`, so callers and tests can
    /// supply their own environment.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), LookupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("AML_TARGET_URL_TEMPLATE") {
            self.target.url_template = v;
        }
        if let Some(v) = get("AML_HTTP_URL_TEMPLATE") {
            self.target.http_url_template = v;
        }
        if let Some(v) = get("AML_POOL_CAPACITY") {
            self.pool.capacity = parse_number("AML_POOL_CAPACITY", &v)?;
        }
        if let Some(v) = get("AML_FETCH_TIMEOUT_SECS") {
            self.fetch.attempt_timeout = Duration::from_secs(parse_number("AML_FETCH_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("AML_OVERALL_TIMEOUT_SECS") {
            self.fetch.overall_timeout =
                Duration::from_secs(parse_number("AML_OVERALL_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("AML_MAX_RETRIES") {
            self.fetch.max_retries = parse_number("AML_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("AML_BATCH_CHUNK_SIZE") {
            self.batch.chunk_size = parse_number("AML_BATCH_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = get("AML_CACHE_TTL_SECS") {
            self.cache.ttl = Duration::from_secs(parse_number("AML_CACHE_TTL_SECS", &v)?);
        }
        if let Some(v) = get("AML_CACHE_NAMESPACE") {
            self.cache.namespace = v;
        }
        if let Some(v) = get("AML_CACHE_HOST") {
            self.cache.host = Some(v);
        }
        if let Some(v) = get("AML_CACHE_PORT") {
            self.cache.port = parse_number("AML_CACHE_PORT", &v)?;
        }
        if let Some(v) = get("AML_CACHE_DB") {
            self.cache.db = parse_number("AML_CACHE_DB", &v)?;
        }
        if let Some(v) = get("AML_CACHE_PASSWORD") {
            self.cache.password = Some(v);
        }
        if let Some(v) = get("AML_PROXIES") {
            self.http.proxies = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = get("AML_CHROME_PATH") {
            self.chrome_path = Some(v);
        }
        if let Some(v) = get("AML_USER_AGENT") {
            self.user_agent = Some(v);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), LookupError> {
        let fail = |msg: &str| Err(LookupError::Configuration(msg.to_string()));

        for (name, template) in [
            ("target.url_template", &self.target.url_template),
            ("target.http_url_template", &self.target.http_url_template),
        ] {
            if template.trim().is_empty() {
                return Err(LookupError::Configuration(format!("{} cannot be empty", name)));
            }
            if !template.contains("{address}") {
                return Err(LookupError::Configuration(format!(
                    "{} must contain an {{address}} placeholder",
                    name
                )));
            }
        }

        if self.pool.capacity == 0 {
            return fail("pool.capacity must be greater than 0");
        }
        if self.pool.acquire_timeout.is_zero() || self.pool.launch_timeout.is_zero() {
            return fail("pool timeouts must be greater than 0");
        }
        if self.pool.max_session_uses == 0 {
            return fail("pool.max_session_uses must be greater than 0");
        }
        if self.fetch.attempt_timeout.is_zero() || self.fetch.overall_timeout.is_zero() {
            return fail("fetch timeouts must be greater than 0");
        }
        if self.fetch.max_retries == 0 {
            return fail("fetch.max_retries must be greater than 0");
        }
        if self.fetch.strategies.is_empty() {
            return fail("fetch.strategies cannot be empty");
        }
        if self.fetch.retry.multiplier < 1.0 {
            return fail("fetch.retry.multiplier must be at least 1.0");
        }
        if self.batch.chunk_size == 0 {
            return fail("batch.chunk_size must be greater than 0");
        }
        if self.cache.ttl.is_zero() {
            return fail("cache.ttl must be greater than 0");
        }
        if self.cache.host.as_deref().map_or(false, |h| h.trim().is_empty()) {
            return fail("cache.host cannot be empty");
        }
        if self.cache.port == 0 || self.cache.db < 0 {
            return fail("cache.port and cache.db must be valid");
        }
        if self.http.proxy_attempts == 0 {
            return fail("http.proxy_attempts must be greater than 0");
        }
        if self.http.proxy_backoff_min > self.http.proxy_backoff_max {
            return fail("http.proxy_backoff_min cannot exceed http.proxy_backoff_max");
        }
        if self.http.user_agents.is_empty() {
            return fail("http.user_agents cannot be empty");
        }
        for proxy in &self.http.proxies {
            if crate::utils::validate_url(proxy).is_err() {
                return Err(LookupError::Configuration(format!(
                    "invalid proxy url {}",
                    crate::utils::redact_proxy(proxy)
                )));
            }
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return fail("viewport dimensions must be greater than 0");
        }

        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, LookupError> {
    raw.parse::<T>()
        .map_err(|_| LookupError::Configuration(format!("{} has invalid value {:?}", key, raw)))
}

/// Chrome command-line arguments for one pooled session.
///
/// Each instance gets its own user-data directory so concurrent browsers do
/// not collide on the profile singleton lock.
pub fn chrome_args(config: &Config, instance_id: u64, user_agent: Option<&str>) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), instance_id);

    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--lang=en-US".to_string(),
        format!("--window-size={},{}", config.viewport.width, config.viewport.height),
        format!("--user-data-dir=/tmp/aml-lookup-chromium-{}", unique_id),
    ];

    if let Some(ua) = user_agent.or(config.user_agent.as_deref()) {
        args.push(format!("--user-agent={ua}"));
    }

    args
}

pub fn create_browser_config(
    config: &Config,
    instance_id: u64,
    width: u32,
    height: u32,
    user_agent: Option<&str>,
) -> Result<chromiumoxide::browser::BrowserConfig, LookupError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(width, height)
        .args(chrome_args(config, instance_id, user_agent));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    if !config.pool.headless {
        builder = builder.with_head();
    }

    builder.build().map_err(LookupError::SessionLaunch)
}
