//! Scripted doubles for the browser, fetch, cache and progress seams.

use crate::cache::KvStore;
use crate::error::LookupError;
use crate::fetch::{FetchStrategy, FetchTarget, RenderedPage, StrategyKind};
use crate::progress::{ProgressEvent, ProgressSink, Stage};
use crate::session::{BrowserDriver, SessionLauncher, BLANK_PAGE};
use crate::types::{LookupResult, Network, Transaction};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub fn sample_result(address: &str, network: Network) -> LookupResult {
    let mut result = LookupResult::empty(address, network);
    result.risk_score = Some(42.0);
    result.risk_level = Some("Moderate".to_string());
    result.risk_type = Some("Exchange".to_string());
    result.labels.insert("Hot Wallet".to_string());
    result.transactions.push(Transaction {
        hash: Some("0xfeed".to_string()),
        date: Some("2024-05-01".to_string()),
        amount: Some("3 ETH".to_string()),
    });
    result.classify();
    result
}

pub fn page_with(html: &str) -> RenderedPage {
    RenderedPage {
        url: "https://upstream.test/page".to_string(),
        html: html.to_string(),
        script_state: None,
    }
}

/// Store whose every call fails, as an unreachable cache server would.
pub struct FailingStore;

fn unavailable<T>() -> Result<T, LookupError> {
    Err(LookupError::CacheUnavailable("connection refused".to_string()))
}

#[async_trait]
impl KvStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, LookupError> {
        unavailable()
    }

    async fn set_with_ttl(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), LookupError> {
        unavailable()
    }

    async fn delete(&self, _key: &str) -> Result<bool, LookupError> {
        unavailable()
    }

    async fn delete_by_prefix(&self, _prefix: &str) -> Result<usize, LookupError> {
        unavailable()
    }

    async fn flush_all(&self) -> Result<(), LookupError> {
        unavailable()
    }
}

/// Browser tab with canned content. Selector checks succeed for the selectors
/// passed to `with_present`.
///
/// A navigation commits its URL right away and then spends
/// `navigation_delay` loading, unless the URL matches `with_slow_commit`, in
/// which case the URL only changes once the delay has passed.
pub struct FakeDriver {
    contents: Mutex<VecDeque<String>>,
    pages: Vec<(String, String)>,
    url: Mutex<String>,
    slow_commit: Option<(String, Duration)>,
    present: Vec<String>,
    state: Option<Value>,
    navigation_delay: Duration,
    navigation_error: Option<LookupError>,
    scrolls: AtomicUsize,
    closed: AtomicBool,
}

impl FakeDriver {
    pub fn new(html: &str) -> Self {
        Self {
            contents: Mutex::new(VecDeque::from([html.to_string()])),
            pages: Vec::new(),
            url: Mutex::new(BLANK_PAGE.to_string()),
            slow_commit: None,
            present: Vec::new(),
            state: None,
            navigation_delay: Duration::ZERO,
            navigation_error: None,
            scrolls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_present(mut self, selectors: &[&str]) -> Self {
        self.present = selectors.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_navigation_delay(mut self, delay: Duration) -> Self {
        self.navigation_delay = delay;
        self
    }

    /// Serves `html` while the tab URL contains `url_part`. Once any page is
    /// registered, other URLs show an empty document.
    pub fn with_page(mut self, url_part: &str, html: &str) -> Self {
        self.pages.push((url_part.to_string(), html.to_string()));
        self
    }

    pub fn with_slow_commit(mut self, url_part: &str, delay: Duration) -> Self {
        self.slow_commit = Some((url_part.to_string(), delay));
        self
    }

    pub fn url(&self) -> String {
        self.url.lock().unwrap().clone()
    }

    pub fn with_navigation_error(mut self, error: LookupError) -> Self {
        self.navigation_error = Some(error);
        self
    }

    /// Content returned from the next read onwards.
    pub fn then_content(self, html: &str) -> Self {
        self.contents
            .lock()
            .unwrap()
            .push_back(html.to_string());
        self
    }

    pub fn scroll_count(&self) -> usize {
        self.scrolls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn navigate(&self, url: &str) -> Result<(), LookupError> {
        if url == BLANK_PAGE {
            *self.url.lock().unwrap() = url.to_string();
            return Ok(());
        }
        match &self.slow_commit {
            Some((part, delay)) if url.contains(part.as_str()) => {
                tokio::time::sleep(*delay).await;
                *self.url.lock().unwrap() = url.to_string();
            }
            _ => {
                *self.url.lock().unwrap() = url.to_string();
                if !self.navigation_delay.is_zero() {
                    tokio::time::sleep(self.navigation_delay).await;
                }
            }
        }
        match &self.navigation_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn current_url(&self) -> Result<Option<String>, LookupError> {
        Ok(Some(self.url()))
    }

    async fn content(&self) -> Result<String, LookupError> {
        if !self.pages.is_empty() {
            let url = self.url();
            return Ok(self
                .pages
                .iter()
                .find(|(part, _)| url.contains(part.as_str()))
                .map(|(_, html)| html.clone())
                .unwrap_or_else(|| "<html><head></head><body></body></html>".to_string()));
        }
        let mut contents = self.contents.lock().unwrap();
        if contents.len() > 1 {
            Ok(contents.pop_front().unwrap_or_default())
        } else {
            Ok(contents.front().cloned().unwrap_or_default())
        }
    }

    async fn evaluate_json(&self, expression: &str) -> Result<Option<Value>, LookupError> {
        if expression.contains("document.querySelector(") {
            let found = self
                .present
                .iter()
                .any(|s| expression.contains(&serde_json::to_string(s).unwrap()));
            return Ok(Some(Value::Bool(found)));
        }
        if expression.contains("scrollTo") {
            self.scrolls.fetch_add(1, Ordering::SeqCst);
            return Ok(Some(Value::Bool(true)));
        }
        Ok(self.state.clone())
    }

    fn is_alive(&self) -> bool {
        !self.is_closed()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

type DriverFactory = Box<dyn Fn() -> FakeDriver + Send + Sync>;

pub struct FakeLauncher {
    factory: DriverFactory,
    drivers: Mutex<Vec<Arc<FakeDriver>>>,
    fail: AtomicBool,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::with_driver(|| FakeDriver::new("<div class=\"container\"></div>").with_present(&[".container"]))
    }
}

impl FakeLauncher {
    pub fn with_driver<F>(factory: F) -> Self
    where
        F: Fn() -> FakeDriver + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            drivers: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn launch_count(&self) -> usize {
        self.drivers.lock().unwrap().len()
    }

    /// Driver of the `index`-th successful launch.
    pub fn driver(&self, index: usize) -> Option<Arc<FakeDriver>> {
        self.drivers.lock().unwrap().get(index).cloned()
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionLauncher for FakeLauncher {
    async fn launch(&self, _id: u64) -> Result<Arc<dyn BrowserDriver>, LookupError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(LookupError::SessionLaunch("scripted launch failure".to_string()));
        }
        let driver = Arc::new((self.factory)());
        self.drivers.lock().unwrap().push(driver.clone());
        Ok(driver)
    }
}

/// Strategy that replays scripted outcomes; the last one repeats.
pub struct ScriptedStrategy {
    kind: StrategyKind,
    responses: Mutex<VecDeque<Result<RenderedPage, LookupError>>>,
    delay: Duration,
    calls: AtomicUsize,
    invalidations: AtomicUsize,
    targets: Mutex<Vec<FetchTarget>>,
}

impl ScriptedStrategy {
    pub fn new(kind: StrategyKind, responses: Vec<Result<RenderedPage, LookupError>>) -> Self {
        Self {
            kind,
            responses: Mutex::new(responses.into()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
            targets: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    pub fn overflow_flags(&self) -> Vec<bool> {
        self.targets.lock().unwrap().iter().map(|t| t.allow_overflow).collect()
    }

    pub fn targets(&self) -> Vec<(String, Network)> {
        self.targets
            .lock()
            .unwrap()
            .iter()
            .map(|t| (t.address.clone(), t.network))
            .collect()
    }
}

#[async_trait]
impl FetchStrategy for ScriptedStrategy {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    async fn fetch(&self, target: &FetchTarget) -> Result<RenderedPage, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().unwrap().push(target.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut responses = self.responses.lock().unwrap();
        let next = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        next.unwrap_or_else(|| Err(LookupError::TransportError("no scripted response".to_string())))
    }

    async fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, ProgressEvent)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(String, ProgressEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.events().into_iter().map(|(_, e)| e.status).collect()
    }

    pub fn progress_values(&self) -> Vec<u8> {
        self.events().into_iter().map(|(_, e)| e.progress).collect()
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, task_id: &str, event: ProgressEvent) {
        self.events.lock().unwrap().push((task_id.to_string(), event));
    }
}

/// Minimal HTTP/1.1 server answering each connection with the next canned
/// `(status, body)`; the last response repeats.
pub struct Responder {
    pub base_url: String,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl Responder {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> String {
        self.requests.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

pub async fn spawn_responder(responses: Vec<(u16, String)>) -> Responder {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let hits = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));

    let (hit_counter, request_log) = (hits.clone(), requests.clone());
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        buffer.extend_from_slice(&chunk[..n]);
                        if buffer.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                }
            }
            if buffer.is_empty() {
                continue;
            }

            let index = hit_counter.fetch_add(1, Ordering::SeqCst);
            request_log
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&buffer).into_owned());

            let (status, body) = responses
                .get(index)
                .or_else(|| responses.last())
                .cloned()
                .unwrap_or((200, String::new()));
            let response = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                reason(status),
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    Responder {
        base_url,
        hits,
        requests,
    }
}
