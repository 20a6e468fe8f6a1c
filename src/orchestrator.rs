//! Per-address lookup pipeline.
//!
//! `Validating -> CacheCheck -> Fetching(1..=max_retries) -> Extracting ->
//! CacheWrite -> Done`, with `Failed` reachable from every stage. A progress
//! event is emitted on each transition.

use crate::cache::CacheStore;
use crate::config::FetchSettings;
use crate::error::LookupError;
use crate::extractor::Extractor;
use crate::fetch::{FetchStrategy, FetchTarget, RenderedPage};
use crate::metrics::Metrics;
use crate::progress::{NoopSink, ProgressEvent, ProgressSink, ProgressTracker, Stage};
use crate::types::{AddressQuery, LookupResult};
use crate::utils::{exponential_backoff, format_duration, remaining};
use crate::validator;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Slack on top of the attempt budget for a strategy to unwind after its
/// internal waits have been clamped to the deadline.
const ATTEMPT_GRACE: Duration = Duration::from_secs(5);

/// Where a lookup reports progress and how it can be cancelled.
#[derive(Clone)]
pub struct LookupContext {
    task_id: String,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    tracker: Option<Arc<ProgressTracker>>,
}

impl Default for LookupContext {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), Arc::new(NoopSink))
    }
}

impl LookupContext {
    pub fn new(task_id: impl Into<String>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            task_id: task_id.into(),
            sink,
            cancel: CancellationToken::new(),
            tracker: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attaches a task-wide tracker; progress then reflects the whole task
    /// instead of this single lookup.
    pub fn with_tracker(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn stage(&self, address: &str, stage: Stage) {
        match &self.tracker {
            Some(tracker) => tracker.with_current(|progress| {
                self.sink.emit(&self.task_id, ProgressEvent::stage(address, stage, progress))
            }),
            None => self.sink.emit(&self.task_id, ProgressEvent::stage(address, stage, 0)),
        }
    }

    /// Emits the terminal event for `address` and counts it as finished.
    pub(crate) fn finish(&self, address: &str, outcome: &Result<LookupResult, LookupError>) {
        let event = |progress: u8| match outcome {
            Ok(result) => ProgressEvent::done(address, result.clone(), progress),
            Err(e) => ProgressEvent::failed(address, e.to_body(), progress),
        };
        match &self.tracker {
            Some(tracker) => tracker.record_completion(outcome.is_ok(), |progress| {
                self.sink.emit(&self.task_id, event(progress))
            }),
            None => self.sink.emit(&self.task_id, event(100)),
        }
    }
}

/// Runs one address through validation, cache, fetch fallback and
/// extraction.
pub struct LookupOrchestrator {
    cache: Arc<CacheStore>,
    strategies: Vec<Arc<dyn FetchStrategy>>,
    extractor: Arc<Extractor>,
    settings: FetchSettings,
    metrics: Arc<Metrics>,
}

impl LookupOrchestrator {
    pub fn new(
        cache: Arc<CacheStore>,
        strategies: Vec<Arc<dyn FetchStrategy>>,
        extractor: Arc<Extractor>,
        settings: FetchSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache,
            strategies,
            extractor,
            settings,
            metrics,
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn strategies(&self) -> &[Arc<dyn FetchStrategy>] {
        &self.strategies
    }

    /// Looks up one address. Cancelling the context's token drops any
    /// in-flight fetch, which closes the session it held.
    pub async fn lookup(&self, query: &AddressQuery, ctx: &LookupContext) -> Result<LookupResult, LookupError> {
        let started = Instant::now();
        self.metrics.record_lookup_started();

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(LookupError::Cancelled),
            outcome = self.run(query, ctx) => outcome,
        };

        self.metrics.record_lookup(started.elapsed(), outcome.is_ok());
        match &outcome {
            Ok(result) => info!(
                "Lookup {} on {} finished in {}: {:?}",
                result.address,
                result.network,
                format_duration(started.elapsed()),
                result.confidence
            ),
            Err(e) if e.is_validation() => debug!("Rejected {:?}: {}", query.address, e),
            Err(e) => error!("Lookup {} failed: {}", query.address, e),
        }
        ctx.finish(&query.address, &outcome);
        outcome
    }

    async fn run(&self, query: &AddressQuery, ctx: &LookupContext) -> Result<LookupResult, LookupError> {
        ctx.stage(&query.address, Stage::Validating);
        let validation = validator::validate(&query.address);
        if let Some(err) = validation.to_error(&query.address) {
            return Err(err);
        }

        let address = validation
            .normalized_address
            .clone()
            .unwrap_or_else(|| query.address.trim().to_string());
        let network = if validation.supports(query.network) {
            query.network
        } else {
            let resolved = validation
                .candidate_networks
                .first()
                .copied()
                .unwrap_or(query.network);
            warn!(
                "{} is not a {} address, looking it up on {}",
                address, query.network, resolved
            );
            resolved
        };
        let resolved = AddressQuery::new(address, network);

        ctx.stage(&query.address, Stage::CacheCheck);
        if let Some(hit) = self.cache.get(&resolved).await {
            debug!("Serving {} on {} from cache", resolved.address, resolved.network);
            return Ok(hit);
        }

        let page = self.fetch_with_fallback(&resolved, ctx).await?;

        ctx.stage(&query.address, Stage::Extracting);
        let result = self.extract(&page, &resolved);

        if result.is_cacheable() {
            ctx.stage(&query.address, Stage::CacheWrite);
            self.cache.put(&resolved, &result).await;
        } else {
            debug!("{} produced no data; not caching", resolved.address);
        }
        Ok(result)
    }

    /// Tries the strategy chain until one attempt succeeds or the retry
    /// budget is spent.
    ///
    /// * `PoolExhausted` retries the same strategy once with overflow allowed.
    /// * `ChallengeUnresolved` stays on the strategy until `challenge_threshold`
    ///   consecutive challenges, then moves on.
    /// * `UpstreamBlocked` invalidates the strategy's identity and moves on.
    /// * Anything else moves on, wrapping around the chain.
    async fn fetch_with_fallback(
        &self,
        query: &AddressQuery,
        ctx: &LookupContext,
    ) -> Result<RenderedPage, LookupError> {
        if self.strategies.is_empty() {
            return Err(LookupError::Configuration("no fetch strategies configured".to_string()));
        }

        let overall_deadline = Instant::now() + self.settings.overall_timeout;
        let max_attempts = self.settings.max_retries.max(1);
        let mut cursor = 0usize;
        let mut challenges = 0usize;
        let mut overflow_used = false;
        let mut allow_overflow = false;
        let mut attempts = 0usize;
        let mut last_error: Option<LookupError> = None;

        while attempts < max_attempts {
            let left = remaining(overall_deadline);
            if left.is_zero() {
                warn!("Overall fetch budget for {} spent after {} attempts", query.address, attempts);
                break;
            }
            attempts += 1;

            let strategy = &self.strategies[cursor % self.strategies.len()];
            ctx.stage(&query.address, Stage::Fetching { attempt: attempts });

            let budget = self.settings.attempt_timeout.min(left);
            let target = FetchTarget {
                address: query.address.clone(),
                network: query.network,
                deadline: Instant::now() + budget,
                allow_overflow,
            };
            allow_overflow = false;

            debug!(
                "Attempt {}/{} for {} via {}",
                attempts,
                max_attempts,
                query.address,
                strategy.kind()
            );
            let outcome = match tokio::time::timeout(budget + ATTEMPT_GRACE, strategy.fetch(&target)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(LookupError::NavigationTimeout(budget)),
            };

            let err = match outcome {
                Ok(page) => {
                    self.metrics.record_fetch_attempt(true);
                    info!("Fetched {} via {} on attempt {}", query.address, strategy.kind(), attempts);
                    return Ok(page);
                }
                Err(err) => err,
            };

            self.metrics.record_fetch_attempt(false);
            warn!(
                "Attempt {}/{} via {} for {} failed [{}]: {}",
                attempts,
                max_attempts,
                strategy.kind(),
                query.address,
                err.kind(),
                err
            );

            match &err {
                LookupError::PoolExhausted { .. } if !overflow_used => {
                    overflow_used = true;
                    allow_overflow = true;
                }
                LookupError::ChallengeUnresolved(_) => {
                    challenges += 1;
                    if challenges >= self.settings.challenge_threshold.max(1) {
                        challenges = 0;
                        cursor += 1;
                    }
                }
                LookupError::UpstreamBlocked(_) => {
                    strategy.invalidate().await;
                    challenges = 0;
                    cursor += 1;
                }
                _ => {
                    challenges = 0;
                    cursor += 1;
                }
            }
            last_error = Some(err);

            // An overflow retry goes straight out; the pool was the problem,
            // not the upstream.
            if attempts < max_attempts && !allow_overflow {
                let delay = exponential_backoff(&self.settings.retry, attempts).min(remaining(overall_deadline));
                tokio::time::sleep(delay).await;
            }
        }

        Err(LookupError::FetchExhausted {
            attempts,
            last: Box::new(last_error.unwrap_or(LookupError::NavigationTimeout(self.settings.overall_timeout))),
        })
    }

    fn extract(&self, page: &RenderedPage, query: &AddressQuery) -> LookupResult {
        match catch_unwind(AssertUnwindSafe(|| {
            self.extractor.extract(page, &query.address, query.network)
        })) {
            Ok(result) => result,
            Err(_) => {
                error!("Extraction of {} panicked; returning an empty result", page.url);
                LookupResult::empty(query.address.clone(), query.network)
            }
        }
    }
}
