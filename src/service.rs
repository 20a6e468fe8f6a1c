use crate::batch::BatchCoordinator;
use crate::browser_pool::{BrowserSessionPool, PoolStats};
use crate::cache::{store_for, CacheStore, KvStore};
use crate::config::Config;
use crate::error::LookupError;
use crate::extractor::Extractor;
use crate::fetch::{FetchStrategy, HttpFetch, ProxyFetch, SessionFetch, StrategyKind};
use crate::metrics::Metrics;
use crate::orchestrator::{LookupContext, LookupOrchestrator};
use crate::progress::ProgressSink;
use crate::session::{ChromiumLauncher, SessionLauncher};
use crate::types::{AddressBatch, AddressQuery, LookupResult, LookupTask};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the shared pool, cache and strategy chain for one process.
///
/// Construction and teardown are explicit: build it with `new`, hand out
/// references, and call `shutdown` before exit.
pub struct LookupService {
    config: Config,
    metrics: Arc<Metrics>,
    pool: Arc<BrowserSessionPool>,
    orchestrator: Arc<LookupOrchestrator>,
    batch: BatchCoordinator,
}

impl LookupService {
    /// Builds a service backed by Chromium sessions. The cache lives in
    /// Redis when `cache.host` is set and in process memory otherwise.
    pub fn new(config: Config) -> Result<Self, LookupError> {
        let launcher = Arc::new(ChromiumLauncher::new(config.clone()));
        let store = store_for(&config.cache)?;
        Self::with_parts(config, launcher, store)
    }

    pub fn with_parts(
        config: Config,
        launcher: Arc<dyn SessionLauncher>,
        store: Arc<dyn KvStore>,
    ) -> Result<Self, LookupError> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new());

        let cache = Arc::new(if config.cache.enabled {
            CacheStore::new(store, config.cache.namespace.clone(), config.cache.ttl, metrics.clone())
        } else {
            CacheStore::disabled(metrics.clone())
        });

        let pool = BrowserSessionPool::new(launcher, config.pool.clone(), metrics.clone());
        let strategies = Self::build_strategies(&config, &pool)?;
        info!(
            "Lookup service ready: pool capacity {}, strategies {:?}",
            config.pool.capacity,
            strategies.iter().map(|s| s.kind()).collect::<Vec<_>>()
        );

        let orchestrator = Arc::new(LookupOrchestrator::new(
            cache,
            strategies,
            Arc::new(Extractor::new(config.extraction.clone())),
            config.fetch.clone(),
            metrics.clone(),
        ));
        let batch = BatchCoordinator::new(orchestrator.clone(), config.batch.chunk_size);

        Ok(Self {
            config,
            metrics,
            pool,
            orchestrator,
            batch,
        })
    }

    fn build_strategies(
        config: &Config,
        pool: &Arc<BrowserSessionPool>,
    ) -> Result<Vec<Arc<dyn FetchStrategy>>, LookupError> {
        let mut strategies: Vec<Arc<dyn FetchStrategy>> = Vec::new();
        for kind in &config.fetch.strategies {
            match kind {
                StrategyKind::Session => strategies.push(Arc::new(SessionFetch::new(
                    pool.clone(),
                    config.target.clone(),
                    config.wait.clone(),
                    config.pool.acquire_timeout,
                ))),
                StrategyKind::Http => strategies.push(Arc::new(HttpFetch::new(
                    config.http.clone(),
                    config.target.clone(),
                    config.wait.clone(),
                )?)),
                StrategyKind::Proxy if config.http.proxies.is_empty() => {
                    warn!("Proxy strategy configured without proxies; skipping it");
                }
                StrategyKind::Proxy => strategies.push(Arc::new(ProxyFetch::new(
                    config.http.clone(),
                    config.target.clone(),
                    config.wait.clone(),
                ))),
            }
        }
        if strategies.is_empty() {
            return Err(LookupError::Configuration(
                "no usable fetch strategy configured".to_string(),
            ));
        }
        Ok(strategies)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        self.orchestrator.cache()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Leases one pooled session and hands it back, launching a browser if
    /// none is idle.
    pub async fn warm_up(&self) -> Result<(), LookupError> {
        let lease = self.pool.acquire(self.config.pool.acquire_timeout).await?;
        lease.release();
        Ok(())
    }

    pub async fn lookup_single(
        &self,
        query: &AddressQuery,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<LookupResult, LookupError> {
        let ctx = LookupContext::new(uuid::Uuid::new_v4().to_string(), sink);
        self.orchestrator.lookup(query, &ctx).await
    }

    pub async fn lookup_batch(
        &self,
        batch: AddressBatch,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> LookupTask {
        self.batch.run(batch, sink, cancel).await
    }

    /// Closes every browser session. In-flight and later acquires fail with
    /// `PoolClosed`.
    pub async fn shutdown(&self) {
        info!("Shutting down lookup service");
        self.pool.shutdown().await;
    }
}
