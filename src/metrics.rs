use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric handles for the lookup pipeline.
///
/// Handles bind to whichever recorder is installed when `Metrics::new` runs,
/// so install the Prometheus exporter first. Without a recorder every handle
/// is a no-op.
pub struct Metrics {
    pub lookups_started: Counter,
    pub lookups_succeeded: Counter,
    pub lookups_failed: Counter,
    pub lookup_duration: Histogram,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_writes: Counter,
    pub cache_errors: Counter,
    pub fetch_attempts: Counter,
    pub fetch_failures: Counter,
    pub sessions_launched: Counter,
    pub sessions_destroyed: Counter,
    pub overflow_sessions: Counter,
    pub pool_busy: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            lookups_started: register_counter!("aml_lookups_started_total"),
            lookups_succeeded: register_counter!("aml_lookups_succeeded_total"),
            lookups_failed: register_counter!("aml_lookups_failed_total"),
            lookup_duration: register_histogram!("aml_lookup_duration_seconds"),
            cache_hits: register_counter!("aml_cache_hits_total"),
            cache_misses: register_counter!("aml_cache_misses_total"),
            cache_writes: register_counter!("aml_cache_writes_total"),
            cache_errors: register_counter!("aml_cache_errors_total"),
            fetch_attempts: register_counter!("aml_fetch_attempts_total"),
            fetch_failures: register_counter!("aml_fetch_failures_total"),
            sessions_launched: register_counter!("aml_sessions_launched_total"),
            sessions_destroyed: register_counter!("aml_sessions_destroyed_total"),
            overflow_sessions: register_counter!("aml_overflow_sessions_total"),
            pool_busy: register_gauge!("aml_pool_busy_sessions"),
        }
    }

    pub fn record_lookup(&self, duration: Duration, success: bool) {
        if success {
            self.lookups_succeeded.increment(1);
        } else {
            self.lookups_failed.increment(1);
        }
        self.lookup_duration.record(duration.as_secs_f64());
    }

    pub fn record_lookup_started(&self) {
        self.lookups_started.increment(1);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.increment(1);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.increment(1);
    }

    pub fn record_cache_write(&self) {
        self.cache_writes.increment(1);
    }

    pub fn record_cache_error(&self) {
        self.cache_errors.increment(1);
    }

    pub fn record_fetch_attempt(&self, success: bool) {
        self.fetch_attempts.increment(1);
        if !success {
            self.fetch_failures.increment(1);
        }
    }

    pub fn record_session_launch(&self, overflow: bool) {
        self.sessions_launched.increment(1);
        if overflow {
            self.overflow_sessions.increment(1);
        }
    }

    pub fn record_session_destroyed(&self) {
        self.sessions_destroyed.increment(1);
    }

    pub fn set_pool_busy(&self, busy: usize) {
        self.pool_busy.set(busy as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves `/metrics` in Prometheus text format.
pub struct PrometheusExporter {
    addr: SocketAddr,
}

impl PrometheusExporter {
    pub fn new(port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
        }
    }

    /// Installs the global recorder and its HTTP listener. Must run inside a
    /// tokio runtime.
    pub fn install(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .install()?;

        info!("Prometheus metrics available on http://{}/metrics", self.addr);
        Ok(())
    }
}
