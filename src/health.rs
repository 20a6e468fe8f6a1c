use crate::browser_pool::PoolStats;
use crate::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Share of launched sessions destroyed as unhealthy or expired
    pub warn_destroy_ratio: f64,
    pub critical_destroy_ratio: f64,
    /// Busy sessions over capacity
    pub warn_utilization: f64,
    /// Overflow sessions alive at once before the pool counts as undersized
    pub max_overflow: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warn_destroy_ratio: 0.2,
            critical_destroy_ratio: 0.5,
            warn_utilization: 0.9,
            max_overflow: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub pool: HealthLevel,
    pub capacity: HealthLevel,
    pub stats: PoolSnapshot,
    pub timestamp: SystemTime,
}

/// Serializable copy of the pool counters that fed a health check.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub idle: usize,
    pub busy: usize,
    pub overflow: usize,
    pub launched: u64,
    pub destroyed: u64,
    pub closed: bool,
}

impl From<&PoolStats> for PoolSnapshot {
    fn from(stats: &PoolStats) -> Self {
        Self {
            capacity: stats.capacity,
            idle: stats.idle,
            busy: stats.busy,
            overflow: stats.overflow,
            launched: stats.launched,
            destroyed: stats.destroyed,
            closed: stats.closed,
        }
    }
}

/// Evaluates browser pool statistics against thresholds.
pub struct PoolHealthChecker {
    thresholds: HealthThresholds,
}

impl Default for PoolHealthChecker {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

impl PoolHealthChecker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    pub fn check(&self, stats: &PoolStats) -> HealthStatus {
        let pool = self.check_session_churn(stats);
        let capacity = self.check_capacity(stats);
        let overall = pool.max(capacity);

        HealthStatus {
            overall,
            pool,
            capacity,
            stats: PoolSnapshot::from(stats),
            timestamp: SystemTime::now(),
        }
    }

    fn check_session_churn(&self, stats: &PoolStats) -> HealthLevel {
        if stats.closed {
            warn!("Browser pool is closed");
            return HealthLevel::Critical;
        }

        // Sessions thrown away per launch; high churn means the upstream is
        // detecting and blocking us.
        let destroy_ratio = if stats.launched > 0 {
            stats.destroyed as f64 / stats.launched as f64
        } else {
            0.0
        };

        if destroy_ratio > self.thresholds.critical_destroy_ratio {
            error!(
                "Browser pool health critical: {:.0}% of sessions destroyed",
                destroy_ratio * 100.0
            );
            HealthLevel::Critical
        } else if destroy_ratio > self.thresholds.warn_destroy_ratio {
            warn!(
                "Browser pool health warning: {:.0}% of sessions destroyed",
                destroy_ratio * 100.0
            );
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    fn check_capacity(&self, stats: &PoolStats) -> HealthLevel {
        if stats.overflow > self.thresholds.max_overflow {
            warn!("{} overflow sessions alive; pool capacity is too small", stats.overflow);
            return HealthLevel::Warning;
        }

        let utilization = if stats.capacity > 0 {
            stats.busy as f64 / stats.capacity as f64
        } else {
            0.0
        };
        if utilization > self.thresholds.warn_utilization {
            warn!("Browser pool high utilization: {:.0}%", utilization * 100.0);
            return HealthLevel::Warning;
        }

        HealthLevel::Healthy
    }
}

/// Logs a health check on `period` until `cancel` fires.
pub async fn monitor_pool<F>(
    stats: F,
    checker: PoolHealthChecker,
    metrics: Arc<Metrics>,
    period: Duration,
    cancel: CancellationToken,
) where
    F: Fn() -> PoolStats,
{
    let mut timer = interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }

        let current = stats();
        metrics.set_pool_busy(current.busy);
        let status = checker.check(&current);
        match status.overall {
            HealthLevel::Healthy => info!("Pool health: OK ({} idle, {} busy)", current.idle, current.busy),
            level => warn!(
                "Pool health: {:?} (pool {:?}, capacity {:?})",
                level, status.pool, status.capacity
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> PoolStats {
        PoolStats {
            capacity: 4,
            total: 2,
            idle: 2,
            busy: 0,
            overflow: 0,
            launched: 10,
            destroyed: 1,
            closed: false,
        }
    }

    #[test]
    fn test_healthy_pool() {
        let status = PoolHealthChecker::default().check(&stats());
        assert_eq!(status.overall, HealthLevel::Healthy);
    }

    #[test]
    fn test_session_churn_levels() {
        let checker = PoolHealthChecker::default();
        let warning = PoolStats { destroyed: 3, ..stats() };
        assert_eq!(checker.check(&warning).pool, HealthLevel::Warning);

        let critical = PoolStats { destroyed: 8, ..stats() };
        assert_eq!(checker.check(&critical).overall, HealthLevel::Critical);

        let closed = PoolStats { closed: true, ..stats() };
        assert_eq!(checker.check(&closed).overall, HealthLevel::Critical);
    }

    #[test]
    fn test_capacity_pressure() {
        let checker = PoolHealthChecker::default();
        let saturated = PoolStats { busy: 4, idle: 0, ..stats() };
        assert_eq!(checker.check(&saturated).capacity, HealthLevel::Warning);

        let overflowing = PoolStats { overflow: 3, ..stats() };
        let status = checker.check(&overflowing);
        assert_eq!(status.capacity, HealthLevel::Warning);
        assert_eq!(status.overall, HealthLevel::Warning);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(
            Duration::from_secs(1),
            monitor_pool(
                stats,
                PoolHealthChecker::default(),
                Arc::new(Metrics::new()),
                Duration::from_millis(10),
                cancel,
            ),
        )
        .await
        .unwrap();
    }
}
