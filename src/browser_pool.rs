//! Bounded pool of automated browser sessions.
//!
//! Sessions are created lazily up to `capacity` and handed out as
//! `SessionLease`s. A semaphore permit travels with every pooled lease, so no
//! more than `capacity` pooled sessions are ever Busy at once. Overflow
//! sessions are launched outside the semaphore and never return to the pool.

use crate::config::PoolSettings;
use crate::error::LookupError;
use crate::metrics::Metrics;
use crate::session::{BrowserDriver, SessionLauncher};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Busy,
    Unhealthy,
    Closed,
}

struct PooledSession {
    id: u64,
    driver: Arc<dyn BrowserDriver>,
    created_at: Instant,
    uses: usize,
}

impl PooledSession {
    fn expired(&self, settings: &PoolSettings) -> bool {
        self.uses >= settings.max_session_uses || self.created_at.elapsed() >= settings.max_session_age
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<PooledSession>,
    states: HashMap<u64, SessionState>,
    overflow_active: usize,
    launched: u64,
    destroyed: u64,
}

impl PoolState {
    fn busy(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, SessionState::Busy | SessionState::Unhealthy))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub overflow: usize,
    pub launched: u64,
    pub destroyed: u64,
    pub closed: bool,
}

impl PoolStats {
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.busy)
    }
}

pub struct BrowserSessionPool {
    launcher: Arc<dyn SessionLauncher>,
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl BrowserSessionPool {
    pub fn new(launcher: Arc<dyn SessionLauncher>, settings: PoolSettings, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            permits: Arc::new(Semaphore::new(settings.capacity)),
            settings,
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity
    }

    pub fn allows_overflow(&self) -> bool {
        self.settings.allow_overflow
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits up to `timeout` for a session. Idle sessions are reused before
    /// new ones are launched.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<SessionLease, LookupError> {
        if self.is_closed() {
            return Err(LookupError::PoolClosed);
        }

        let permit = match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(LookupError::PoolClosed),
            Err(_) => {
                debug!("Session pool exhausted after waiting {:?}", timeout);
                return Err(LookupError::PoolExhausted {
                    capacity: self.settings.capacity,
                    waited: timeout,
                });
            }
        };

        if self.is_closed() {
            return Err(LookupError::PoolClosed);
        }

        if let Some(session) = self.take_idle() {
            return Ok(SessionLease::new(self.clone(), session, Some(permit)));
        }

        let session = self.launch(false).await?;
        Ok(SessionLease::new(self.clone(), session, Some(permit)))
    }

    /// Launches a temporary session beyond capacity. It is always destroyed
    /// on release.
    pub async fn acquire_overflow(self: &Arc<Self>) -> Result<SessionLease, LookupError> {
        if self.is_closed() {
            return Err(LookupError::PoolClosed);
        }
        warn!(
            "Launching overflow session beyond pool capacity {}",
            self.settings.capacity
        );
        let session = self.launch(true).await?;
        Ok(SessionLease::new(self.clone(), session, None))
    }

    fn take_idle(&self) -> Option<PooledSession> {
        let mut stale = Vec::new();
        let picked = {
            let mut state = self.lock_state();
            let mut picked = None;
            while let Some(mut session) = state.idle.pop_front() {
                if !session.driver.is_alive() || session.expired(&self.settings) {
                    state.states.remove(&session.id);
                    state.destroyed += 1;
                    stale.push(session);
                    continue;
                }
                session.uses += 1;
                state.states.insert(session.id, SessionState::Busy);
                picked = Some(session);
                break;
            }
            self.metrics.set_pool_busy(state.busy());
            picked
        };

        for session in stale {
            debug!("Dropping stale idle session {}", session.id);
            self.destroy(session.driver);
        }
        picked
    }

    async fn launch(&self, overflow: bool) -> Result<PooledSession, LookupError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let driver = match tokio::time::timeout(self.settings.launch_timeout, self.launcher.launch(id)).await {
            Ok(Ok(driver)) => driver,
            Ok(Err(e)) => {
                warn!("Failed to launch session {}: {}", id, e);
                return Err(e);
            }
            Err(_) => {
                warn!("Launching session {} timed out", id);
                return Err(LookupError::SessionLaunch(format!(
                    "launch timed out after {:?}",
                    self.settings.launch_timeout
                )));
            }
        };

        let accepted = {
            let mut state = self.lock_state();
            if self.is_closed() {
                false
            } else {
                state.launched += 1;
                if overflow {
                    state.overflow_active += 1;
                } else {
                    state.states.insert(id, SessionState::Busy);
                }
                self.metrics.set_pool_busy(state.busy());
                true
            }
        };
        if !accepted {
            driver.close().await;
            return Err(LookupError::PoolClosed);
        }
        self.metrics.record_session_launch(overflow);
        debug!("Session {} launched (overflow: {})", id, overflow);

        Ok(PooledSession {
            id,
            driver,
            created_at: Instant::now(),
            uses: 1,
        })
    }

    /// Flags a session so it is destroyed instead of reused on release.
    pub fn mark_unhealthy(&self, id: u64) {
        let mut state = self.lock_state();
        if let Some(s) = state.states.get_mut(&id) {
            if *s == SessionState::Busy {
                *s = SessionState::Unhealthy;
                warn!("Session {} marked unhealthy", id);
            }
        }
    }

    pub fn session_state(&self, id: u64) -> Option<SessionState> {
        self.lock_state().states.get(&id).copied()
    }

    fn finish(&self, session: PooledSession, overflow: bool, unhealthy: bool, reuse: bool) {
        let keep = {
            let mut state = self.lock_state();
            let marked = state.states.get(&session.id) == Some(&SessionState::Unhealthy);

            let keep = !overflow
                && reuse
                && !unhealthy
                && !marked
                && !self.is_closed()
                && session.driver.is_alive()
                && !session.expired(&self.settings);

            if overflow {
                state.overflow_active = state.overflow_active.saturating_sub(1);
                state.destroyed += 1;
            } else if keep {
                state.states.insert(session.id, SessionState::Idle);
            } else {
                state.states.remove(&session.id);
                state.destroyed += 1;
            }
            self.metrics.set_pool_busy(state.busy());

            if keep {
                state.idle.push_back(session);
                None
            } else {
                Some(session)
            }
        };

        if let Some(session) = keep {
            debug!("Destroying session {} after {} uses", session.id, session.uses);
            self.destroy(session.driver);
        }
    }

    fn destroy(&self, driver: Arc<dyn BrowserDriver>) {
        self.metrics.record_session_destroyed();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { driver.close().await });
            }
            Err(_) => debug!("No runtime available to close session, dropping it"),
        }
    }

    /// Closes every idle session and rejects further acquires. Sessions in use
    /// are destroyed when their leases are released.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down browser session pool...");
        self.permits.close();

        let idle: Vec<PooledSession> = {
            let mut state = self.lock_state();
            let drained: Vec<PooledSession> = state.idle.drain(..).collect();
            for session in &drained {
                state.states.remove(&session.id);
                state.destroyed += 1;
            }
            drained
        };

        for session in idle {
            session.driver.close().await;
            self.metrics.record_session_destroyed();
        }

        info!("Browser session pool shutdown complete");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            capacity: self.settings.capacity,
            total: state.states.len(),
            idle: state.idle.len(),
            busy: state.busy(),
            overflow: state.overflow_active,
            launched: state.launched,
            destroyed: state.destroyed,
            closed: self.is_closed(),
        }
    }
}

/// Exclusive use of one session.
///
/// Call `release` when the fetch finished normally. A lease dropped without
/// `release` (an error unwinding or a cancelled future) destroys its session,
/// since the tab may be left mid-navigation.
pub struct SessionLease {
    pool: Arc<BrowserSessionPool>,
    session: Option<PooledSession>,
    permit: Option<OwnedSemaphorePermit>,
    overflow: bool,
    unhealthy: AtomicBool,
}

impl SessionLease {
    fn new(pool: Arc<BrowserSessionPool>, session: PooledSession, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            overflow: permit.is_none(),
            pool,
            session: Some(session),
            permit,
            unhealthy: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.session.as_ref().map(|s| s.id).unwrap_or_default()
    }

    pub fn driver(&self) -> Option<&Arc<dyn BrowserDriver>> {
        self.session.as_ref().map(|s| &s.driver)
    }

    pub fn is_overflow(&self) -> bool {
        self.overflow
    }

    pub fn uses(&self) -> usize {
        self.session.as_ref().map(|s| s.uses).unwrap_or_default()
    }

    pub fn mark_unhealthy(&self) {
        self.unhealthy.store(true, Ordering::Release);
        self.pool.mark_unhealthy(self.id());
    }

    /// Returns the session to the pool, or destroys it if it was marked
    /// unhealthy, is an overflow session, or has reached its recycle limits.
    pub fn release(mut self) {
        self.finish(true);
    }

    fn finish(&mut self, reuse: bool) {
        if let Some(session) = self.session.take() {
            let unhealthy = self.unhealthy.load(Ordering::Acquire);
            self.pool.finish(session, self.overflow, unhealthy, reuse);
        }
        // Released after the session is back in the idle queue
        self.permit.take();
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.session.is_some() {
            debug!("Session lease {} dropped without release", self.id());
        }
        self.finish(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLauncher;
    use std::sync::atomic::AtomicUsize;

    fn settings(capacity: usize) -> PoolSettings {
        PoolSettings {
            capacity,
            acquire_timeout: Duration::from_millis(100),
            launch_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn pool(capacity: usize, launcher: Arc<FakeLauncher>) -> Arc<BrowserSessionPool> {
        BrowserSessionPool::new(launcher, settings(capacity), Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_sessions_are_created_lazily_and_reused() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(2, launcher.clone());
        assert_eq!(launcher.launch_count(), 0);

        let lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let first_id = lease.id();
        lease.release();

        let lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(lease.id(), first_id);
        assert_eq!(lease.uses(), 2);
        assert_eq!(launcher.launch_count(), 1);
        assert_eq!(pool.session_state(first_id), Some(SessionState::Busy));
        lease.release();
        assert_eq!(pool.session_state(first_id), Some(SessionState::Idle));
    }

    #[tokio::test]
    async fn test_exhaustion_times_out() {
        let pool = pool(1, Arc::new(FakeLauncher::default()));
        let held = pool.acquire(Duration::from_millis(50)).await.unwrap();

        let err = pool.acquire(Duration::from_millis(30)).await.err().unwrap();
        assert!(matches!(err, LookupError::PoolExhausted { capacity: 1, .. }));
        held.release();

        assert!(pool.acquire(Duration::from_millis(30)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unhealthy_session_is_never_reused() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(1, launcher.clone());

        let lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let bad_id = lease.id();
        lease.mark_unhealthy();
        assert_eq!(pool.session_state(bad_id), Some(SessionState::Unhealthy));
        lease.release();
        assert_eq!(pool.session_state(bad_id), None);

        let lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_ne!(lease.id(), bad_id);
        assert_eq!(launcher.launch_count(), 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(launcher.driver(0).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_busy_never_exceeds_capacity() {
        let pool = pool(3, Arc::new(FakeLauncher::default()));
        let max_busy = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let pool = pool.clone();
                let max_busy = max_busy.clone();
                tokio::spawn(async move {
                    let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
                    max_busy.fetch_max(pool.stats().busy, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    lease.release();
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert!(max_busy.load(Ordering::SeqCst) <= 3);
        let stats = pool.stats();
        assert_eq!(stats.busy, 0);
        assert!(stats.launched <= 3);
    }

    #[tokio::test]
    async fn test_dropped_lease_destroys_session() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(1, launcher.clone());

        let lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
        drop(lease);

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.destroyed, 1);
        assert!(pool.acquire(Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_overflow_sessions_bypass_capacity_and_are_discarded() {
        let pool = pool(1, Arc::new(FakeLauncher::default()));
        let held = pool.acquire(Duration::from_millis(50)).await.unwrap();

        let extra = pool.acquire_overflow().await.unwrap();
        assert!(extra.is_overflow());
        assert_eq!(pool.stats().overflow, 1);
        assert_eq!(pool.stats().busy, 1);
        extra.release();

        let stats = pool.stats();
        assert_eq!(stats.overflow, 0);
        assert_eq!(stats.idle, 0);
        held.release();
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_sessions_recycle_after_max_uses() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = BrowserSessionPool::new(
            launcher.clone(),
            PoolSettings {
                max_session_uses: 2,
                ..settings(1)
            },
            Arc::new(Metrics::new()),
        );

        for _ in 0..4 {
            pool.acquire(Duration::from_millis(50)).await.unwrap().release();
        }
        assert_eq!(launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_launch_failure_returns_permit() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.fail_launches(true);
        let pool = pool(1, launcher.clone());

        let err = pool.acquire(Duration::from_millis(50)).await.err().unwrap();
        assert!(matches!(err, LookupError::SessionLaunch(_)));

        launcher.fail_launches(false);
        assert!(pool.acquire(Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_waiters_and_new_acquires() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(1, launcher.clone());

        let idle = pool.acquire(Duration::from_millis(50)).await.unwrap();
        idle.release();
        let held = pool.acquire(Duration::from_millis(50)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.shutdown().await;
        assert!(matches!(waiter.await.unwrap(), Err(LookupError::PoolClosed)));
        assert!(matches!(
            pool.acquire(Duration::from_millis(10)).await,
            Err(LookupError::PoolClosed)
        ));

        held.release();
        let stats = pool.stats();
        assert!(stats.closed);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.idle, 0);
    }
}
