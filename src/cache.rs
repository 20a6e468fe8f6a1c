//! Cache-aside storage for lookup results.
//!
//! `CacheStore` owns key derivation, entry encoding and the write policy; the
//! byte-level persistence sits behind `KvStore`. Store failures never fail a
//! lookup: reads degrade to a miss and writes are dropped with a warning.

use crate::config::CacheSettings;
use crate::error::LookupError;
use crate::metrics::Metrics;
use crate::types::{AddressQuery, LookupResult, Network};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Byte-oriented key-value persistence with per-key expiry.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LookupError>;
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), LookupError>;
    async fn delete(&self, key: &str) -> Result<bool, LookupError>;
    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, LookupError>;
    async fn flush_all(&self) -> Result<(), LookupError>;
}

/// Writes between sweeps of expired entries in `MemoryStore`.
const SWEEP_EVERY: usize = 256;

/// In-process store. Expired keys are dropped on access and swept every
/// `SWEEP_EVERY` writes.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, (Vec<u8>, Instant)>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires)| *expires > now);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!("Purged {} expired cache entries", purged);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LookupError> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1 > Instant::now() => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), LookupError> {
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.purge_expired();
        }
        self.entries.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, LookupError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, LookupError> {
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()))
    }

    async fn flush_all(&self) -> Result<(), LookupError> {
        self.entries.clear();
        Ok(())
    }
}

/// Redis-backed store shared between processes.
///
/// The connection is opened on first use and re-established by the
/// connection manager after drops. Every failure maps to `CacheUnavailable`.
pub struct RedisStore {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const SCAN_BATCH: usize = 500;

impl RedisStore {
    pub fn new(settings: &CacheSettings) -> Result<Self, LookupError> {
        let host = settings
            .host
            .clone()
            .ok_or_else(|| LookupError::Configuration("cache.host is not set".to_string()))?;
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(host, settings.port),
            redis: RedisConnectionInfo {
                db: settings.db,
                username: None,
                password: settings.password.clone(),
            },
        };
        let client = redis::Client::open(info).map_err(redis_unavailable)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, LookupError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let connect = ConnectionManager::new(self.client.clone());
                match tokio::time::timeout(REDIS_CONNECT_TIMEOUT, connect).await {
                    Ok(Ok(conn)) => {
                        info!("Connected to cache server");
                        Ok(conn)
                    }
                    Ok(Err(e)) => Err(redis_unavailable(e)),
                    Err(_) => Err(LookupError::CacheUnavailable(format!(
                        "connect timed out after {:?}",
                        REDIS_CONNECT_TIMEOUT
                    ))),
                }
            })
            .await?;
        Ok(conn.clone())
    }
}

fn redis_unavailable(err: redis::RedisError) -> LookupError {
    LookupError::CacheUnavailable(err.to_string())
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LookupError> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(redis_unavailable)
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), LookupError> {
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_unavailable)
    }

    async fn delete(&self, key: &str) -> Result<bool, LookupError> {
        let mut conn = self.connection().await?;
        let removed = redis::cmd("DEL")
            .arg(key)
            .query_async::<_, usize>(&mut conn)
            .await
            .map_err(redis_unavailable)?;
        Ok(removed > 0)
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, LookupError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let (next, keys) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<_, (u64, Vec<String>)>(&mut conn)
                .await
                .map_err(redis_unavailable)?;
            if !keys.is_empty() {
                removed += redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<_, usize>(&mut conn)
                    .await
                    .map_err(redis_unavailable)?;
            }
            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }

    async fn flush_all(&self) -> Result<(), LookupError> {
        let mut conn = self.connection().await?;
        redis::cmd("FLUSHDB")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_unavailable)
    }
}

/// Picks the store named by `settings`: Redis when a host is configured,
/// otherwise an in-process map.
pub fn store_for(settings: &CacheSettings) -> Result<Arc<dyn KvStore>, LookupError> {
    match &settings.host {
        Some(host) => {
            info!("Using cache server {}:{} db {}", host, settings.port, settings.db);
            Ok(Arc::new(RedisStore::new(settings)?))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

/// `{namespace}:{network}:{address}`, all lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(namespace: &str, network: Network, address: &str) -> Self {
        Self(format!(
            "{}:{}:{}",
            namespace.to_ascii_lowercase(),
            network.as_str().to_ascii_lowercase(),
            address.trim().to_ascii_lowercase()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: LookupResult,
    pub stored_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

pub struct CacheStore {
    store: Arc<dyn KvStore>,
    namespace: String,
    ttl: Duration,
    enabled: bool,
    metrics: Arc<Metrics>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>, ttl: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            ttl,
            enabled: true,
            metrics,
        }
    }

    /// A cache that always misses and never writes.
    pub fn disabled(metrics: Arc<Metrics>) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            namespace: String::new(),
            ttl: Duration::ZERO,
            enabled: false,
            metrics,
        }
    }

    pub fn key_for(&self, query: &AddressQuery) -> CacheKey {
        CacheKey::new(&self.namespace, query.network, &query.address)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get_entry(&self, query: &AddressQuery) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }
        let key = self.key_for(query);

        let bytes = match self.store.get(key.as_str()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.metrics.record_cache_miss();
                return None;
            }
            Err(e) => {
                warn!("Cache read for {} failed, treating as miss: {}", key, e);
                self.metrics.record_cache_error();
                return None;
            }
        };

        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => {
                debug!("Cache hit for {}", key);
                self.metrics.record_cache_hit();
                Some(entry)
            }
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", key, e);
                self.metrics.record_cache_error();
                if let Err(e) = self.store.delete(key.as_str()).await {
                    debug!("Could not delete bad entry {}: {}", key, e);
                }
                None
            }
        }
    }

    pub async fn get(&self, query: &AddressQuery) -> Option<LookupResult> {
        self.get_entry(query).await.map(|entry| entry.value)
    }

    /// Stores `result` unless it is an Empty result that was not marked final.
    /// Returns whether an entry was written.
    pub async fn put(&self, query: &AddressQuery, result: &LookupResult) -> bool {
        if !self.enabled {
            return false;
        }
        if !result.is_cacheable() {
            debug!("Skipping cache write for empty result of {}", query.address);
            return false;
        }

        let key = self.key_for(query);
        let entry = CacheEntry {
            key: key.to_string(),
            value: result.clone(),
            stored_at: Utc::now(),
            ttl_secs: self.ttl.as_secs(),
        };

        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not encode cache entry {}: {}", key, e);
                return false;
            }
        };

        match self.store.set_with_ttl(key.as_str(), bytes, self.ttl).await {
            Ok(()) => {
                self.metrics.record_cache_write();
                true
            }
            Err(e) => {
                warn!("Cache write for {} failed: {}", key, e);
                self.metrics.record_cache_error();
                false
            }
        }
    }

    pub async fn invalidate(&self, query: &AddressQuery) -> Result<bool, LookupError> {
        self.store.delete(self.key_for(query).as_str()).await
    }

    /// Removes every entry under this cache's namespace.
    pub async fn flush(&self) -> Result<usize, LookupError> {
        self.store.delete_by_prefix(&format!("{}:", self.namespace.to_ascii_lowercase())).await
    }

    /// Clears the entire backing store, including other namespaces.
    pub async fn flush_all(&self) -> Result<(), LookupError> {
        self.store.flush_all().await
    }
}
