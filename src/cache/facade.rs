//! TTL cache facade: every store call goes through the circuit breaker

use super::keys::{CacheKey, KeyPattern, ResourceClass};
use super::store::{KvStore, StoreError};
use super::CacheError;
use crate::breaker::CircuitBreaker;
use crate::config::CachePolicy;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Keys removed per DEL round trip during a prefix delete
const DELETE_BATCH: usize = 500;

/// Usage relative to the configured memory ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    Normal,
    Warning,
    High,
    /// The store does not report usage, or could not be asked
    Unknown,
}

/// Point-in-time counters for the facade
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Store errors observed by reads and writes
    pub errors: u64,
    /// Calls rejected by the breaker without reaching the store
    pub short_circuited: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub deleted_keys: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    short_circuited: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
    deleted_keys: AtomicU64,
}

/// Read-through cache facade over an external key-value store.
///
/// The facade keeps no entries of its own; expiry is enforced by the store
/// using the TTL chosen here per resource class. It is an optimization layer
/// only, so reads degrade to misses and write failures are logged rather
/// than propagated.
#[derive(Clone)]
pub struct CacheFacade {
    store: Arc<dyn KvStore>,
    breaker: Arc<CircuitBreaker>,
    policy: Arc<CachePolicy>,
    counters: Arc<Counters>,
}

impl CacheFacade {
    pub fn new(
        store: Arc<dyn KvStore>,
        breaker: Arc<CircuitBreaker>,
        policy: Arc<CachePolicy>,
    ) -> Self {
        Self {
            store,
            breaker,
            policy,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn policy(&self) -> &Arc<CachePolicy> {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Render a key; deterministic for equal inputs
    pub fn build_key(&self, key: &CacheKey) -> String {
        key.to_string()
    }

    /// Get a cached value. Breaker rejections, store misses and store errors
    /// all read as `None`.
    pub async fn get(&self, class: ResourceClass, key: &str) -> Option<Vec<u8>> {
        match self.try_get(class, key).await {
            Ok(value) => value,
            Err(e) => {
                debug!("Cache read for {} degraded to miss: {}", key, e);
                None
            }
        }
    }

    /// Like [`get`](Self::get), but reports why a read produced nothing
    pub async fn try_get(
        &self,
        class: ResourceClass,
        key: &str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let result = self.guarded(self.store.get(key)).await;
        match &result {
            Ok(Some(_)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit for key: {} ({})", key, class);
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Cache miss for key: {} ({})", key, class);
            }
            Err(e) => self.count_failure(e),
        }
        result
    }

    /// Store a value with its class TTL. Failures are logged and returned;
    /// callers are free to ignore them.
    pub async fn set(
        &self,
        class: ResourceClass,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), CacheError> {
        let ttl = self.policy.ttl_for(class);
        self.write(key, value, ttl).await
    }

    /// Store a value under a structured key; RPC keys use their method's TTL
    pub async fn set_key(&self, key: &CacheKey, value: Vec<u8>) -> Result<(), CacheError> {
        let ttl = self.policy.ttl_for_key(key);
        self.write(&key.to_string(), value, ttl).await
    }

    /// Cache an RPC response under its canonical key
    pub async fn set_rpc(
        &self,
        method: &str,
        params: &Value,
        value: Vec<u8>,
    ) -> Result<(), CacheError> {
        self.set_key(&CacheKey::rpc_call(method, params), value).await
    }

    pub async fn get_rpc(&self, method: &str, params: &Value) -> Option<Vec<u8>> {
        let key = CacheKey::rpc_call(method, params);
        self.get(ResourceClass::RpcResponse, &key.to_string()).await
    }

    /// Read and decode a JSON value. Undecodable entries read as misses.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let bytes = self.get(key.resource_class(), &key.to_string()).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", key, e);
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)?;
        self.set_key(key, bytes).await
    }

    /// Delete every key matched by `pattern`. Deleting absent keys succeeds,
    /// so repeated calls leave the store in the same state.
    ///
    /// Prefix deletes are bounded per round trip: each SCAN page and each
    /// delete batch is its own guarded call.
    pub async fn delete_pattern(&self, pattern: &KeyPattern) -> Result<u64, CacheError> {
        let result = match pattern {
            KeyPattern::Exact(key) => self
                .guarded(async { self.store.delete(key).await.map(u64::from) })
                .await,
            KeyPattern::Prefix(prefix) => self.delete_prefix(prefix).await,
        };

        match &result {
            Ok(count) => {
                self.counters.deleted_keys.fetch_add(*count, Ordering::Relaxed);
                debug!("Deleted {} keys for pattern {}", count, pattern);
            }
            Err(e) => {
                self.count_failure(e);
                warn!("Failed to delete pattern {}: {}", pattern, e);
            }
        }
        result
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let page = self.guarded(self.store.scan_page(prefix, cursor)).await?;
            keys.extend(page.keys);
            if page.cursor == 0 {
                break;
            }
            cursor = page.cursor;
        }
        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();

        let mut deleted = 0;
        for batch in keys.chunks(DELETE_BATCH) {
            deleted += self.guarded(self.store.delete_many(batch)).await?;
        }
        Ok(deleted)
    }

    /// Classify store memory usage against the configured thresholds
    pub async fn memory_pressure(&self) -> MemoryPressure {
        let used = match self.guarded(self.store.memory_used()).await {
            Ok(Some(used)) => used,
            Ok(None) => return MemoryPressure::Unknown,
            Err(e) => {
                debug!("Could not read store memory usage: {}", e);
                return MemoryPressure::Unknown;
            }
        };

        let memory = &self.policy.memory;
        if used >= memory.high_watermark() {
            error!(
                used_bytes = used,
                ceiling_bytes = memory.max_bytes,
                "Cache memory above high threshold"
            );
            MemoryPressure::High
        } else if used >= memory.warning_watermark() {
            warn!(
                used_bytes = used,
                ceiling_bytes = memory.max_bytes,
                "Cache memory above warning threshold"
            );
            MemoryPressure::Warning
        } else {
            MemoryPressure::Normal
        }
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            short_circuited: c.short_circuited.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            write_failures: c.write_failures.load(Ordering::Relaxed),
            deleted_keys: c.deleted_keys.load(Ordering::Relaxed),
        }
    }

    async fn write(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let result = self.guarded(self.store.set(key, value, ttl)).await;
        match &result {
            Ok(()) => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                debug!("Cached {} with TTL: {:?}", key, ttl);
            }
            Err(e) => {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                self.count_failure(e);
                warn!("Cache write for {} skipped: {}", key, e);
            }
        }
        result
    }

    /// Run a store call through the breaker, bounded by the store timeout
    async fn guarded<T, F>(&self, call: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let timeout = self.policy.store_timeout;
        let bounded = async move {
            match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(timeout)),
            }
        };
        self.breaker.execute(bounded).await.map_err(CacheError::from)
    }

    fn count_failure(&self, err: &CacheError) {
        if err.is_short_circuit() {
            self.counters.short_circuited.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}
