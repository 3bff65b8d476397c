//! Test doubles shared by the test modules

use crate::breaker::CircuitBreaker;
use crate::cache::{CacheFacade, CacheKey, KvStore, ScanPage, StoreError};
use crate::config::CachePolicy;
use crate::filters::{FilterPurpose, MembershipSource};
use crate::warming::{AggregationError, Aggregator};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Healthy,
    /// Every call fails immediately
    Failing,
    /// Every call never completes
    Hanging,
}

/// In-memory store whose failures are scripted by the test. Entries never
/// expire; the TTL of each write is recorded instead.
pub struct ScriptedStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    ttls: Mutex<HashMap<String, Duration>>,
    mode: Mutex<StoreMode>,
    memory_used: Mutex<Option<u64>>,
    /// Keys per scan page; `None` returns every match in one page
    page_size: Mutex<Option<usize>>,
    /// Delay added to every call
    latency: Mutex<Duration>,
    calls: AtomicU64,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            ttls: Mutex::new(HashMap::new()),
            mode: Mutex::new(StoreMode::Healthy),
            memory_used: Mutex::new(None),
            page_size: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            calls: AtomicU64::new(0),
        })
    }

    pub fn set_mode(&self, mode: StoreMode) {
        *self.mode.lock() = mode;
    }

    pub fn set_memory_used(&self, bytes: Option<u64>) {
        *self.memory_used.lock() = bytes;
    }

    pub fn set_page_size(&self, size: usize) {
        *self.page_size.lock() = Some(size.max(1));
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Calls that reached the store, successful or not
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seed(&self, key: &str) {
        self.entries.lock().insert(key.to_string(), b"seeded".to_vec());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.ttls.lock().get(key).copied()
    }

    async fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mode = *self.mode.lock();
        match mode {
            StoreMode::Healthy => Ok(()),
            StoreMode::Failing => Err(StoreError::Transport("connection refused".into())),
            StoreMode::Hanging => std::future::pending().await,
        }
    }
}

#[async_trait]
impl KvStore for ScriptedStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.enter().await?;
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.enter().await?;
        self.entries.lock().insert(key.to_string(), value);
        self.ttls.lock().insert(key.to_string(), ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.enter().await?;
        Ok(self.entries.lock().remove(key).is_some())
    }

    /// The cursor is an offset into the sorted matches
    async fn scan_page(&self, prefix: &str, cursor: u64) -> Result<ScanPage, StoreError> {
        self.enter().await?;
        let mut matches: Vec<String> = self
            .entries
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        matches.sort_unstable();

        let start = (cursor as usize).min(matches.len());
        let end = match *self.page_size.lock() {
            Some(size) => (start + size).min(matches.len()),
            None => matches.len(),
        };
        let next = if end < matches.len() { end as u64 } else { 0 };
        Ok(ScanPage {
            keys: matches[start..end].to_vec(),
            cursor: next,
        })
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.enter().await?;
        let mut entries = self.entries.lock();
        Ok(keys.iter().filter(|key| entries.remove(*key).is_some()).count() as u64)
    }

    async fn memory_used(&self) -> Result<Option<u64>, StoreError> {
        self.enter().await?;
        Ok(*self.memory_used.lock())
    }
}

pub fn facade_over(store: Arc<dyn KvStore>) -> CacheFacade {
    let policy = Arc::new(CachePolicy::default());
    let breaker = Arc::new(CircuitBreaker::new(policy.breaker.clone()));
    CacheFacade::new(store, breaker, policy)
}

/// Drive the breaker open with failing reads, then restore the store
pub async fn trip_breaker(cache: &CacheFacade, store: &ScriptedStore) {
    store.set_mode(StoreMode::Failing);
    for _ in 0..cache.breaker().config().failure_threshold {
        let _ = cache.try_get(crate::cache::ResourceClass::GlobalMetrics, "global:metrics").await;
    }
    store.set_mode(StoreMode::Healthy);
}

/// Aggregator answering with a small JSON document per key
pub struct StaticAggregator {
    chains: Vec<u64>,
    /// Calls that fail with a transient error before answers start
    fail_first: AtomicUsize,
    unsupported: bool,
    calls: AtomicUsize,
}

impl StaticAggregator {
    pub fn new(chains: Vec<u64>) -> Self {
        Self {
            chains,
            fail_first: AtomicUsize::new(0),
            unsupported: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_first(mut self, count: usize) -> Self {
        self.fail_first = AtomicUsize::new(count);
        self
    }

    pub fn unsupported(mut self) -> Self {
        self.unsupported = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Aggregator for StaticAggregator {
    async fn compute(&self, key: &CacheKey) -> Result<Value, AggregationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unsupported {
            return Err(AggregationError::Unsupported(key.to_string()));
        }
        let transient = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(AggregationError::Unavailable("aggregator restarting".into()));
        }
        Ok(json!({ "key": key.to_string(), "value": 1 }))
    }

    async fn active_chains(&self) -> Result<Vec<u64>, AggregationError> {
        Ok(self.chains.clone())
    }
}

/// Membership source with fixed sets that can be switched to failing
pub struct StaticSource {
    sets: HashMap<FilterPurpose, Vec<String>>,
    failing: Mutex<bool>,
    loads: AtomicUsize,
}

impl StaticSource {
    pub fn new(sets: HashMap<FilterPurpose, Vec<String>>) -> Self {
        Self {
            sets,
            failing: Mutex::new(false),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MembershipSource for StaticSource {
    async fn load(&self, purpose: FilterPurpose) -> Result<Vec<String>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock() {
            return Err(StoreError::Transport("membership store down".into()));
        }
        Ok(self.sets.get(&purpose).cloned().unwrap_or_default())
    }
}
