//! Backing key-value store abstraction and the in-process Moka store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::{future::Cache, Expiry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store transport error: {0}")]
    Transport(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store protocol error: {0}")]
    Protocol(String),
}

/// One SCAN round trip
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub keys: Vec<String>,
    /// Cursor for the next round trip; 0 once the scan is complete
    pub cursor: u64,
}

/// Operations required of the external key-value store.
///
/// Every method is expected to honor its own expiry: an entry is never
/// returned past its write time plus TTL.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Returns whether a key was removed. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// One round trip of a prefix scan, starting at `cursor` (0 to begin).
    /// Keys may repeat across pages.
    async fn scan_page(&self, prefix: &str, cursor: u64) -> Result<ScanPage, StoreError>;

    /// All live keys starting with `prefix`
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let page = self.scan_page(prefix, cursor).await?;
            keys.extend(page.keys);
            if page.cursor == 0 {
                break;
            }
            cursor = page.cursor;
        }
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    /// Returns the number of keys actually removed
    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Bytes currently used, if the store reports it
    async fn memory_used(&self) -> Result<Option<u64>, StoreError>;
}

/// A stored value with the metadata needed to honor its TTL
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Arc<[u8]>,
    pub ttl: Duration,
    pub written_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            ttl,
            written_at: Utc::now(),
        }
    }
}

/// Expires each entry after its own TTL
struct PerEntryTtl;

impl Expiry<String, CacheEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process store backed by Moka, bounded by total bytes.
///
/// Moka's TinyLFU admission stands in for the LRU eviction requested of an
/// external store.
#[derive(Clone)]
pub struct MokaStore {
    cache: Cache<String, CacheEntry>,
}

impl MokaStore {
    /// Create a store holding at most `max_bytes` of keys and values
    pub fn new(max_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|key: &String, entry: &CacheEntry| -> u32 {
                (key.len() + entry.value.len()).try_into().unwrap_or(u32::MAX)
            })
            .expire_after(PerEntryTtl)
            .build();

        Self { cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl KvStore for MokaStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.cache.get(key).await.map(|entry| entry.value.to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.cache
            .insert(key.to_string(), CacheEntry::new(value, ttl))
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.cache.remove(key).await.is_some())
    }

    /// The whole keyspace is walked in one page
    async fn scan_page(&self, prefix: &str, _cursor: u64) -> Result<ScanPage, StoreError> {
        let keys: Vec<String> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.to_string())
            .collect();
        debug!("Scanned {} keys under prefix {}", keys.len(), prefix);
        Ok(ScanPage { keys, cursor: 0 })
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut removed = 0;
        for key in keys {
            if self.cache.remove(key).await.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn memory_used(&self) -> Result<Option<u64>, StoreError> {
        self.cache.run_pending_tasks().await;
        Ok(Some(self.cache.weighted_size()))
    }
}
