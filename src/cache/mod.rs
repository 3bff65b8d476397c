pub mod facade;
pub mod keys;
pub mod store;
#[cfg(feature = "redis")]
pub mod redis_store;

use crate::breaker::BreakerError;
use thiserror::Error;

pub use facade::{CacheFacade, CacheStats, MemoryPressure};
pub use keys::{build_key, CacheKey, KeyError, KeyParams, KeyPattern, Namespace, ResourceClass};
pub use store::{CacheEntry, KvStore, MokaStore, ScanPage, StoreError};
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Errors surfaced by the cache facade. None of these are ever fatal to a
/// request: the origin remains the fallback of record.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache unavailable: circuit breaker open")]
    BreakerOpen,

    #[error("Cache unavailable: half-open probe slots saturated")]
    HalfOpenSaturated,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

impl From<BreakerError<StoreError>> for CacheError {
    fn from(err: BreakerError<StoreError>) -> Self {
        match err {
            BreakerError::Open => CacheError::BreakerOpen,
            BreakerError::HalfOpenSaturated => CacheError::HalfOpenSaturated,
            BreakerError::Inner(store) => CacheError::Store(store),
        }
    }
}

impl CacheError {
    /// Rejected by policy rather than by an observed store failure
    pub fn is_short_circuit(&self) -> bool {
        matches!(self, CacheError::BreakerOpen | CacheError::HalfOpenSaturated)
    }
}
