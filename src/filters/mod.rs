//! Probabilistic membership filters for fast negative lookups

pub mod bloom;

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::cache::{KvStore, StoreError};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use bloom::BloomFilter;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Membership source unavailable: circuit breaker open")]
    BreakerOpen,

    #[error("Membership source unavailable: half-open probe slots saturated")]
    HalfOpenSaturated,

    #[error("Failed to load membership set: {0}")]
    Source(#[from] StoreError),

    #[error("No filter configured for {0}")]
    NotConfigured(FilterPurpose),
}

impl From<BreakerError<StoreError>> for FilterError {
    fn from(err: BreakerError<StoreError>) -> Self {
        match err {
            BreakerError::Open => FilterError::BreakerOpen,
            BreakerError::HalfOpenSaturated => FilterError::HalfOpenSaturated,
            BreakerError::Inner(e) => FilterError::Source(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterPurpose {
    /// Addresses currently registered as active reporters
    ActiveReporters,
    /// Incident ids already processed, to reject duplicates
    ProcessedIncidents,
    /// Addresses banned from reporting
    BannedReporters,
}

impl FilterPurpose {
    pub const ALL: [FilterPurpose; 3] = [
        Self::ActiveReporters,
        Self::ProcessedIncidents,
        Self::BannedReporters,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActiveReporters => "active_reporters",
            Self::ProcessedIncidents => "processed_incidents",
            Self::BannedReporters => "banned_reporters",
        }
    }

    /// Canonical form of an item for this purpose
    pub fn normalize(&self, item: &str) -> String {
        match self {
            Self::ActiveReporters | Self::BannedReporters => item.trim().to_lowercase(),
            Self::ProcessedIncidents => item.trim().to_string(),
        }
    }
}

impl fmt::Display for FilterPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|purpose| purpose.as_str() == s)
            .ok_or_else(|| format!("unknown filter purpose: {}", s))
    }
}

#[derive(Debug, Clone)]
pub struct FilterSpec {
    pub purpose: FilterPurpose,
    pub false_positive_rate: f64,
    pub refresh_interval: Duration,
}

impl FilterSpec {
    pub fn new(purpose: FilterPurpose, false_positive_rate: f64, refresh_interval: Duration) -> Self {
        Self {
            purpose,
            false_positive_rate,
            refresh_interval,
        }
    }
}

/// Authoritative membership sets the filters are rebuilt from
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn load(&self, purpose: FilterPurpose) -> Result<Vec<String>, StoreError>;
}

/// Reads members stored as `membership:{purpose}:{item}` keys in the backing store
pub struct StoreMembershipSource {
    store: Arc<dyn KvStore>,
}

impl StoreMembershipSource {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn prefix(purpose: FilterPurpose) -> String {
        format!("membership:{}:", purpose)
    }

    pub fn member_key(purpose: FilterPurpose, item: &str) -> String {
        format!("{}{}", Self::prefix(purpose), purpose.normalize(item))
    }
}

#[async_trait]
impl MembershipSource for StoreMembershipSource {
    async fn load(&self, purpose: FilterPurpose) -> Result<Vec<String>, StoreError> {
        let prefix = Self::prefix(purpose);
        let keys = self.store.scan(&prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}

/// A published filter generation. `bloom` is `None` until the first build.
#[derive(Debug)]
struct FilterSnapshot {
    bloom: Option<BloomFilter>,
    refreshed_at: Option<DateTime<Utc>>,
}

/// One filter; readers load the current snapshot, refreshes swap in a new one
struct MembershipFilter {
    spec: FilterSpec,
    current: ArcSwap<FilterSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterStatus {
    pub purpose: FilterPurpose,
    pub false_positive_rate: f64,
    pub refresh_interval_secs: u64,
    pub items: Option<usize>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// The set of membership filters, refreshed through the circuit breaker
pub struct MembershipFilters {
    filters: HashMap<FilterPurpose, MembershipFilter>,
    source: Arc<dyn MembershipSource>,
    breaker: Arc<CircuitBreaker>,
    /// Upper bound on one full load of a membership set
    load_timeout: Duration,
}

impl MembershipFilters {
    pub fn new(
        specs: &[FilterSpec],
        source: Arc<dyn MembershipSource>,
        breaker: Arc<CircuitBreaker>,
        load_timeout: Duration,
    ) -> Self {
        let filters = specs
            .iter()
            .map(|spec| {
                let filter = MembershipFilter {
                    spec: spec.clone(),
                    current: ArcSwap::from_pointee(FilterSnapshot {
                        bloom: None,
                        refreshed_at: None,
                    }),
                };
                (spec.purpose, filter)
            })
            .collect();

        Self {
            filters,
            source,
            breaker,
            load_timeout,
        }
    }

    /// `false` means `item` is definitely absent and the real lookup can be
    /// skipped. A filter that has never been built answers `true`.
    pub fn might_contain(&self, purpose: FilterPurpose, item: &str) -> bool {
        let Some(filter) = self.filters.get(&purpose) else {
            return true;
        };
        let snapshot = filter.current.load();
        match &snapshot.bloom {
            Some(bloom) => bloom.might_contain(&purpose.normalize(item)),
            None => true,
        }
    }

    /// Rebuild one filter from its authoritative set. On failure the previous
    /// filter stays in service.
    pub async fn refresh(&self, purpose: FilterPurpose) -> Result<usize, FilterError> {
        let filter = self
            .filters
            .get(&purpose)
            .ok_or(FilterError::NotConfigured(purpose))?;

        let timeout = self.load_timeout;
        let load = async move {
            match tokio::time::timeout(timeout, self.source.load(purpose)).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(timeout)),
            }
        };
        let members = self.breaker.execute(load).await?;
        let normalized: Vec<String> = members.iter().map(|m| purpose.normalize(m)).collect();
        let count = normalized.len();

        let bloom = BloomFilter::from_items(normalized, filter.spec.false_positive_rate);
        debug!(
            purpose = %purpose,
            bits = bloom.num_bits(),
            hashes = bloom.num_hashes(),
            "Built membership filter"
        );
        filter.current.store(Arc::new(FilterSnapshot {
            bloom: Some(bloom),
            refreshed_at: Some(Utc::now()),
        }));

        info!("Refreshed {} filter with {} members", purpose, count);
        Ok(count)
    }

    /// Refresh every filter, logging failures
    pub async fn refresh_all(&self) {
        for purpose in self.purposes() {
            if let Err(e) = self.refresh(purpose).await {
                warn!("Keeping stale {} filter: {}", purpose, e);
            }
        }
    }

    pub fn purposes(&self) -> Vec<FilterPurpose> {
        FilterPurpose::ALL
            .into_iter()
            .filter(|purpose| self.filters.contains_key(purpose))
            .collect()
    }

    pub fn status(&self) -> Vec<FilterStatus> {
        self.purposes()
            .into_iter()
            .filter_map(|purpose| {
                let filter = self.filters.get(&purpose)?;
                let snapshot = filter.current.load();
                Some(FilterStatus {
                    purpose,
                    false_positive_rate: filter.spec.false_positive_rate,
                    refresh_interval_secs: filter.spec.refresh_interval.as_secs(),
                    items: snapshot.bloom.as_ref().map(BloomFilter::len),
                    refreshed_at: snapshot.refreshed_at,
                })
            })
            .collect()
    }

    /// Start one refresh loop per filter, each on its own interval. The
    /// initial build is left to the warming scheduler's startup pass.
    pub fn spawn_refresh_loops(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.purposes()
            .into_iter()
            .filter_map(|purpose| {
                let period = self.filters.get(&purpose)?.spec.refresh_interval;
                let filters = Arc::clone(self);
                let shutdown = shutdown.clone();

                Some(tokio::spawn(async move {
                    let mut ticker = interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    // The first tick completes immediately
                    ticker.tick().await;

                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                if filters.breaker.is_rejecting() {
                                    warn!("Skipping {} filter refresh, circuit breaker open", purpose);
                                    continue;
                                }
                                if let Err(e) = filters.refresh(purpose).await {
                                    error!("Error refreshing {} filter: {}", purpose, e);
                                }
                            }
                            _ = shutdown.cancelled() => {
                                info!("Shutting down {} filter refresh", purpose);
                                break;
                            }
                        }
                    }
                }))
            })
            .collect()
    }
}
