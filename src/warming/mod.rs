pub mod aggregator;

use crate::cache::{CacheError, CacheFacade, CacheKey, KeyPattern, MemoryPressure};
use crate::events::BlockNotice;
use crate::filters::MembershipFilters;
use backon::{ExponentialBuilder, Retryable};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use aggregator::{AggregationError, Aggregator, HttpAggregator};

/// Retries per aggregate after the first attempt
const AGGREGATE_RETRIES: usize = 2;

/// Result of one warming cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarmOutcome {
    Completed { warmed: usize, failed: usize },
    /// The breaker was rejecting calls; nothing was computed or written
    SkippedBreakerOpen,
    /// The chain was refreshed too recently
    Throttled,
}

/// Recomputes hot aggregates ahead of demand.
///
/// Runs on startup, every warming interval, and whenever a chain produces a
/// block. Every cycle first checks the circuit breaker and is skipped whole
/// when it is rejecting.
pub struct WarmingScheduler {
    cache: CacheFacade,
    filters: Arc<MembershipFilters>,
    aggregator: Arc<dyn Aggregator>,
    block_limiter: DefaultKeyedRateLimiter<u64>,
    backoff: ExponentialBuilder,
}

impl WarmingScheduler {
    pub fn new(
        cache: CacheFacade,
        filters: Arc<MembershipFilters>,
        aggregator: Arc<dyn Aggregator>,
    ) -> Self {
        let min_interval = cache.policy().warming.new_block_min_interval;
        let quota = Quota::with_period(min_interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX));

        Self {
            cache,
            filters,
            aggregator,
            block_limiter: RateLimiter::keyed(quota),
            backoff: ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(2))
                .with_max_times(AGGREGATE_RETRIES),
        }
    }

    /// Run until cancelled: one startup pass, then periodic and new-block cycles
    pub async fn run(
        self: Arc<Self>,
        mut blocks: mpsc::Receiver<BlockNotice>,
        shutdown: CancellationToken,
    ) {
        info!("Starting cache warming scheduler");

        tokio::select! {
            outcome = self.warm_startup() => debug!("Startup warm finished: {:?}", outcome),
            _ = shutdown.cancelled() => {
                info!("Shutting down cache warming scheduler");
                return;
            }
        }

        let mut ticker = interval(self.cache.policy().warming.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and startup already warmed
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.warm_periodic().await;
                    debug!("Periodic warm finished: {:?}", outcome);
                }
                Some(notice) = blocks.recv() => {
                    let outcome = self.warm_new_block(notice).await;
                    debug!("New-block warm for chain {} finished: {:?}", notice.chain_id, outcome);
                }
                _ = shutdown.cancelled() => {
                    info!("Shutting down cache warming scheduler");
                    break;
                }
            }
        }
    }

    /// Build the membership filters, then warm the startup key list
    pub async fn warm_startup(&self) -> WarmOutcome {
        self.filters.refresh_all().await;
        let keys = self.cache.policy().warming.on_startup.clone();
        self.warm_keys("startup", &keys).await
    }

    /// Warm the periodic key list and check store memory pressure
    pub async fn warm_periodic(&self) -> WarmOutcome {
        let keys = self.cache.policy().warming.periodic.clone();
        let outcome = self.warm_keys("periodic", &keys).await;
        if outcome != WarmOutcome::SkippedBreakerOpen {
            self.relieve_memory_pressure().await;
        }
        outcome
    }

    /// Refresh per-chain health and metrics plus the latest incidents after a block
    pub async fn warm_new_block(&self, notice: BlockNotice) -> WarmOutcome {
        // A skipped cycle must not use up the chain's quota
        if self.cache.breaker().is_rejecting() {
            warn!("Skipping new-block warm, circuit breaker open");
            return WarmOutcome::SkippedBreakerOpen;
        }
        if self.block_limiter.check_key(&notice.chain_id).is_err() {
            debug!("Throttled new-block warm for chain {}", notice.chain_id);
            return WarmOutcome::Throttled;
        }

        let mut chains = match self.aggregator.active_chains().await {
            Ok(chains) => chains,
            Err(e) => {
                warn!("Could not list active chains, warming chain {} only: {}", notice.chain_id, e);
                Vec::new()
            }
        };
        if !chains.contains(&notice.chain_id) {
            chains.push(notice.chain_id);
        }

        let count = self.cache.policy().warming.latest_incidents_count;
        let mut keys = vec![CacheKey::IncidentsLatest { count }];
        for chain_id in chains {
            keys.push(CacheKey::ChainHealth(chain_id));
            keys.push(CacheKey::ChainMetrics(chain_id));
        }
        self.warm_keys("new_block", &keys).await
    }

    async fn warm_keys(&self, cycle: &str, keys: &[CacheKey]) -> WarmOutcome {
        if self.cache.breaker().is_rejecting() {
            warn!("Skipping {} warm cycle, circuit breaker open", cycle);
            return WarmOutcome::SkippedBreakerOpen;
        }

        let mut warmed = 0;
        let mut failed = 0;
        for (index, key) in keys.iter().enumerate() {
            let value = match self.compute_with_retry(key).await {
                Ok(value) => value,
                Err(e) => {
                    error!("Failed to compute {} for warming: {}", key, e);
                    failed += 1;
                    continue;
                }
            };

            match self.cache.set_json(key, &value).await {
                Ok(()) => warmed += 1,
                Err(e) if e.is_short_circuit() => {
                    // The store went away mid-cycle; the rest waits for the next one
                    warn!("Abandoning {} warm cycle: {}", cycle, e);
                    failed += keys.len() - index;
                    break;
                }
                Err(CacheError::Serialization(e)) => {
                    error!("Failed to encode {}: {}", key, e);
                    failed += 1;
                }
                Err(_) => failed += 1,
            }
        }

        if failed == 0 {
            info!("Warmed {} keys ({} cycle)", warmed, cycle);
        } else {
            warn!("Warmed {} of {} keys ({} cycle)", warmed, keys.len(), cycle);
        }
        WarmOutcome::Completed { warmed, failed }
    }

    async fn compute_with_retry(
        &self,
        key: &CacheKey,
    ) -> Result<serde_json::Value, AggregationError> {
        let aggregator = &self.aggregator;
        (|| async move { aggregator.compute(key).await })
            .retry(self.backoff)
            .when(AggregationError::is_retryable)
            .notify(|e, delay| debug!("Retrying {} in {:?}: {}", key, delay, e))
            .await
    }

    async fn relieve_memory_pressure(&self) {
        if self.cache.memory_pressure().await != MemoryPressure::High {
            return;
        }

        let search = KeyPattern::prefix(&["search", "incidents"]);
        match self.cache.delete_pattern(&search).await {
            Ok(count) => warn!("Evicted {} search entries under memory pressure", count),
            Err(e) => error!("Failed to evict search entries: {}", e),
        }
    }
}
