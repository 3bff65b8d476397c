// Runtime configuration comes from the environment (.env supported).
// Caching strategy lives in CachePolicy: built once at startup, validated,
// then shared read-only by every component.

use crate::breaker::BreakerConfig;
use crate::cache::keys::{CacheKey, Namespace, ResourceClass};
use crate::events::invalidation;
use crate::filters::{FilterPurpose, FilterSpec};
use dotenv::dotenv;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing TTL for resource class {0}")]
    MissingTtl(ResourceClass),

    #[error("TTL for {0} must be greater than zero")]
    ZeroTtl(String),

    #[error("Invalid breaker setting: {0}")]
    InvalidBreaker(String),

    #[error("Invalid membership filter {purpose:?}: {reason}")]
    InvalidFilter { purpose: FilterPurpose, reason: String },

    #[error("Invalid memory policy: {0}")]
    InvalidMemory(String),

    #[error("Invalid warming policy: {0}")]
    InvalidWarming(String),

    #[error("Store timeouts must be greater than zero")]
    ZeroStoreTimeout,

    #[error("Invalid invalidation template {template}: {reason}")]
    InvalidTemplate { template: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    /// Redis connection string; the in-process store is used when unset
    pub redis_url: Option<String>,
    /// Base URL of the aggregation service the warming scheduler reads from
    pub aggregator_url: String,
    pub aggregator_timeout: Duration,
    pub store_timeout: Duration,
    pub membership_load_timeout: Duration,
    pub dispatcher_queue_capacity: usize,
    pub dispatcher_workers: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_timeout: Duration,
    pub warming_interval: Duration,
    pub new_block_min_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env_or("SERVER_PORT", 8080);
        let redis_url = env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty());
        let aggregator_url = env::var("AGGREGATOR_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8090".to_string());
        let aggregator_timeout = Duration::from_secs(env_or("AGGREGATOR_TIMEOUT_SECS", 10));
        let store_timeout = Duration::from_millis(env_or("STORE_TIMEOUT_MS", 250));
        let membership_load_timeout =
            Duration::from_millis(env_or("MEMBERSHIP_LOAD_TIMEOUT_MS", 5000));
        let dispatcher_queue_capacity = env_or("DISPATCHER_QUEUE_CAPACITY", 1000);
        let dispatcher_workers = env_or("DISPATCHER_WORKERS", num_cpus::get().min(4));
        let breaker_failure_threshold = env_or("BREAKER_FAILURE_THRESHOLD", 5);
        let breaker_success_threshold = env_or("BREAKER_SUCCESS_THRESHOLD", 3);
        let breaker_timeout = Duration::from_secs(env_or("BREAKER_TIMEOUT_SECS", 30));
        let warming_interval = Duration::from_secs(env_or("WARMING_INTERVAL_SECS", 300));
        let new_block_min_interval =
            Duration::from_millis(env_or("NEW_BLOCK_MIN_INTERVAL_MS", 2000));

        Self {
            server_host,
            server_port,
            redis_url,
            aggregator_url,
            aggregator_timeout,
            store_timeout,
            membership_load_timeout,
            dispatcher_queue_capacity,
            dispatcher_workers,
            breaker_failure_threshold,
            breaker_success_threshold,
            breaker_timeout,
            warming_interval,
            new_block_min_interval,
        }
    }

    /// Build and validate the caching policy with this config's overrides applied
    pub fn policy(&self) -> Result<CachePolicy, ConfigError> {
        let mut policy = CachePolicy::default();
        policy.store_timeout = self.store_timeout;
        policy.membership_load_timeout = self.membership_load_timeout;
        policy.breaker.failure_threshold = self.breaker_failure_threshold;
        policy.breaker.success_threshold = self.breaker_success_threshold;
        policy.breaker.timeout = self.breaker_timeout;
        policy.warming.interval = self.warming_interval;
        policy.warming.new_block_min_interval = self.new_block_min_interval;
        policy.validate()?;
        Ok(policy)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Caching policy for a single RPC method
#[derive(Debug, Clone)]
pub struct RpcMethodPolicy {
    pub ttl: Duration,
    /// Drop every cached response of this method when any chain produces a block
    pub invalidate_on_new_block: bool,
}

#[derive(Debug, Clone)]
pub struct WarmingPolicy {
    pub interval: Duration,
    pub on_startup: Vec<CacheKey>,
    pub periodic: Vec<CacheKey>,
    /// Size of the latest-incidents list refreshed on every block
    pub latest_incidents_count: u32,
    /// Minimum spacing between new-block refreshes of one chain
    pub new_block_min_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct MemoryPolicy {
    pub max_bytes: u64,
    pub eviction_policy: &'static str,
    pub high_threshold_pct: u8,
    pub warning_threshold_pct: u8,
    pub namespace_budgets: HashMap<Namespace, u64>,
}

impl MemoryPolicy {
    pub fn high_watermark(&self) -> u64 {
        self.max_bytes / 100 * u64::from(self.high_threshold_pct)
    }

    pub fn warning_watermark(&self) -> u64 {
        self.max_bytes / 100 * u64::from(self.warning_threshold_pct)
    }

    pub fn budget(&self, namespace: Namespace) -> u64 {
        self.namespace_budgets.get(&namespace).copied().unwrap_or(0)
    }
}

/// The complete caching strategy, immutable after startup
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub class_ttls: HashMap<ResourceClass, Duration>,
    /// Per-method TTLs; these take precedence over the `rpc_response` TTL
    pub rpc_overrides: HashMap<String, RpcMethodPolicy>,
    pub breaker: BreakerConfig,
    pub filters: Vec<FilterSpec>,
    pub warming: WarmingPolicy,
    pub memory: MemoryPolicy,
    /// Upper bound on any single store round trip
    pub store_timeout: Duration,
    /// Upper bound on loading one whole membership set
    pub membership_load_timeout: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        let secs = Duration::from_secs;
        let class_ttls = HashMap::from([
            (ResourceClass::RpcResponse, secs(60)),
            (ResourceClass::Reporter, secs(300)),
            (ResourceClass::ReporterStats, secs(300)),
            (ResourceClass::Incident, secs(60)),
            (ResourceClass::IncidentSummary, secs(60)),
            (ResourceClass::ChainHealth, secs(30)),
            (ResourceClass::ChainMetrics, secs(300)),
            (ResourceClass::GlobalMetrics, secs(300)),
            (ResourceClass::RewardPool, secs(120)),
            (ResourceClass::Dispute, secs(300)),
            (ResourceClass::SearchResult, secs(30)),
            (ResourceClass::Leaderboard, secs(600)),
        ]);

        let rpc_overrides = HashMap::from([
            (
                "eth_getLogs".to_string(),
                RpcMethodPolicy {
                    ttl: secs(300),
                    invalidate_on_new_block: false,
                },
            ),
            (
                "eth_getBlockByNumber".to_string(),
                RpcMethodPolicy {
                    ttl: secs(3600),
                    invalidate_on_new_block: false,
                },
            ),
            (
                "eth_getBalance".to_string(),
                RpcMethodPolicy {
                    ttl: secs(15),
                    invalidate_on_new_block: true,
                },
            ),
        ]);

        let filters = vec![
            FilterSpec::new(FilterPurpose::ActiveReporters, 0.01, secs(3600)),
            FilterSpec::new(FilterPurpose::ProcessedIncidents, 0.001, secs(86400)),
            FilterSpec::new(FilterPurpose::BannedReporters, 0.001, secs(3600)),
        ];

        let warming = WarmingPolicy {
            interval: secs(300),
            on_startup: vec![
                CacheKey::GlobalMetrics,
                CacheKey::ReporterLeaderboard { page: 1 },
                CacheKey::ChainLeaderboard,
                CacheKey::DashboardStats,
            ],
            periodic: vec![
                CacheKey::GlobalMetrics,
                CacheKey::ReporterLeaderboard { page: 1 },
                CacheKey::ReporterLeaderboard { page: 2 },
                CacheKey::DashboardStats,
            ],
            latest_incidents_count: 20,
            new_block_min_interval: Duration::from_millis(2000),
        };

        let memory = MemoryPolicy {
            max_bytes: 4 * GB,
            eviction_policy: "allkeys-lru",
            high_threshold_pct: 85,
            warning_threshold_pct: 75,
            namespace_budgets: HashMap::from([
                (Namespace::RpcResponses, 500 * MB),
                (Namespace::QueryResults, GB),
                (Namespace::SearchIndex, GB),
                (Namespace::StatsCache, 500 * MB),
                (Namespace::TempData, 500 * MB),
            ]),
        };

        Self {
            class_ttls,
            rpc_overrides,
            breaker: BreakerConfig::default(),
            filters,
            warming,
            memory,
            store_timeout: Duration::from_millis(250),
            membership_load_timeout: Duration::from_secs(5),
        }
    }
}

impl CachePolicy {
    /// TTL for a resource class
    pub fn ttl_for(&self, class: ResourceClass) -> Duration {
        // validate() guarantees every class is present
        self.class_ttls
            .get(&class)
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }

    /// TTL for an RPC method: the method override if declared, else the class TTL
    pub fn rpc_ttl(&self, method: &str) -> Duration {
        self.rpc_overrides
            .get(method)
            .map(|policy| policy.ttl)
            .unwrap_or_else(|| self.ttl_for(ResourceClass::RpcResponse))
    }

    /// TTL for a concrete key, honoring RPC method overrides
    pub fn ttl_for_key(&self, key: &CacheKey) -> Duration {
        match key.rpc_method() {
            Some(method) => self.rpc_ttl(method),
            None => self.ttl_for(key.resource_class()),
        }
    }

    /// RPC methods whose cached responses are dropped on every new block
    pub fn new_block_rpc_methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self
            .rpc_overrides
            .iter()
            .filter(|(_, policy)| policy.invalidate_on_new_block)
            .map(|(method, _)| method.as_str())
            .collect();
        methods.sort_unstable();
        methods
    }

    pub fn filter_spec(&self, purpose: FilterPurpose) -> Option<&FilterSpec> {
        self.filters.iter().find(|spec| spec.purpose == purpose)
    }

    /// Reject malformed static configuration. Called once at startup; an
    /// error here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for class in ResourceClass::ALL {
            match self.class_ttls.get(&class) {
                None => return Err(ConfigError::MissingTtl(class)),
                Some(ttl) if ttl.is_zero() => return Err(ConfigError::ZeroTtl(class.to_string())),
                Some(_) => {}
            }
        }
        for (method, policy) in &self.rpc_overrides {
            if policy.ttl.is_zero() {
                return Err(ConfigError::ZeroTtl(method.clone()));
            }
        }

        let breaker = &self.breaker;
        if breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidBreaker("failure_threshold must be >= 1".into()));
        }
        if breaker.success_threshold == 0 {
            return Err(ConfigError::InvalidBreaker("success_threshold must be >= 1".into()));
        }
        if breaker.half_open_max_requests == 0 {
            return Err(ConfigError::InvalidBreaker(
                "half_open_max_requests must be >= 1".into(),
            ));
        }
        if breaker.timeout.is_zero() || breaker.metrics_window.is_zero() {
            return Err(ConfigError::InvalidBreaker(
                "timeout and metrics_window must be non-zero".into(),
            ));
        }

        for purpose in FilterPurpose::ALL {
            let spec = self.filter_spec(purpose).ok_or(ConfigError::InvalidFilter {
                purpose,
                reason: "not configured".into(),
            })?;
            if !(spec.false_positive_rate > 0.0 && spec.false_positive_rate < 1.0) {
                return Err(ConfigError::InvalidFilter {
                    purpose,
                    reason: format!("false positive rate {} outside (0, 1)", spec.false_positive_rate),
                });
            }
            if spec.refresh_interval.is_zero() {
                return Err(ConfigError::InvalidFilter {
                    purpose,
                    reason: "refresh interval must be non-zero".into(),
                });
            }
        }

        let memory = &self.memory;
        if memory.warning_threshold_pct >= memory.high_threshold_pct
            || memory.high_threshold_pct > 100
        {
            return Err(ConfigError::InvalidMemory(format!(
                "thresholds warning={}% high={}% must satisfy warning < high <= 100",
                memory.warning_threshold_pct, memory.high_threshold_pct
            )));
        }
        let budgeted: u64 = Namespace::ALL.iter().map(|ns| memory.budget(*ns)).sum();
        if budgeted > memory.max_bytes {
            return Err(ConfigError::InvalidMemory(format!(
                "namespace budgets total {} bytes, above the {} byte ceiling",
                budgeted, memory.max_bytes
            )));
        }

        if self.warming.interval.is_zero() {
            return Err(ConfigError::InvalidWarming("interval must be non-zero".into()));
        }
        if self.warming.latest_incidents_count == 0 {
            return Err(ConfigError::InvalidWarming(
                "latest_incidents_count must be >= 1".into(),
            ));
        }
        if self.store_timeout.is_zero() || self.membership_load_timeout.is_zero() {
            return Err(ConfigError::ZeroStoreTimeout);
        }

        invalidation::validate_templates()
    }
}
