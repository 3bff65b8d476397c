//! Cache key generation and invalidation patterns

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Hex characters of the SHA-256 digest kept in hashed key segments
const HASH_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Missing key parameter: {0}")]
    MissingParam(&'static str),

    #[error("Invalid key parameter {name}: {value}")]
    InvalidParam { name: &'static str, value: String },

    #[error("Wildcard not allowed in exact key: {0}")]
    Wildcard(String),

    #[error("Malformed key pattern: {0}")]
    MalformedPattern(String),
}

/// Every cached value belongs to exactly one resource class, which fixes its
/// TTL and the memory namespace it is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    RpcResponse,
    Reporter,
    ReporterStats,
    Incident,
    IncidentSummary,
    ChainHealth,
    ChainMetrics,
    GlobalMetrics,
    RewardPool,
    Dispute,
    SearchResult,
    Leaderboard,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 12] = [
        Self::RpcResponse,
        Self::Reporter,
        Self::ReporterStats,
        Self::Incident,
        Self::IncidentSummary,
        Self::ChainHealth,
        Self::ChainMetrics,
        Self::GlobalMetrics,
        Self::RewardPool,
        Self::Dispute,
        Self::SearchResult,
        Self::Leaderboard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RpcResponse => "rpc_response",
            Self::Reporter => "reporter",
            Self::ReporterStats => "reporter_stats",
            Self::Incident => "incident",
            Self::IncidentSummary => "incident_summary",
            Self::ChainHealth => "chain_health",
            Self::ChainMetrics => "chain_metrics",
            Self::GlobalMetrics => "global_metrics",
            Self::RewardPool => "reward_pool",
            Self::Dispute => "dispute",
            Self::SearchResult => "search_result",
            Self::Leaderboard => "leaderboard",
        }
    }

    /// Memory namespace this class is budgeted against
    pub fn namespace(&self) -> Namespace {
        match self {
            Self::RpcResponse => Namespace::RpcResponses,
            Self::Reporter
            | Self::ReporterStats
            | Self::Incident
            | Self::IncidentSummary
            | Self::RewardPool
            | Self::Dispute => Namespace::QueryResults,
            Self::SearchResult => Namespace::SearchIndex,
            Self::ChainHealth | Self::ChainMetrics | Self::GlobalMetrics | Self::Leaderboard => {
                Namespace::StatsCache
            }
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory namespaces requested of the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    RpcResponses,
    QueryResults,
    SearchIndex,
    StatsCache,
    TempData,
}

impl Namespace {
    pub const ALL: [Namespace; 5] = [
        Self::RpcResponses,
        Self::QueryResults,
        Self::SearchIndex,
        Self::StatsCache,
        Self::TempData,
    ];
}

/// A structured cache key that can be converted to a string
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Key for an RPC response, `params_hash` covers the canonical params
    RpcCall { method: String, params_hash: String },
    Reporter(String),
    ReporterStats(String),
    Incident(u64),
    IncidentsByChain { chain_id: u64, page: u32 },
    IncidentsLatest { count: u32 },
    IncidentSummary(u64),
    ChainHealth(u64),
    ChainMetrics(u64),
    GlobalMetrics,
    DashboardStats,
    RewardPool(String),
    Dispute(u64),
    SearchIncidents { query_hash: String, page: u32 },
    ReporterLeaderboard { page: u32 },
    ChainLeaderboard,
}

impl CacheKey {
    /// Create an RPC response key. Parameter order inside JSON objects does
    /// not affect the resulting key.
    pub fn rpc_call(method: &str, params: &Value) -> Self {
        Self::RpcCall {
            method: method.to_string(),
            params_hash: params_hash(params),
        }
    }

    pub fn reporter(address: &str) -> Self {
        Self::Reporter(normalize_address(address))
    }

    pub fn reporter_stats(address: &str) -> Self {
        Self::ReporterStats(normalize_address(address))
    }

    pub fn reward_pool(contract_address: &str) -> Self {
        Self::RewardPool(normalize_address(contract_address))
    }

    /// Create a search key. The query is normalized and hashed so free text
    /// never leaks separators or wildcards into the key.
    pub fn search_incidents(query: &str, page: u32) -> Self {
        let normalized = query.trim().to_lowercase();
        Self::SearchIncidents {
            query_hash: short_digest(normalized.as_bytes()),
            page,
        }
    }

    /// Resource class that decides this key's TTL
    pub fn resource_class(&self) -> ResourceClass {
        match self {
            Self::RpcCall { .. } => ResourceClass::RpcResponse,
            Self::Reporter(_) => ResourceClass::Reporter,
            Self::ReporterStats(_) => ResourceClass::ReporterStats,
            Self::Incident(_) => ResourceClass::Incident,
            Self::IncidentsByChain { .. } | Self::IncidentsLatest { .. } => {
                ResourceClass::SearchResult
            }
            Self::IncidentSummary(_) => ResourceClass::IncidentSummary,
            Self::ChainHealth(_) => ResourceClass::ChainHealth,
            Self::ChainMetrics(_) => ResourceClass::ChainMetrics,
            Self::GlobalMetrics | Self::DashboardStats => ResourceClass::GlobalMetrics,
            Self::RewardPool(_) => ResourceClass::RewardPool,
            Self::Dispute(_) => ResourceClass::Dispute,
            Self::SearchIncidents { .. } => ResourceClass::SearchResult,
            Self::ReporterLeaderboard { .. } | Self::ChainLeaderboard => {
                ResourceClass::Leaderboard
            }
        }
    }

    /// The RPC method for `RpcCall` keys
    pub fn rpc_method(&self) -> Option<&str> {
        match self {
            Self::RpcCall { method, .. } => Some(method),
            _ => None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RpcCall { method, params_hash } => write!(f, "rpc:{}:{}", method, params_hash),
            Self::Reporter(address) => write!(f, "reporter:{}", address),
            Self::ReporterStats(address) => write!(f, "reporter_stats:{}", address),
            Self::Incident(id) => write!(f, "incident:{}", id),
            Self::IncidentsByChain { chain_id, page } => {
                write!(f, "incidents:chain:{}:page:{}", chain_id, page)
            }
            Self::IncidentsLatest { count } => write!(f, "incidents:latest:{}", count),
            Self::IncidentSummary(id) => write!(f, "incident_summary:{}", id),
            Self::ChainHealth(chain_id) => write!(f, "chain:health:{}", chain_id),
            Self::ChainMetrics(chain_id) => write!(f, "chain:metrics:{}", chain_id),
            Self::GlobalMetrics => f.write_str("global:metrics"),
            Self::DashboardStats => f.write_str("dashboard:stats"),
            Self::RewardPool(contract) => write!(f, "reward:pool:{}", contract),
            Self::Dispute(id) => write!(f, "dispute:{}", id),
            Self::SearchIncidents { query_hash, page } => {
                write!(f, "search:incidents:{}:page:{}", query_hash, page)
            }
            Self::ReporterLeaderboard { page } => write!(f, "leaderboard:reporters:page:{}", page),
            Self::ChainLeaderboard => f.write_str("leaderboard:chains"),
        }
    }
}

/// Named parameters for [`build_key`]
pub type KeyParams = HashMap<String, Value>;

/// Resolve a key for `class` from named parameters.
///
/// Classes with more than one template pick by which parameters are present:
/// `SearchResult` takes `query`+`page`, `chain_id`+`page` or `count`;
/// `GlobalMetrics` takes an optional `view` of `"dashboard"`; `Leaderboard`
/// with `page` is the reporter board, without it the chain board.
pub fn build_key(class: ResourceClass, params: &KeyParams) -> Result<CacheKey, KeyError> {
    let key = match class {
        ResourceClass::RpcResponse => {
            let method = str_param(params, "method")?;
            let rpc_params = params.get("params").cloned().unwrap_or(Value::Null);
            CacheKey::rpc_call(method, &rpc_params)
        }
        ResourceClass::Reporter => CacheKey::reporter(str_param(params, "address")?),
        ResourceClass::ReporterStats => CacheKey::reporter_stats(str_param(params, "address")?),
        ResourceClass::Incident => CacheKey::Incident(u64_param(params, "incident_id")?),
        ResourceClass::IncidentSummary => {
            CacheKey::IncidentSummary(u64_param(params, "incident_id")?)
        }
        ResourceClass::ChainHealth => CacheKey::ChainHealth(u64_param(params, "chain_id")?),
        ResourceClass::ChainMetrics => CacheKey::ChainMetrics(u64_param(params, "chain_id")?),
        ResourceClass::GlobalMetrics => match params.get("view").and_then(Value::as_str) {
            Some("dashboard") => CacheKey::DashboardStats,
            _ => CacheKey::GlobalMetrics,
        },
        ResourceClass::RewardPool => CacheKey::reward_pool(str_param(params, "contract_address")?),
        ResourceClass::Dispute => CacheKey::Dispute(u64_param(params, "dispute_id")?),
        ResourceClass::SearchResult => {
            if params.contains_key("query") {
                CacheKey::search_incidents(str_param(params, "query")?, u32_param(params, "page")?)
            } else if params.contains_key("chain_id") {
                CacheKey::IncidentsByChain {
                    chain_id: u64_param(params, "chain_id")?,
                    page: u32_param(params, "page")?,
                }
            } else {
                CacheKey::IncidentsLatest {
                    count: u32_param(params, "count")?,
                }
            }
        }
        ResourceClass::Leaderboard => {
            if params.contains_key("page") {
                CacheKey::ReporterLeaderboard {
                    page: u32_param(params, "page")?,
                }
            } else {
                CacheKey::ChainLeaderboard
            }
        }
    };

    let rendered = key.to_string();
    if rendered.contains('*') {
        return Err(KeyError::Wildcard(rendered));
    }
    Ok(key)
}

fn str_param<'a>(params: &'a KeyParams, name: &'static str) -> Result<&'a str, KeyError> {
    match params.get(name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(other) => Err(KeyError::InvalidParam {
            name,
            value: other.to_string(),
        }),
        None => Err(KeyError::MissingParam(name)),
    }
}

fn u64_param(params: &KeyParams, name: &'static str) -> Result<u64, KeyError> {
    match params.get(name) {
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| KeyError::InvalidParam {
            name,
            value: n.to_string(),
        }),
        Some(Value::String(s)) => s.parse().map_err(|_| KeyError::InvalidParam {
            name,
            value: s.clone(),
        }),
        Some(other) => Err(KeyError::InvalidParam {
            name,
            value: other.to_string(),
        }),
        None => Err(KeyError::MissingParam(name)),
    }
}

fn u32_param(params: &KeyParams, name: &'static str) -> Result<u32, KeyError> {
    let value = u64_param(params, name)?;
    u32::try_from(value).map_err(|_| KeyError::InvalidParam {
        name,
        value: value.to_string(),
    })
}

/// Lowercase hex addresses so differently-cased inputs share one key
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Stable hash of the canonical JSON form of `params`
pub fn params_hash(params: &Value) -> String {
    let canonical = canonicalize(params);
    // Keys are sorted explicitly: serde_json keeps insertion order when
    // another crate in the graph enables `preserve_order`.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    short_digest(&bytes)
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn short_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut encoded = hex::encode(digest);
    encoded.truncate(HASH_LEN);
    encoded
}

/// A deletion target: one exact key or every key under a prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    Exact(String),
    /// Stored without the trailing `*`, always ending in `:`
    Prefix(String),
}

impl KeyPattern {
    pub fn exact(key: &CacheKey) -> Self {
        Self::Exact(key.to_string())
    }

    /// Build a prefix pattern from its segments, e.g. `["incidents", "chain", "7"]`
    /// becomes `incidents:chain:7:*`
    pub fn prefix(segments: &[&str]) -> Self {
        let mut prefix = segments.join(":");
        prefix.push(':');
        Self::Prefix(prefix)
    }

    /// Parse a rendered pattern. `*` is only accepted as a trailing `:*`.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        if let Some(prefix) = raw.strip_suffix('*') {
            if !prefix.ends_with(':') || prefix.len() < 2 || prefix.contains('*') {
                return Err(KeyError::MalformedPattern(raw.to_string()));
            }
            return Ok(Self::Prefix(prefix.to_string()));
        }
        if raw.is_empty() || raw.contains('*') {
            return Err(KeyError::MalformedPattern(raw.to_string()));
        }
        Ok(Self::Exact(raw.to_string()))
    }

    pub fn is_prefix(&self) -> bool {
        matches!(self, Self::Prefix(_))
    }

    /// Whether a concrete key falls under this pattern
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(key) => f.write_str(key),
            Self::Prefix(prefix) => write!(f, "{}*", prefix),
        }
    }
}
