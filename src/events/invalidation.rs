//! Static table of the key patterns each domain event invalidates.
//!
//! Templates are resolved against the event payload through the typed key
//! constructors, so every exact pattern renders the same string the cache
//! wrote under.

use super::models::{DomainEvent, EventTag};
use crate::cache::keys::{CacheKey, KeyPattern};
use crate::config::ConfigError;
use std::fmt;

/// One entry of the invalidation table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternTemplate {
    IncidentsLatest,
    IncidentsByChain,
    Incident,
    IncidentSummary,
    ChainMetrics,
    ChainHealth,
    GlobalMetrics,
    DashboardStats,
    ChainLeaderboard,
    ReporterLeaderboard,
    SearchIncidents,
    Reporter,
    ReporterStats,
    RewardPool,
    Dispute,
}

impl PatternTemplate {
    pub fn template(&self) -> &'static str {
        match self {
            Self::IncidentsLatest => "incidents:latest:*",
            Self::IncidentsByChain => "incidents:chain:{chain_id}:*",
            Self::Incident => "incident:{incident_id}",
            Self::IncidentSummary => "incident_summary:{incident_id}",
            Self::ChainMetrics => "chain:metrics:{chain_id}",
            Self::ChainHealth => "chain:health:{chain_id}",
            Self::GlobalMetrics => "global:metrics",
            Self::DashboardStats => "dashboard:stats",
            Self::ChainLeaderboard => "leaderboard:chains",
            Self::ReporterLeaderboard => "leaderboard:reporters:*",
            Self::SearchIncidents => "search:incidents:*",
            Self::Reporter => "reporter:{reporter_address}",
            Self::ReporterStats => "reporter_stats:{reporter_address}",
            Self::RewardPool => "reward:pool:{contract_address}",
            Self::Dispute => "dispute:{dispute_id}",
        }
    }

    /// Bind the template to an event. `None` when the event lacks a field the
    /// template needs, which only happens for optional payload fields.
    pub fn resolve(&self, event: &DomainEvent) -> Option<KeyPattern> {
        let pattern = match self {
            Self::IncidentsLatest => KeyPattern::prefix(&["incidents", "latest"]),
            Self::IncidentsByChain => {
                let chain_id = event.chain_id()?.to_string();
                KeyPattern::prefix(&["incidents", "chain", chain_id.as_str()])
            }
            Self::Incident => KeyPattern::exact(&CacheKey::Incident(event.incident_id()?)),
            Self::IncidentSummary => {
                KeyPattern::exact(&CacheKey::IncidentSummary(event.incident_id()?))
            }
            Self::ChainMetrics => KeyPattern::exact(&CacheKey::ChainMetrics(event.chain_id()?)),
            Self::ChainHealth => KeyPattern::exact(&CacheKey::ChainHealth(event.chain_id()?)),
            Self::GlobalMetrics => KeyPattern::exact(&CacheKey::GlobalMetrics),
            Self::DashboardStats => KeyPattern::exact(&CacheKey::DashboardStats),
            Self::ChainLeaderboard => KeyPattern::exact(&CacheKey::ChainLeaderboard),
            Self::ReporterLeaderboard => KeyPattern::prefix(&["leaderboard", "reporters"]),
            Self::SearchIncidents => KeyPattern::prefix(&["search", "incidents"]),
            Self::Reporter => KeyPattern::exact(&CacheKey::reporter(event.reporter_address()?)),
            Self::ReporterStats => {
                KeyPattern::exact(&CacheKey::reporter_stats(event.reporter_address()?))
            }
            Self::RewardPool => {
                KeyPattern::exact(&CacheKey::reward_pool(event.contract_address()?))
            }
            Self::Dispute => KeyPattern::exact(&CacheKey::Dispute(event.dispute_id()?)),
        };
        Some(pattern)
    }

    /// Placeholder names used by the template, e.g. `chain_id`
    pub fn placeholders(&self) -> Vec<&'static str> {
        let mut rest = self.template();
        let mut names = Vec::new();
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            names.push(&rest[start + 1..start + len]);
            rest = &rest[start + len + 1..];
        }
        names
    }
}

impl fmt::Display for PatternTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.template())
    }
}

use PatternTemplate as P;

const ON_INCIDENT_REPORTED: &[PatternTemplate] = &[
    P::IncidentsLatest,
    P::IncidentsByChain,
    P::IncidentSummary,
    P::ChainMetrics,
    P::ChainHealth,
    P::GlobalMetrics,
    P::DashboardStats,
    P::ChainLeaderboard,
    P::SearchIncidents,
];

const ON_INCIDENT_STATUS_CHANGED: &[PatternTemplate] = &[
    P::IncidentSummary,
    P::Incident,
    P::IncidentsLatest,
    P::IncidentsByChain,
    P::ChainMetrics,
    P::GlobalMetrics,
    P::DashboardStats,
];

const ON_REWARD_CLAIMED: &[PatternTemplate] = &[
    P::ReporterStats,
    P::Reporter,
    P::RewardPool,
    P::ReporterLeaderboard,
    P::GlobalMetrics,
    P::DashboardStats,
];

const ON_POOL_FUNDS_ADDED: &[PatternTemplate] = &[
    P::RewardPool,
    P::GlobalMetrics,
    P::ReporterStats,
    P::Reporter,
    P::ReporterLeaderboard,
];

const ON_POOL_BALANCE_ADJUSTED: &[PatternTemplate] =
    &[P::RewardPool, P::GlobalMetrics, P::DashboardStats];

const ON_DISPUTE_RESOLVED: &[PatternTemplate] = &[
    P::Dispute,
    P::IncidentSummary,
    P::ReporterStats,
    P::ReporterLeaderboard,
];

// RPC methods flagged invalidate_on_new_block are added by the dispatcher
const ON_NEW_BLOCK: &[PatternTemplate] = &[P::ChainHealth];

/// Ordered pattern templates for an event tag
pub fn templates_for(tag: EventTag) -> &'static [PatternTemplate] {
    match tag {
        EventTag::IncidentReported => ON_INCIDENT_REPORTED,
        EventTag::IncidentResolved | EventTag::IncidentEscalated => ON_INCIDENT_STATUS_CHANGED,
        EventTag::RewardClaimed => ON_REWARD_CLAIMED,
        EventTag::PoolFundsAdded => ON_POOL_FUNDS_ADDED,
        EventTag::PoolBalanceAdjusted => ON_POOL_BALANCE_ADJUSTED,
        EventTag::DisputeResolved => ON_DISPUTE_RESOLVED,
        EventTag::NewBlock => ON_NEW_BLOCK,
    }
}

/// Resolve the event's templates into concrete deletion targets
pub fn patterns_for(event: &DomainEvent) -> Vec<KeyPattern> {
    templates_for(event.tag())
        .iter()
        .filter_map(|template| template.resolve(event))
        .collect()
}

/// Check the table against the key grammar and the event payloads: every
/// placeholder names a field the event carries, and wildcards only appear
/// as a trailing `:*`.
pub fn validate_templates() -> Result<(), ConfigError> {
    for tag in EventTag::ALL {
        let fields = tag.fields();
        for template in templates_for(tag) {
            let raw = template.template();
            let invalid = |reason: String| ConfigError::InvalidTemplate {
                template: raw.to_string(),
                reason,
            };

            for name in template.placeholders() {
                if !fields.contains(&name) {
                    return Err(invalid(format!("{} events carry no {}", tag, name)));
                }
            }

            let stars = raw.matches('*').count();
            if stars > 1 || (stars == 1 && !raw.ends_with(":*")) {
                return Err(invalid("wildcards must be a single trailing :*".into()));
            }
            if raw.contains("::") || raw.starts_with(':') {
                return Err(invalid("empty key segment".into()));
            }
        }
    }
    Ok(())
}
