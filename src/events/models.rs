// Domain events delivered by the indexer, at least once per occurrence.
// Events are consumed by the invalidation dispatcher and never persisted.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    IncidentReported {
        chain_id: u64,
        incident_id: u64,
    },
    IncidentResolved {
        chain_id: u64,
        incident_id: u64,
    },
    IncidentEscalated {
        chain_id: u64,
        incident_id: u64,
    },
    RewardClaimed {
        reporter_address: String,
        contract_address: String,
    },
    PoolFundsAdded {
        contract_address: String,
        /// Set when the deposit is credited to a reporter's stake
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reporter_address: Option<String>,
    },
    PoolBalanceAdjusted {
        contract_address: String,
    },
    DisputeResolved {
        dispute_id: u64,
        incident_id: u64,
        reporter_address: String,
    },
    NewBlock {
        chain_id: u64,
        block_number: u64,
    },
}

/// Payload-free discriminant of [`DomainEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTag {
    IncidentReported,
    IncidentResolved,
    IncidentEscalated,
    RewardClaimed,
    PoolFundsAdded,
    PoolBalanceAdjusted,
    DisputeResolved,
    NewBlock,
}

impl EventTag {
    pub const ALL: [EventTag; 8] = [
        Self::IncidentReported,
        Self::IncidentResolved,
        Self::IncidentEscalated,
        Self::RewardClaimed,
        Self::PoolFundsAdded,
        Self::PoolBalanceAdjusted,
        Self::DisputeResolved,
        Self::NewBlock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncidentReported => "incident_reported",
            Self::IncidentResolved => "incident_resolved",
            Self::IncidentEscalated => "incident_escalated",
            Self::RewardClaimed => "reward_claimed",
            Self::PoolFundsAdded => "pool_funds_added",
            Self::PoolBalanceAdjusted => "pool_balance_adjusted",
            Self::DisputeResolved => "dispute_resolved",
            Self::NewBlock => "new_block",
        }
    }

    /// Payload fields carried by events with this tag. Optional fields are
    /// included; templates using them are skipped when they are absent.
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            Self::IncidentReported | Self::IncidentResolved | Self::IncidentEscalated => {
                &["chain_id", "incident_id"]
            }
            Self::RewardClaimed => &["reporter_address", "contract_address"],
            Self::PoolFundsAdded => &["contract_address", "reporter_address"],
            Self::PoolBalanceAdjusted => &["contract_address"],
            Self::DisputeResolved => &["dispute_id", "incident_id", "reporter_address"],
            Self::NewBlock => &["chain_id", "block_number"],
        }
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DomainEvent {
    pub fn tag(&self) -> EventTag {
        match self {
            Self::IncidentReported { .. } => EventTag::IncidentReported,
            Self::IncidentResolved { .. } => EventTag::IncidentResolved,
            Self::IncidentEscalated { .. } => EventTag::IncidentEscalated,
            Self::RewardClaimed { .. } => EventTag::RewardClaimed,
            Self::PoolFundsAdded { .. } => EventTag::PoolFundsAdded,
            Self::PoolBalanceAdjusted { .. } => EventTag::PoolBalanceAdjusted,
            Self::DisputeResolved { .. } => EventTag::DisputeResolved,
            Self::NewBlock { .. } => EventTag::NewBlock,
        }
    }

    pub fn chain_id(&self) -> Option<u64> {
        match self {
            Self::IncidentReported { chain_id, .. }
            | Self::IncidentResolved { chain_id, .. }
            | Self::IncidentEscalated { chain_id, .. }
            | Self::NewBlock { chain_id, .. } => Some(*chain_id),
            _ => None,
        }
    }

    pub fn incident_id(&self) -> Option<u64> {
        match self {
            Self::IncidentReported { incident_id, .. }
            | Self::IncidentResolved { incident_id, .. }
            | Self::IncidentEscalated { incident_id, .. }
            | Self::DisputeResolved { incident_id, .. } => Some(*incident_id),
            _ => None,
        }
    }

    pub fn reporter_address(&self) -> Option<&str> {
        match self {
            Self::RewardClaimed {
                reporter_address, ..
            }
            | Self::DisputeResolved {
                reporter_address, ..
            } => Some(reporter_address),
            Self::PoolFundsAdded {
                reporter_address, ..
            } => reporter_address.as_deref(),
            _ => None,
        }
    }

    pub fn contract_address(&self) -> Option<&str> {
        match self {
            Self::RewardClaimed {
                contract_address, ..
            }
            | Self::PoolFundsAdded {
                contract_address, ..
            }
            | Self::PoolBalanceAdjusted { contract_address } => Some(contract_address),
            _ => None,
        }
    }

    pub fn dispute_id(&self) -> Option<u64> {
        match self {
            Self::DisputeResolved { dispute_id, .. } => Some(*dispute_id),
            _ => None,
        }
    }
}
