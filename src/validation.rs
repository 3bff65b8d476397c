use crate::events::DomainEvent;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid EVM address format: {0}")]
    InvalidAddress(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

pub fn validate_evm_address(address: &str) -> Result<(), ValidationError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ValidationError::MissingParameter("address".to_string()));
    }

    // 0x followed by 20 bytes of hex
    let digits = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .ok_or_else(|| ValidationError::InvalidAddress(address.to_string()))?;
    match hex::decode(digits) {
        Ok(bytes) if bytes.len() == 20 => Ok(()),
        _ => Err(ValidationError::InvalidAddress(address.to_string())),
    }
}

/// Chain ids start at 1. Incident and dispute ids are on-chain counters
/// that may start at 0, so they are not checked.
fn validate_chain_id(chain_id: u64) -> Result<(), ValidationError> {
    if chain_id == 0 {
        return Err(ValidationError::InvalidParameter(
            "chain_id must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

/// Check an inbound event before it is queued for invalidation
pub fn validate_event(event: &DomainEvent) -> Result<(), ValidationError> {
    match event {
        DomainEvent::IncidentReported { chain_id, .. }
        | DomainEvent::IncidentResolved { chain_id, .. }
        | DomainEvent::IncidentEscalated { chain_id, .. }
        | DomainEvent::NewBlock { chain_id, .. } => validate_chain_id(*chain_id),
        DomainEvent::RewardClaimed {
            reporter_address,
            contract_address,
        } => {
            validate_evm_address(reporter_address)?;
            validate_evm_address(contract_address)
        }
        DomainEvent::PoolFundsAdded {
            contract_address,
            reporter_address,
        } => {
            validate_evm_address(contract_address)?;
            match reporter_address {
                Some(address) => validate_evm_address(address),
                None => Ok(()),
            }
        }
        DomainEvent::PoolBalanceAdjusted { contract_address } => {
            validate_evm_address(contract_address)
        }
        DomainEvent::DisputeResolved {
            reporter_address, ..
        } => validate_evm_address(reporter_address),
    }
}
