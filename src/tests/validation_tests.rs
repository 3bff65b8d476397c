//! tests/validation_tests.rs - Inbound event validation

#[cfg(test)]
mod tests {
    use crate::events::DomainEvent;
    use crate::validation::{validate_event, validate_evm_address, ValidationError};

    const VALID_ADDRESS: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    #[test]
    fn test_evm_address_format() {
        assert!(validate_evm_address(VALID_ADDRESS).is_ok());
        assert!(validate_evm_address(&VALID_ADDRESS.to_lowercase()).is_ok());

        assert_eq!(
            validate_evm_address("  "),
            Err(ValidationError::MissingParameter("address".to_string()))
        );
        for bad in [
            "5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeA",
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAZZ",
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeA*d",
        ] {
            assert!(
                matches!(validate_evm_address(bad), Err(ValidationError::InvalidAddress(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_event_validation() {
        assert!(validate_event(&DomainEvent::IncidentReported {
            chain_id: 7,
            incident_id: 42
        })
        .is_ok());
        assert!(validate_event(&DomainEvent::PoolFundsAdded {
            contract_address: VALID_ADDRESS.to_string(),
            reporter_address: None,
        })
        .is_ok());

        assert!(
            validate_event(&DomainEvent::IncidentResolved {
                chain_id: 1,
                incident_id: 0
            })
            .is_ok(),
            "Incident counters may start at zero"
        );
        assert!(validate_event(&DomainEvent::DisputeResolved {
            dispute_id: 0,
            incident_id: 0,
            reporter_address: VALID_ADDRESS.to_string(),
        })
        .is_ok());
        assert!(matches!(
            validate_event(&DomainEvent::IncidentReported {
                chain_id: 0,
                incident_id: 5
            }),
            Err(ValidationError::InvalidParameter(_))
        ));

        assert!(matches!(
            validate_event(&DomainEvent::NewBlock {
                chain_id: 0,
                block_number: 1
            }),
            Err(ValidationError::InvalidParameter(_))
        ));
        assert!(matches!(
            validate_event(&DomainEvent::RewardClaimed {
                reporter_address: "not-an-address".to_string(),
                contract_address: VALID_ADDRESS.to_string(),
            }),
            Err(ValidationError::InvalidAddress(_))
        ));
        assert!(matches!(
            validate_event(&DomainEvent::PoolFundsAdded {
                contract_address: VALID_ADDRESS.to_string(),
                reporter_address: Some("0x12".to_string()),
            }),
            Err(ValidationError::InvalidAddress(_))
        ));
    }
}
