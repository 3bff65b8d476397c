//! tests/dispatcher_tests.rs - Event fan-out invalidation

#[cfg(test)]
mod tests {
    use crate::cache::{CacheKey, KvStore};
    use crate::events::invalidation::{patterns_for, templates_for, validate_templates};
    use crate::events::{
        BlockNotice, DispatchError, DomainEvent, EventTag, InvalidationDispatcher,
    };
    use crate::tests::support::{facade_over, trip_breaker, ScriptedStore};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    const REPORTER: &str = "0x1111111111111111111111111111111111111111";
    const POOL: &str = "0x2222222222222222222222222222222222222222";

    fn incident_reported() -> DomainEvent {
        DomainEvent::IncidentReported {
            chain_id: 7,
            incident_id: 42,
        }
    }

    fn rendered(event: &DomainEvent) -> Vec<String> {
        patterns_for(event).iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_incident_reported_resolves_exactly_nine_patterns() {
        assert_eq!(
            rendered(&incident_reported()),
            vec![
                "incidents:latest:*",
                "incidents:chain:7:*",
                "incident_summary:42",
                "chain:metrics:7",
                "chain:health:7",
                "global:metrics",
                "dashboard:stats",
                "leaderboard:chains",
                "search:incidents:*",
            ]
        );
    }

    #[test]
    fn test_every_tag_has_templates_and_table_is_valid() {
        for tag in EventTag::ALL {
            assert!(!templates_for(tag).is_empty(), "{} has no invalidation entries", tag);
        }
        assert_eq!(validate_templates(), Ok(()));
    }

    #[test]
    fn test_optional_reporter_on_pool_funds_added() {
        let without = DomainEvent::PoolFundsAdded {
            contract_address: POOL.to_string(),
            reporter_address: None,
        };
        assert_eq!(
            rendered(&without),
            vec![
                format!("reward:pool:{}", POOL),
                "global:metrics".to_string(),
                "leaderboard:reporters:*".to_string(),
            ],
            "Only the reporter-specific keys depend on the optional address"
        );

        let with = DomainEvent::PoolFundsAdded {
            contract_address: POOL.to_string(),
            reporter_address: Some(REPORTER.to_string()),
        };
        let patterns = rendered(&with);
        assert_eq!(patterns.len(), 5);
        assert!(patterns.contains(&format!("reporter_stats:{}", REPORTER)));
        assert!(patterns.contains(&"leaderboard:reporters:*".to_string()));
    }

    #[test]
    fn test_dispute_resolved_patterns() {
        let event = DomainEvent::DisputeResolved {
            dispute_id: 3,
            incident_id: 42,
            reporter_address: REPORTER.to_string(),
        };
        assert_eq!(
            rendered(&event),
            vec![
                "dispute:3".to_string(),
                "incident_summary:42".to_string(),
                format!("reporter_stats:{}", REPORTER),
                "leaderboard:reporters:*".to_string(),
            ]
        );
    }

    #[test]
    fn test_events_decode_from_tagged_json() {
        let event: DomainEvent =
            serde_json::from_value(json!({ "type": "incident_reported", "chain_id": 7, "incident_id": 42 }))
                .unwrap();
        assert_eq!(event, incident_reported());

        let event: DomainEvent =
            serde_json::from_value(json!({ "type": "pool_funds_added", "contract_address": POOL }))
                .unwrap();
        assert_eq!(event.contract_address(), Some(POOL));
        assert_eq!(event.reporter_address(), None);
    }

    #[tokio::test]
    async fn test_dispatch_deletes_matching_keys_only() {
        let store = ScriptedStore::new();
        let dispatcher = InvalidationDispatcher::new(facade_over(store.clone()), 16);

        let invalidated = [
            "incidents:latest:20",
            "incidents:chain:7:page:1",
            "incidents:chain:7:page:2",
            "incident_summary:42",
            "chain:metrics:7",
            "chain:health:7",
            "global:metrics",
            "dashboard:stats",
            "leaderboard:chains",
            "search:incidents:abc:page:1",
        ];
        let untouched = [
            "incidents:chain:8:page:1",
            "incident_summary:43",
            "incident:42",
            "chain:metrics:8",
            "leaderboard:reporters:page:1",
            "reward:pool:0x2222222222222222222222222222222222222222",
        ];
        for key in invalidated.iter().chain(untouched.iter()) {
            store.seed(key);
        }

        let report = dispatcher.dispatch(&incident_reported()).await;

        assert!(report.is_complete());
        assert_eq!(report.patterns.len(), 9);
        assert_eq!(report.deleted_keys, invalidated.len() as u64);
        for key in invalidated {
            assert!(!store.contains(key), "{} should have been invalidated", key);
        }
        for key in untouched {
            assert!(store.contains(key), "{} should not have been touched", key);
        }
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_harmless() {
        let store = ScriptedStore::new();
        let dispatcher = InvalidationDispatcher::new(facade_over(store.clone()), 16);
        store.seed("chain:health:7");

        let first = dispatcher.dispatch(&incident_reported()).await;
        let second = dispatcher.dispatch(&incident_reported()).await;

        assert_eq!(first.deleted_keys, 1);
        assert_eq!(second.deleted_keys, 0);
        assert!(second.is_complete());
        assert_eq!(dispatcher.stats().dispatched, 2);
    }

    #[tokio::test]
    async fn test_new_block_drops_balance_responses_and_notifies_warming() {
        let store = ScriptedStore::new();
        let cache = facade_over(store.clone());
        let (block_tx, mut block_rx) = mpsc::channel(4);
        let dispatcher = InvalidationDispatcher::new(cache.clone(), 16).with_block_notices(block_tx);

        let params = json!([REPORTER, "latest"]);
        cache.set_rpc("eth_getBalance", &params, b"0x10".to_vec()).await.unwrap();
        cache.set_rpc("eth_getLogs", &params, b"[]".to_vec()).await.unwrap();

        let report = dispatcher
            .dispatch(&DomainEvent::NewBlock {
                chain_id: 7,
                block_number: 1_000,
            })
            .await;

        assert!(report.patterns.contains(&"rpc:eth_getBalance:*".to_string()));
        assert!(cache.get_rpc("eth_getBalance", &params).await.is_none());
        assert!(cache.get_rpc("eth_getLogs", &params).await.is_some());
        assert_eq!(
            block_rx.try_recv().unwrap(),
            BlockNotice {
                chain_id: 7,
                block_number: 1_000
            }
        );
    }

    #[tokio::test]
    async fn test_open_breaker_failures_are_reported_not_raised() {
        let store = ScriptedStore::new();
        let cache = facade_over(store.clone());
        let dispatcher = InvalidationDispatcher::new(cache.clone(), 16);
        trip_breaker(&cache, &store).await;
        let calls_before = store.calls();

        let report = dispatcher.dispatch(&incident_reported()).await;

        assert!(!report.is_complete());
        assert_eq!(report.failures.len(), 9, "Every pattern should be reported as failed");
        assert_eq!(store.calls(), calls_before, "Open breaker must keep deletes off the store");
        assert_eq!(dispatcher.stats().failed_patterns, 9);
    }

    #[tokio::test]
    async fn test_on_event_never_blocks_when_queue_is_full() {
        let store = ScriptedStore::new();
        let dispatcher = InvalidationDispatcher::new(facade_over(store), 1);

        assert_eq!(dispatcher.on_event(incident_reported()), Ok(()));
        assert_eq!(
            dispatcher.on_event(incident_reported()),
            Err(DispatchError::QueueFull(EventTag::IncidentReported))
        );

        let stats = dispatcher.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_workers_drain_the_queue() {
        let store = ScriptedStore::new();
        let dispatcher = Arc::new(InvalidationDispatcher::new(facade_over(store.clone()), 16));
        let shutdown = CancellationToken::new();
        let workers = dispatcher.spawn_workers(2, shutdown.clone());
        assert_eq!(workers.len(), 2);
        assert!(dispatcher.spawn_workers(2, shutdown.clone()).is_empty(), "Workers start once");

        store.seed(&CacheKey::IncidentSummary(42).to_string());
        dispatcher
            .on_event(DomainEvent::IncidentResolved {
                chain_id: 7,
                incident_id: 42,
            })
            .unwrap();

        let mut drained = false;
        for _ in 0..50 {
            if !store.contains("incident_summary:42") {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(drained, "A worker should have invalidated the incident summary");

        shutdown.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_store_membership_keys_are_not_invalidated() {
        let store = ScriptedStore::new();
        let dispatcher = InvalidationDispatcher::new(facade_over(store.clone()), 16);
        store.seed("membership:active_reporters:0x1111111111111111111111111111111111111111");

        dispatcher
            .dispatch(&DomainEvent::RewardClaimed {
                reporter_address: REPORTER.to_string(),
                contract_address: POOL.to_string(),
            })
            .await;

        let keys = store.scan("membership:").await.unwrap();
        assert_eq!(keys.len(), 1);
    }
}
