//! tests/keys_tests.rs - Key grammar, parameter canonicalization and patterns

#[cfg(test)]
mod tests {
    use crate::cache::keys::{build_key, params_hash, CacheKey, KeyError, KeyParams, KeyPattern};
    use crate::cache::ResourceClass;
    use proptest::prelude::*;
    use serde_json::{json, Map, Value};

    const REPORTER: &str = "0xAbCdEf0123456789aBcDeF0123456789AbCdEf01";

    fn params(pairs: &[(&str, Value)]) -> KeyParams {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_key_grammar() {
        let cases = [
            (CacheKey::IncidentsByChain { chain_id: 7, page: 1 }, "incidents:chain:7:page:1"),
            (CacheKey::IncidentsLatest { count: 20 }, "incidents:latest:20"),
            (CacheKey::IncidentSummary(42), "incident_summary:42"),
            (CacheKey::ChainHealth(7), "chain:health:7"),
            (CacheKey::ChainMetrics(7), "chain:metrics:7"),
            (CacheKey::GlobalMetrics, "global:metrics"),
            (CacheKey::DashboardStats, "dashboard:stats"),
            (CacheKey::ChainLeaderboard, "leaderboard:chains"),
            (CacheKey::ReporterLeaderboard { page: 2 }, "leaderboard:reporters:page:2"),
            (CacheKey::Dispute(3), "dispute:3"),
        ];
        for (key, expected) in cases {
            assert_eq!(key.to_string(), expected);
            assert!(!expected.contains('*'));
        }
    }

    #[test]
    fn test_addresses_are_case_normalized() {
        assert_eq!(CacheKey::reporter(REPORTER), CacheKey::reporter(&REPORTER.to_lowercase()));
        assert_eq!(
            CacheKey::reward_pool(REPORTER).to_string(),
            format!("reward:pool:{}", REPORTER.to_lowercase())
        );
    }

    #[test]
    fn test_resource_class_of_keys() {
        assert_eq!(CacheKey::IncidentsLatest { count: 20 }.resource_class(), ResourceClass::SearchResult);
        assert_eq!(CacheKey::DashboardStats.resource_class(), ResourceClass::GlobalMetrics);
        assert_eq!(CacheKey::ChainLeaderboard.resource_class(), ResourceClass::Leaderboard);
        assert_eq!(
            CacheKey::rpc_call("eth_getLogs", &json!([])).resource_class(),
            ResourceClass::RpcResponse
        );
    }

    #[test]
    fn test_rpc_key_ignores_object_key_order() {
        let a = json!({ "fromBlock": "0x1", "toBlock": "0x2", "filter": { "address": "0xa", "topics": [] } });
        let b = json!({ "filter": { "topics": [], "address": "0xa" }, "toBlock": "0x2", "fromBlock": "0x1" });

        assert_eq!(CacheKey::rpc_call("eth_getLogs", &a), CacheKey::rpc_call("eth_getLogs", &b));
        assert_ne!(
            CacheKey::rpc_call("eth_getLogs", &a),
            CacheKey::rpc_call("eth_getLogs", &json!({ "fromBlock": "0x1" })),
            "Different params must give different keys"
        );
        assert!(CacheKey::rpc_call("eth_getLogs", &a).to_string().starts_with("rpc:eth_getLogs:"));
    }

    #[test]
    fn test_build_key_from_params() {
        assert_eq!(
            build_key(ResourceClass::ChainHealth, &params(&[("chain_id", json!(7))])),
            Ok(CacheKey::ChainHealth(7))
        );
        assert_eq!(
            build_key(ResourceClass::SearchResult, &params(&[("chain_id", json!("7")), ("page", json!(2))])),
            Ok(CacheKey::IncidentsByChain { chain_id: 7, page: 2 })
        );
        assert_eq!(
            build_key(ResourceClass::SearchResult, &params(&[("count", json!(20))])),
            Ok(CacheKey::IncidentsLatest { count: 20 })
        );
        assert_eq!(
            build_key(ResourceClass::GlobalMetrics, &params(&[("view", json!("dashboard"))])),
            Ok(CacheKey::DashboardStats)
        );
        assert_eq!(
            build_key(ResourceClass::Leaderboard, &KeyParams::new()),
            Ok(CacheKey::ChainLeaderboard)
        );

        let search = build_key(
            ResourceClass::SearchResult,
            &params(&[("query", json!("Reorg on Base*")), ("page", json!(1))]),
        )
        .unwrap();
        assert!(!search.to_string().contains('*'), "Free text is hashed out of the key");
    }

    #[test]
    fn test_build_key_rejects_bad_params() {
        assert_eq!(
            build_key(ResourceClass::Incident, &KeyParams::new()),
            Err(KeyError::MissingParam("incident_id"))
        );
        assert!(matches!(
            build_key(ResourceClass::ChainMetrics, &params(&[("chain_id", json!(-1))])),
            Err(KeyError::InvalidParam { name: "chain_id", .. })
        ));
        assert!(matches!(
            build_key(ResourceClass::Reporter, &params(&[("address", json!("0xabc*"))])),
            Err(KeyError::Wildcard(_))
        ));
        assert!(matches!(
            build_key(ResourceClass::Leaderboard, &params(&[("page", json!(u64::MAX))])),
            Err(KeyError::InvalidParam { name: "page", .. })
        ));
    }

    #[test]
    fn test_pattern_parsing() {
        let prefix = KeyPattern::parse("incidents:chain:7:*").unwrap();
        assert_eq!(prefix, KeyPattern::prefix(&["incidents", "chain", "7"]));
        assert!(prefix.is_prefix());
        assert!(prefix.matches("incidents:chain:7:page:1"));
        assert!(!prefix.matches("incidents:chain:70:page:1"));
        assert_eq!(prefix.to_string(), "incidents:chain:7:*");

        let exact = KeyPattern::parse("global:metrics").unwrap();
        assert!(!exact.is_prefix());
        assert!(exact.matches("global:metrics"));
        assert!(!exact.matches("global:metrics:extra"));

        for bad in ["", "*", "incidents*", "incidents:*:page:*", "inc*dents:1"] {
            assert!(
                matches!(KeyPattern::parse(bad), Err(KeyError::MalformedPattern(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    proptest! {
        #[test]
        fn prop_params_hash_is_order_independent(
            entries in prop::collection::btree_map("[a-zA-Z_]{1,10}", any::<i64>(), 0..12)
        ) {
            let forward: Map<String, Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            let reversed: Map<String, Value> = entries
                .iter()
                .rev()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();

            let forward = Value::Object(forward);
            let reversed = Value::Object(reversed);
            prop_assert_eq!(params_hash(&forward), params_hash(&reversed));
            prop_assert_eq!(
                CacheKey::rpc_call("eth_call", &json!([forward])),
                CacheKey::rpc_call("eth_call", &json!([reversed]))
            );
        }

        #[test]
        fn prop_rendered_exact_keys_parse_as_exact(chain_id in any::<u64>(), page in any::<u32>()) {
            let key = CacheKey::IncidentsByChain { chain_id, page }.to_string();
            let pattern = KeyPattern::parse(&key).unwrap();
            prop_assert!(!pattern.is_prefix());
            prop_assert!(KeyPattern::prefix(&["incidents", "chain", chain_id.to_string().as_str()]).matches(&key));
        }
    }
}
