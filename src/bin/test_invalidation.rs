use chain_cache_service::{
    cache::{CacheKey, KeyPattern, KvStore, MokaStore, ResourceClass},
    config::Config,
    events::{patterns_for, DomainEvent, InvalidationDispatcher},
    filters::{FilterPurpose, MembershipFilters, StoreMembershipSource},
    BreakerState, CacheFacade, CircuitBreaker,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

const REPORTER: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting invalidation smoke test...");

    let config = Config::from_env();
    let policy = Arc::new(config.policy()?);
    let store: Arc<dyn KvStore> = Arc::new(MokaStore::new(policy.memory.max_bytes));
    let breaker = Arc::new(CircuitBreaker::new(policy.breaker.clone()));
    let cache = CacheFacade::new(store.clone(), breaker.clone(), policy.clone());

    // Test 1: populate every key an incident report touches, plus a bystander
    info!("Test 1: Seeding cache");
    let seeded = [
        CacheKey::IncidentsLatest { count: 20 },
        CacheKey::IncidentsByChain { chain_id: 7, page: 1 },
        CacheKey::IncidentSummary(42),
        CacheKey::ChainMetrics(7),
        CacheKey::ChainHealth(7),
        CacheKey::GlobalMetrics,
        CacheKey::DashboardStats,
        CacheKey::ChainLeaderboard,
        CacheKey::search_incidents("bridge exploit", 1),
        CacheKey::ChainMetrics(8),
    ];
    for key in &seeded {
        cache.set_json(key, &json!({ "key": key.to_string() })).await?;
    }
    cache
        .set_rpc("eth_getBalance", &json!([REPORTER, "latest"]), b"0x0".to_vec())
        .await?;
    info!("Seeded {} keys", seeded.len() + 1);

    // Test 2: run events through the worker pool
    info!("Test 2: Dispatching events through workers");
    let dispatcher = Arc::new(InvalidationDispatcher::new(
        cache.clone(),
        config.dispatcher_queue_capacity,
    ));
    let shutdown = CancellationToken::new();
    let workers = dispatcher.spawn_workers(config.dispatcher_workers, shutdown.clone());

    let events = [
        DomainEvent::IncidentReported {
            chain_id: 7,
            incident_id: 42,
        },
        DomainEvent::NewBlock {
            chain_id: 7,
            block_number: 19_000_000,
        },
    ];
    for event in &events {
        let patterns: Vec<String> = patterns_for(event).iter().map(ToString::to_string).collect();
        info!("{} -> {:?}", event.tag(), patterns);
        dispatcher.on_event(event.clone())?;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut stale = 0;
    for key in &seeded[..seeded.len() - 1] {
        if cache.get(key.resource_class(), &key.to_string()).await.is_some() {
            error!("Key {} survived invalidation", key);
            stale += 1;
        }
    }
    if cache.get(ResourceClass::ChainMetrics, "chain:metrics:8").await.is_none() {
        error!("Bystander key chain:metrics:8 was invalidated");
        stale += 1;
    }
    if cache
        .get_rpc("eth_getBalance", &json!([REPORTER, "latest"]))
        .await
        .is_some()
    {
        error!("Balance response survived the new block");
        stale += 1;
    }
    info!("Dispatcher stats: {:?}", dispatcher.stats());

    // Test 3: membership filters built from the store
    info!("Test 3: Building membership filters");
    store
        .set(
            &StoreMembershipSource::member_key(FilterPurpose::ActiveReporters, REPORTER),
            Vec::new(),
            Duration::from_secs(3600),
        )
        .await?;
    let filters = MembershipFilters::new(
        &policy.filters,
        Arc::new(StoreMembershipSource::new(store.clone())),
        breaker.clone(),
        policy.membership_load_timeout,
    );
    filters.refresh_all().await;
    info!(
        "Active reporter {} present: {}",
        REPORTER,
        filters.might_contain(FilterPurpose::ActiveReporters, REPORTER)
    );

    // Test 4: idempotent pattern delete
    info!("Test 4: Repeating a prefix delete");
    let pattern = KeyPattern::parse("incidents:chain:7:*")?;
    info!("Second delete removed {} keys", cache.delete_pattern(&pattern).await?);

    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }

    info!("Breaker state: {:?}, cache stats: {:?}", breaker.state(), cache.stats());
    if stale == 0 && breaker.state() == BreakerState::Closed {
        info!("Invalidation smoke test passed");
    } else {
        error!("Invalidation smoke test found {} problems", stale);
    }

    Ok(())
}
