// Initialize logging
// Load configuration and build the cache policy
// Connect the backing store
// Build breaker, cache facade, filters, dispatcher and warming scheduler
// Start background tasks
// Start HTTP server

use chain_cache_service::{
    api, cache::KvStore, config::Config, events::InvalidationDispatcher, state::AppState,
    CacheFacade, CircuitBreaker, HttpAggregator, MembershipFilters, MokaStore,
    StoreMembershipSource, WarmingScheduler,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting chain-cache-service");

    // Load configuration; an invalid policy is fatal
    let config = Config::from_env();
    let policy = Arc::new(config.policy()?);
    tracing::info!("Configuration loaded: {:?}", config);

    let store = connect_store(&config, policy.memory.max_bytes).await?;

    let breaker = Arc::new(CircuitBreaker::new(policy.breaker.clone()));
    let cache = CacheFacade::new(store.clone(), breaker.clone(), policy.clone());

    let source = Arc::new(StoreMembershipSource::new(store));
    let filters = Arc::new(MembershipFilters::new(
        &policy.filters,
        source,
        breaker.clone(),
        policy.membership_load_timeout,
    ));

    let (block_tx, block_rx) = mpsc::channel(64);
    let dispatcher = Arc::new(
        InvalidationDispatcher::new(cache.clone(), config.dispatcher_queue_capacity)
            .with_block_notices(block_tx),
    );

    let aggregator = Arc::new(HttpAggregator::new(
        &config.aggregator_url,
        config.aggregator_timeout,
    )?);
    let scheduler = Arc::new(WarmingScheduler::new(cache.clone(), filters.clone(), aggregator));

    // Start background tasks
    let shutdown = CancellationToken::new();
    let mut tasks = dispatcher.spawn_workers(config.dispatcher_workers, shutdown.clone());
    tasks.extend(filters.spawn_refresh_loops(shutdown.clone()));
    tasks.push(tokio::spawn(scheduler.run(block_rx, shutdown.clone())));

    let mut transitions = breaker.subscribe();
    let breaker_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(transition) = transitions.recv() => {
                    tracing::warn!("Circuit breaker {:?} -> {:?}", transition.from, transition.to);
                }
                _ = breaker_shutdown.cancelled() => break,
            }
        }
    }));
    tracing::info!("Background tasks started");

    // Start HTTP server
    let app_state = Arc::new(AppState {
        config: config.clone(),
        cache,
        filters,
        dispatcher,
    });
    let app = api::create_router(app_state);
    let addr = format!("{}:{}", config.server_host, config.server_port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("chain-cache-service stopped");

    Ok(())
}

#[cfg(feature = "redis")]
async fn connect_store(
    config: &Config,
    max_bytes: u64,
) -> Result<Arc<dyn KvStore>, Box<dyn std::error::Error>> {
    match &config.redis_url {
        Some(url) => {
            let store = chain_cache_service::cache::RedisStore::connect(url).await?;
            Ok(Arc::new(store))
        }
        None => Ok(in_process_store(max_bytes)),
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_store(
    config: &Config,
    max_bytes: u64,
) -> Result<Arc<dyn KvStore>, Box<dyn std::error::Error>> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL set but built without the redis feature");
    }
    Ok(in_process_store(max_bytes))
}

fn in_process_store(max_bytes: u64) -> Arc<dyn KvStore> {
    tracing::info!("Using in-process backing store ({} bytes)", max_bytes);
    Arc::new(MokaStore::new(max_bytes))
}
