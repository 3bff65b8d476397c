pub mod api;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod events;
pub mod filters;
pub mod state;
pub mod validation;
pub mod warming;

#[cfg(test)]
pub mod tests;

// Re-export specific items for convenience
pub use api::error::ApiError;
pub use api::route::create_router;
pub use breaker::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
pub use cache::{CacheError, CacheFacade, CacheKey, KeyPattern, KvStore, MokaStore, ResourceClass};
pub use config::{CachePolicy, Config, ConfigError};
pub use events::{DomainEvent, InvalidationDispatcher};
pub use filters::{FilterPurpose, MembershipFilters, StoreMembershipSource};
pub use validation::{validate_event, validate_evm_address};
pub use warming::{Aggregator, HttpAggregator, WarmingScheduler};
