use crate::{
    api::{error::ApiError, response::ApiResponse},
    breaker::BreakerSnapshot,
    cache::{CacheStats, MemoryPressure},
    events::{DispatchStats, DomainEvent},
    filters::{FilterPurpose, FilterStatus},
    state::AppState,
    validation::validate_event,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

#[derive(Serialize)]
pub struct HealthReport {
    pub breaker: BreakerSnapshot,
    pub cache: CacheStats,
    pub hit_rate: f64,
    pub memory_pressure: MemoryPressure,
    pub filters: Vec<FilterStatus>,
    pub dispatcher: DispatchStats,
}

#[derive(Serialize)]
pub struct EventAccepted {
    pub event: String,
}

#[derive(Serialize)]
pub struct MembershipProbe {
    pub purpose: FilterPurpose,
    pub item: String,
    /// `false` means definitely absent
    pub might_contain: bool,
}

// Create router with all routes
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(ingest_event))
        .route("/filters/{purpose}/{item}", get(probe_filter))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

// GET /health handler
async fn health(State(state): State<Arc<AppState>>) -> ApiResponse<HealthReport> {
    let cache = state.cache.stats();
    let report = HealthReport {
        breaker: state.cache.breaker().snapshot(),
        hit_rate: cache.hit_rate(),
        cache,
        memory_pressure: state.cache.memory_pressure().await,
        filters: state.filters.status(),
        dispatcher: state.dispatcher.stats(),
    };
    ApiResponse::new(report)
}

// POST /events handler: queue the event and return without waiting for invalidation
async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<DomainEvent>,
) -> Result<Response, ApiError> {
    validate_event(&event)?;

    let tag = event.tag();
    state.dispatcher.on_event(event)?;
    info!("Accepted {} event", tag);

    Ok(ApiResponse::new(EventAccepted {
        event: tag.to_string(),
    })
    .with_status(StatusCode::ACCEPTED))
}

// GET /filters/{purpose}/{item} handler
async fn probe_filter(
    State(state): State<Arc<AppState>>,
    Path((purpose, item)): Path<(String, String)>,
) -> Result<ApiResponse<MembershipProbe>, ApiError> {
    let purpose: FilterPurpose = purpose.parse().map_err(ApiError::NotFound)?;
    if item.trim().is_empty() {
        return Err(ApiError::BadRequest("Missing parameter: item".to_string()));
    }

    let might_contain = state.filters.might_contain(purpose, &item);
    debug!("Filter probe {} {} -> {}", purpose, item, might_contain);

    Ok(ApiResponse::new(MembershipProbe {
        purpose,
        item,
        might_contain,
    }))
}
