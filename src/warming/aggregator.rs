// Aggregation service client used to recompute hot cache entries.

use crate::cache::CacheKey;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("Aggregation service unavailable: {0}")]
    Unavailable(String),

    #[error("No aggregate available for {0}")]
    Unsupported(String),

    #[error("Invalid aggregate response: {0}")]
    InvalidResponse(String),
}

impl AggregationError {
    /// Transient failures are retried, the rest are final for this cycle
    pub fn is_retryable(&self) -> bool {
        matches!(self, AggregationError::Unavailable(_))
    }
}

impl From<reqwest::Error> for AggregationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AggregationError::InvalidResponse(err.to_string())
        } else {
            AggregationError::Unavailable(err.to_string())
        }
    }
}

/// Computes the value behind a cache key from the source of truth
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn compute(&self, key: &CacheKey) -> Result<Value, AggregationError>;

    /// Chains currently being monitored
    async fn active_chains(&self) -> Result<Vec<u64>, AggregationError>;
}

/// Aggregator backed by the platform's HTTP aggregation service.
///
/// Aggregates are read from `GET {base}/aggregates/{key}` and the active chain
/// list from `GET {base}/chains/active`.
pub struct HttpAggregator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAggregator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AggregationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, path: &str, subject: &str) -> Result<Value, AggregationError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Fetching aggregate from {}", url);

        let response = self.client.get(&url).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(AggregationError::Unsupported(subject.to_string())),
            status if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => Err(
                AggregationError::Unavailable(format!("{} returned {}", url, status)),
            ),
            status => Err(AggregationError::InvalidResponse(format!(
                "{} returned {}",
                url, status
            ))),
        }
    }
}

#[async_trait]
impl Aggregator for HttpAggregator {
    async fn compute(&self, key: &CacheKey) -> Result<Value, AggregationError> {
        let key = key.to_string();
        self.get_json(&format!("/aggregates/{}", key), &key).await
    }

    async fn active_chains(&self) -> Result<Vec<u64>, AggregationError> {
        let value = self.get_json("/chains/active", "active chains").await?;
        serde_json::from_value(value).map_err(|e| AggregationError::InvalidResponse(e.to_string()))
    }
}
