//! Circuit breaker guarding every call against the backing store

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the transition broadcast; lagging subscribers lose the oldest events
const TRANSITION_CHANNEL_CAPACITY: usize = 64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BreakerError<E> {
    #[error("Circuit breaker is open")]
    Open,

    #[error("Circuit breaker half-open probe slots are saturated")]
    HalfOpenSaturated,

    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures within `metrics_window` that open the breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Time spent open before probing
    pub timeout: Duration,
    pub half_open_max_requests: u32,
    pub metrics_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
            metrics_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Emitted on every state change
#[derive(Debug, Clone, Serialize)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    /// Seconds since the breaker last opened, if it is open
    pub open_for_secs: Option<u64>,
}

/// All mutable state, updated under one lock that is never held across an await
#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    requests_in_half_open: u32,
    /// Bumped on every transition so late outcomes from an earlier state are dropped
    generation: u64,
}

/// What a caller was admitted as
#[derive(Debug, Clone, Copy)]
struct Permit {
    generation: u64,
    probe: bool,
}

/// Three-state circuit breaker (`Closed`, `Open`, `HalfOpen`).
///
/// One instance protects the whole backing store. State transitions and
/// counter updates happen under a single `parking_lot::Mutex`, so concurrent
/// success and failure reports are linearized and the half-open admission
/// check and increment are one step.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    config: BreakerConfig,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                window_start: None,
                opened_at: None,
                requests_in_half_open: 0,
                generation: 0,
            }),
            config,
            transitions,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `operation` if the breaker admits it, and record its outcome.
    ///
    /// The future is not polled when the call is rejected, so a rejected call
    /// never reaches the store.
    pub async fn execute<T, E, F>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let permit = self.admit()?;
        let mut guard = ProbeGuard {
            breaker: self,
            permit,
            settled: false,
        };

        let result = operation.await;
        guard.settled = true;
        self.record(permit, result.is_ok());

        result.map_err(BreakerError::Inner)
    }

    /// Current state without applying the open-timeout transition
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Whether a call issued now would be rejected without reaching the store
    pub fn is_rejecting(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => !self.timeout_elapsed(&inner),
            BreakerState::HalfOpen => {
                inner.requests_in_half_open >= self.config.half_open_max_requests
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            half_open_in_flight: inner.requests_in_half_open,
            open_for_secs: match inner.state {
                BreakerState::Open => inner.opened_at.map(|at| at.elapsed().as_secs()),
                _ => None,
            },
        }
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    fn admit<E>(&self) -> Result<Permit, BreakerError<E>> {
        let mut inner = self.inner.lock();

        if inner.state == BreakerState::Open {
            if !self.timeout_elapsed(&inner) {
                return Err(BreakerError::Open);
            }
            self.transition(&mut inner, BreakerState::HalfOpen);
        }

        match inner.state {
            BreakerState::Closed => Ok(Permit {
                generation: inner.generation,
                probe: false,
            }),
            BreakerState::HalfOpen => {
                if inner.requests_in_half_open >= self.config.half_open_max_requests {
                    debug!("Rejecting call, half-open probe slots saturated");
                    return Err(BreakerError::HalfOpenSaturated);
                }
                inner.requests_in_half_open += 1;
                Ok(Permit {
                    generation: inner.generation,
                    probe: true,
                })
            }
            BreakerState::Open => Err(BreakerError::Open),
        }
    }

    fn record(&self, permit: Permit, success: bool) {
        let mut inner = self.inner.lock();

        if permit.generation != inner.generation {
            debug!(success, "Dropping outcome reported for a superseded breaker state");
            return;
        }
        if permit.probe {
            inner.requests_in_half_open = inner.requests_in_half_open.saturating_sub(1);
        }

        match (inner.state, success) {
            (BreakerState::Closed, true) => {
                inner.consecutive_failures = 0;
                inner.window_start = None;
            }
            (BreakerState::Closed, false) => {
                let now = Instant::now();
                let window_expired = inner
                    .window_start
                    .map_or(true, |start| now.duration_since(start) > self.config.metrics_window);
                if window_expired {
                    inner.window_start = Some(now);
                    inner.consecutive_failures = 0;
                }
                inner.consecutive_failures += 1;

                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker opened after reaching failure threshold"
                    );
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            (BreakerState::HalfOpen, true) => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            (BreakerState::HalfOpen, false) => {
                warn!("Half-open probe failed, reopening circuit breaker");
                self.transition(&mut inner, BreakerState::Open);
            }
            (BreakerState::Open, _) => {}
        }
    }

    /// Give back a probe slot whose call was abandoned before completing
    fn release(&self, permit: Permit) {
        if !permit.probe {
            return;
        }
        let mut inner = self.inner.lock();
        if permit.generation == inner.generation {
            inner.requests_in_half_open = inner.requests_in_half_open.saturating_sub(1);
        }
    }

    fn timeout_elapsed(&self, inner: &Inner) -> bool {
        inner
            .opened_at
            .map_or(true, |opened| opened.elapsed() >= self.config.timeout)
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.requests_in_half_open = 0;
        inner.consecutive_successes = 0;

        match to {
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::HalfOpen => {
                info!("Circuit breaker transitioning to half-open state");
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                inner.window_start = None;
                inner.opened_at = None;
                info!("Circuit breaker closed after successful probes");
            }
        }

        // No subscribers is fine
        let _ = self.transitions.send(BreakerTransition {
            from,
            to,
            at: Utc::now(),
        });
    }
}

/// Releases a probe slot if the guarded future is dropped mid-flight
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
    settled: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.permit);
        }
    }
}
