use super::invalidation::patterns_for;
use super::models::{DomainEvent, EventTag};
use crate::cache::{CacheFacade, KeyPattern};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Invalidation queue full, dropped {0} event")]
    QueueFull(EventTag),

    #[error("Invalidation queue closed")]
    Closed,
}

/// Sent to the warming scheduler for every `NewBlock` event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockNotice {
    pub chain_id: u64,
    pub block_number: u64,
}

/// Outcome of invalidating one event
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub tag: EventTag,
    pub patterns: Vec<String>,
    pub deleted_keys: u64,
    /// Pattern and error for every delete that did not complete
    pub failures: Vec<(String, String)>,
}

impl DispatchReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub received: u64,
    pub dropped: u64,
    pub dispatched: u64,
    pub failed_patterns: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
    failed_patterns: AtomicU64,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<DomainEvent>>>;

/// Turns domain events into pattern deletes.
///
/// `on_event` never waits on the store: events go into a bounded queue that
/// a pool of workers drains. Failed deletes are logged and left to TTL expiry.
pub struct InvalidationDispatcher {
    cache: CacheFacade,
    sender: mpsc::Sender<DomainEvent>,
    receiver: Mutex<Option<mpsc::Receiver<DomainEvent>>>,
    blocks: Option<mpsc::Sender<BlockNotice>>,
    counters: Counters,
}

impl InvalidationDispatcher {
    pub fn new(cache: CacheFacade, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        Self {
            cache,
            sender,
            receiver: Mutex::new(Some(receiver)),
            blocks: None,
            counters: Counters::default(),
        }
    }

    /// Forward `NewBlock` events to the warming scheduler
    pub fn with_block_notices(mut self, blocks: mpsc::Sender<BlockNotice>) -> Self {
        self.blocks = Some(blocks);
        self
    }

    /// Enqueue an event without waiting for its invalidation
    pub fn on_event(&self, event: DomainEvent) -> Result<(), DispatchError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        match self.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Invalidation queue full, dropping {} event", event.tag());
                Err(DispatchError::QueueFull(event.tag()))
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(DispatchError::Closed)
            }
        }
    }

    /// Invalidate every pattern for `event` and wait for the deletes
    pub async fn dispatch(&self, event: &DomainEvent) -> DispatchReport {
        let tag = event.tag();
        let mut patterns = patterns_for(event);
        if tag == EventTag::NewBlock {
            for method in self.cache.policy().new_block_rpc_methods() {
                patterns.push(KeyPattern::prefix(&["rpc", method]));
            }
        }

        let results = join_all(patterns.iter().map(|p| self.cache.delete_pattern(p))).await;

        let mut deleted_keys = 0;
        let mut failures = Vec::new();
        for (pattern, result) in patterns.iter().zip(results) {
            match result {
                Ok(count) => deleted_keys += count,
                Err(e) => failures.push((pattern.to_string(), e.to_string())),
            }
        }

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        if failures.is_empty() {
            debug!(
                "Invalidated {} patterns ({} keys) for {}",
                patterns.len(),
                deleted_keys,
                tag
            );
        } else {
            self.counters
                .failed_patterns
                .fetch_add(failures.len() as u64, Ordering::Relaxed);
            warn!(
                "Invalidation for {} incomplete: {} of {} patterns failed, stale until TTL",
                tag,
                failures.len(),
                patterns.len()
            );
        }

        if let DomainEvent::NewBlock {
            chain_id,
            block_number,
        } = *event
        {
            self.notify_block(BlockNotice {
                chain_id,
                block_number,
            });
        }

        DispatchReport {
            tag,
            patterns: patterns.iter().map(ToString::to_string).collect(),
            deleted_keys,
            failures,
        }
    }

    /// Start `worker_count` workers sharing the queue. Only the first call
    /// spawns anything.
    pub fn spawn_workers(
        self: &Arc<Self>,
        worker_count: usize,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let Some(receiver) = self.receiver.lock().take() else {
            warn!("Invalidation workers already started");
            return Vec::new();
        };
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));

        (0..worker_count.max(1))
            .map(|id| {
                let dispatcher = Arc::clone(self);
                let receiver = Arc::clone(&receiver);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { dispatcher.run_worker(id, receiver, shutdown).await })
            })
            .collect()
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            received: c.received.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            failed_patterns: c.failed_patterns.load(Ordering::Relaxed),
        }
    }

    async fn run_worker(&self, id: usize, receiver: SharedReceiver, shutdown: CancellationToken) {
        info!("Invalidation worker {} started", id);

        loop {
            let event = {
                let mut receiver = receiver.lock().await;
                tokio::select! {
                    event = receiver.recv() => event,
                    _ = shutdown.cancelled() => None,
                }
            };

            let Some(event) = event else {
                break;
            };

            let report = self.dispatch(&event).await;
            if !report.is_complete() {
                for (pattern, e) in &report.failures {
                    error!("Worker {} failed to invalidate {}: {}", id, pattern, e);
                }
            }
        }

        info!("Invalidation worker {} shutting down", id);
    }

    fn notify_block(&self, notice: BlockNotice) {
        let Some(blocks) = &self.blocks else {
            return;
        };
        match blocks.try_send(notice) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(
                    "Warming busy, skipping block {} on chain {}",
                    notice.block_number, notice.chain_id
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Warming scheduler stopped, block notice dropped");
            }
        }
    }
}
