//! Per-subscription serial workers
//!
//! Events are routed by unique id to one worker task per subscription, so
//! two events for the same subscription are never handled concurrently
//! while different subscriptions proceed in parallel.
//!
//! Routing never waits on a worker. When a worker's queue is full the event
//! is dropped and counted in `eventsub_dispatch_dropped_total`; the next
//! relist or restart replays the resource's current state.
//!
//! Workers exit after an idle period. A worker that is shutting down closes
//! its channel and drains what was already queued; its successor waits for
//! it to finish before handling anything, which keeps per-id ordering
//! across worker generations.

use crate::watch::SubscriptionEvent;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default capacity of each worker's queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default idle period before a worker exits
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Something that handles subscription events
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one event; failures are the handler's to log
    async fn handle(&self, event: SubscriptionEvent);
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Capacity of each worker's queue
    pub queue_capacity: usize,
    /// Idle period before a worker exits
    pub idle_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

struct Worker {
    tx: mpsc::Sender<SubscriptionEvent>,
    handle: JoinHandle<()>,
}

/// Routes events to per-id serial workers
pub struct Dispatcher<H: EventHandler> {
    handler: Arc<H>,
    config: DispatcherConfig,
    workers: HashMap<String, Worker>,
}

impl<H: EventHandler> Dispatcher<H> {
    /// Create a dispatcher around a handler
    pub fn new(handler: Arc<H>, config: DispatcherConfig) -> Self {
        Self {
            handler,
            config,
            workers: HashMap::new(),
        }
    }

    /// Number of live workers
    pub fn active_workers(&self) -> usize {
        self.workers
            .values()
            .filter(|w| !w.handle.is_finished())
            .count()
    }

    /// Route one event to its worker, starting one if needed
    pub async fn dispatch(&mut self, event: SubscriptionEvent) {
        let Some(key) = event.unique_id().map(str::to_string) else {
            warn!(kind = event.kind(), "Event without unique id, dropping");
            return;
        };

        self.workers.retain(|_, w| !w.handle.is_finished());

        let mut event = event;
        if let Some(worker) = self.workers.get(&key) {
            match worker.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(dropped)) => {
                    error!(
                        unique_id = %key,
                        kind = dropped.kind(),
                        capacity = self.config.queue_capacity,
                        "Subscription worker queue full, dropping event"
                    );
                    metrics::counter!("eventsub_dispatch_dropped_total").increment(1);
                    return;
                }
                // The worker is winding down; hand the event to a successor
                Err(TrySendError::Closed(returned)) => event = returned,
            }
        }

        let predecessor = self.workers.remove(&key).map(|w| w.handle);
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        if let Err(e) = tx.try_send(event) {
            error!(unique_id = %key, error = %e, "Failed to enqueue event on a fresh worker");
            return;
        }

        debug!(unique_id = %key, "Starting subscription worker");
        let handle = tokio::spawn(run_worker(
            key.clone(),
            self.handler.clone(),
            rx,
            predecessor,
            self.config.idle_timeout,
        ));
        self.workers.insert(key, Worker { tx, handle });
    }

    /// Dispatch every event of a stream, then wait for workers to drain
    pub async fn run<S>(mut self, events: S)
    where
        S: Stream<Item = SubscriptionEvent>,
    {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            self.dispatch(event).await;
        }

        info!(workers = self.workers.len(), "Event stream ended, draining workers");
        let handles: Vec<JoinHandle<()>> = self.workers.drain().map(|(_, w)| w.handle).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Subscription worker panicked");
            }
        }
    }
}

async fn run_worker<H: EventHandler>(
    key: String,
    handler: Arc<H>,
    mut rx: mpsc::Receiver<SubscriptionEvent>,
    predecessor: Option<JoinHandle<()>>,
    idle_timeout: Duration,
) {
    if let Some(predecessor) = predecessor {
        let _ = predecessor.await;
    }

    loop {
        match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(event)) => handler.handle(event).await,
            Ok(None) => break,
            Err(_) => {
                rx.close();
                while let Some(event) = rx.recv().await {
                    handler.handle(event).await;
                }
                debug!(unique_id = %key, "Subscription worker idle, exiting");
                break;
            }
        }
    }
}
