//! EventSubscription Controller
//!
//! This module implements the reconciliation of EventSubscription
//! resources against the broker. It consumes the typed lifecycle stream,
//! routes events through per-subscription workers and drives the
//! [`BrokerGateway`]. The finalizer guarantees queue cleanup before the
//! resource leaves the store.

use crate::broker::BrokerGateway;
use crate::crd::{EventSubscription, EventSubscriptionStatus, SubscriptionPhase};
use crate::dispatcher::{Dispatcher, DispatcherConfig, EventHandler};
use crate::error::{OperatorError, Result};
use crate::store::{KubeStore, SubscriptionStore};
use crate::watch::{subscription_events, SubscriptionEvent};
use async_trait::async_trait;
use chrono::Utc;
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Base delay before retrying a failed queue cleanup
const CLEANUP_RETRY_SECONDS: u64 = 30;

/// Maximum delay between cleanup retries
const MAX_CLEANUP_RETRY_SECONDS: u64 = 600;

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("eventsub_reconciliations_total"),
            errors: metrics::counter!("eventsub_reconciliation_errors_total"),
            duration: metrics::histogram!("eventsub_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry policy for the deletion path
#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    /// Delay before the first retry, doubled per attempt
    pub base_delay: Duration,
    /// Upper bound on the delay
    pub max_delay: Duration,
    /// Give up (keeping the finalizer) after this many attempts
    pub max_attempts: Option<u32>,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(CLEANUP_RETRY_SECONDS),
            max_delay: Duration::from_secs(MAX_CLEANUP_RETRY_SECONDS),
            max_attempts: None,
        }
    }
}

impl CleanupPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Handles subscription lifecycle events
pub struct Reconciler {
    store: Arc<dyn SubscriptionStore>,
    broker: BrokerGateway,
    metrics: Option<ControllerMetrics>,
    cleanup: CleanupPolicy,
}

impl Reconciler {
    /// Create a reconciler over a store and a broker gateway
    pub fn new(store: Arc<dyn SubscriptionStore>, broker: BrokerGateway) -> Self {
        Self {
            store,
            broker,
            metrics: None,
            cleanup: CleanupPolicy::default(),
        }
    }

    /// Record reconciliation metrics
    pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the cleanup retry policy
    pub fn with_cleanup_policy(mut self, cleanup: CleanupPolicy) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Dispatch one lifecycle event
    #[instrument(skip(self, event), fields(kind = event.kind(), name = %event.subscription().name_any()))]
    pub async fn reconcile(&self, event: SubscriptionEvent) {
        let start = std::time::Instant::now();

        if let Some(ref metrics) = self.metrics {
            metrics.reconciliations.increment(1);
        }

        let result = match event {
            SubscriptionEvent::Added(subscription) => self.apply_added(subscription).await,
            SubscriptionEvent::Modified(subscription) => self.apply_modified(subscription).await,
            SubscriptionEvent::DeleteRequested(subscription) => {
                self.cleanup_subscription(subscription).await
            }
            SubscriptionEvent::Removed(subscription) => {
                debug!(name = %subscription.name_any(), "Subscription removed from store");
                Ok(())
            }
        };

        if let Some(ref metrics) = self.metrics {
            metrics.duration.record(start.elapsed().as_secs_f64());
        }

        if let Err(e) = result {
            if let Some(ref metrics) = self.metrics {
                metrics.errors.increment(1);
            }
            error!(error = %e, "Subscription reconciliation failed");
        }
    }

    /// Added: attach the finalizer, then declare the queue
    async fn apply_added(&self, subscription: EventSubscription) -> Result<()> {
        let Some(owner_id) = self.prepare(&subscription).await? else {
            return Ok(());
        };
        let queue_name = subscription.spec.queue_name();

        info!(name = %subscription.name_any(), queue = %queue_name, "Reconciling added subscription");

        let outcome = match missed_change(&subscription, &queue_name) {
            Some(reason) => {
                info!(queue = %queue_name, reason, "Change missed while unobserved, replacing");
                self.broker
                    .replace_queues(owner_id, &queue_name)
                    .await
                    .map(|_| ())
            }
            None => self.broker.create_queue(owner_id, &queue_name).await,
        };

        self.record_outcome(&subscription, &queue_name, outcome).await;
        Ok(())
    }

    /// Modified: attach the finalizer, then replace every owned queue
    async fn apply_modified(&self, subscription: EventSubscription) -> Result<()> {
        let Some(owner_id) = self.prepare(&subscription).await? else {
            return Ok(());
        };
        let queue_name = subscription.spec.queue_name();

        info!(name = %subscription.name_any(), queue = %queue_name, "Reconciling modified subscription");

        let outcome = self
            .broker
            .replace_queues(owner_id, &queue_name)
            .await
            .map(|report| {
                if !report.is_complete() {
                    warn!(
                        queue = %queue_name,
                        failed = report.failed.len(),
                        list_error = ?report.list_error,
                        "Stale queues may remain after replacement"
                    );
                }
            });

        self.record_outcome(&subscription, &queue_name, outcome).await;
        Ok(())
    }

    /// Validate and attach the finalizer. Returns the owner id when the
    /// broker may be touched.
    async fn prepare<'a>(&self, subscription: &'a EventSubscription) -> Result<Option<&'a str>> {
        let name = subscription.name_any();

        let Some(owner_id) = subscription.unique_id() else {
            return Err(OperatorError::Internal(format!("{} has no uid", name)));
        };

        if let Some(message) = subscription.spec.validation_message() {
            warn!(name = %name, errors = %message, "Subscription spec validation failed");
            self.write_status(&name, build_error_status(subscription, &message))
                .await;
            return Ok(None);
        }

        // Without the finalizer a later deletion could orphan the queue
        self.store.add_finalizer(subscription).await?;
        Ok(Some(owner_id))
    }

    /// Deleted-intent: remove every owned queue, then release the finalizer
    async fn cleanup_subscription(&self, subscription: EventSubscription) -> Result<()> {
        let name = subscription.name_any();
        let Some(owner_id) = subscription.unique_id() else {
            return Err(OperatorError::Internal(format!("{} has no uid", name)));
        };

        info!(name = %name, owner_id = %owner_id, "Cleaning up subscription queues");

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let permanent = match self.broker.delete_owned_queues(owner_id).await {
                Ok(report) if report.is_complete() => {
                    info!(name = %name, deleted = report.deleted.len(), "Subscription queues removed");
                    break;
                }
                Ok(report) => {
                    warn!(name = %name, failed = report.failed.len(), attempt, "Queue cleanup incomplete");
                    (!report.is_retryable()).then(|| {
                        report
                            .failed
                            .iter()
                            .map(|f| format!("{}: {}", f.queue, f.message))
                            .collect::<Vec<_>>()
                            .join("; ")
                    })
                }
                Err(e) => {
                    warn!(name = %name, error = %e, attempt, "Failed to list subscription queues");
                    (!e.is_retryable()).then(|| e.to_string())
                }
            };

            if let Some(detail) = permanent {
                let message = format!("queue cleanup failed permanently: {}", detail);
                self.write_status(&name, build_error_status(&subscription, &message))
                    .await;
                return Err(OperatorError::Internal(format!(
                    "{} for {}, keeping finalizer",
                    message, name
                )));
            }

            if self.cleanup.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(OperatorError::Internal(format!(
                    "queue cleanup for {} gave up after {} attempts, keeping finalizer",
                    name, attempt
                )));
            }
            tokio::time::sleep(self.cleanup.delay(attempt)).await;
        }

        self.store.remove_finalizer(&subscription).await?;
        info!(name = %name, "Finalizer removed");
        Ok(())
    }

    /// Broker failures are logged and recorded in status, never propagated
    async fn record_outcome(
        &self,
        subscription: &EventSubscription,
        queue_name: &str,
        outcome: Result<()>,
    ) {
        let name = subscription.name_any();
        let status = match outcome {
            Ok(()) => {
                info!(name = %name, queue = %queue_name, "Subscription reconciliation complete");
                build_ready_status(subscription, queue_name)
            }
            Err(e) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.errors.increment(1);
                }
                warn!(name = %name, queue = %queue_name, error = %e, "Broker operation failed");
                build_error_status(subscription, &e.to_string())
            }
        };
        self.write_status(&name, status).await;
    }

    async fn write_status(&self, name: &str, status: EventSubscriptionStatus) {
        if let Err(e) = self.store.update_status(name, &status).await {
            warn!(name = %name, error = %e, "Failed to update subscription status");
        }
    }
}

#[async_trait]
impl EventHandler for Reconciler {
    async fn handle(&self, event: SubscriptionEvent) {
        self.reconcile(event).await;
    }
}

/// Why an Added event must replace rather than declare: the status shows
/// a reconciliation of a different queue name or filter set.
fn missed_change(subscription: &EventSubscription, queue_name: &str) -> Option<&'static str> {
    let status = subscription.status.as_ref()?;
    if status
        .queue_name
        .as_deref()
        .is_some_and(|recorded| recorded != queue_name)
    {
        return Some("queue name changed");
    }
    if status
        .observed_hashsum
        .as_deref()
        .is_some_and(|observed| observed != subscription.spec.filters_hashsum)
    {
        return Some("filters changed");
    }
    None
}

/// Build a ready status
fn build_ready_status(subscription: &EventSubscription, queue_name: &str) -> EventSubscriptionStatus {
    EventSubscriptionStatus {
        phase: SubscriptionPhase::Ready,
        message: "Queue declared".to_string(),
        queue_name: Some(queue_name.to_string()),
        observed_hashsum: Some(subscription.spec.filters_hashsum.clone()),
        last_sync_time: Some(Utc::now().to_rfc3339()),
    }
}

/// Build an error status, preserving what is known about the broker side
fn build_error_status(subscription: &EventSubscription, message: &str) -> EventSubscriptionStatus {
    let existing = subscription.status.clone().unwrap_or_default();

    EventSubscriptionStatus {
        phase: SubscriptionPhase::Error,
        message: message.to_string(),
        queue_name: existing.queue_name,
        observed_hashsum: existing.observed_hashsum,
        last_sync_time: Some(Utc::now().to_rfc3339()),
    }
}

/// Controller wiring
pub struct ControllerConfig {
    /// Kubernetes namespace the subscriptions live in
    pub namespace: String,
    /// Worker pool settings
    pub dispatcher: DispatcherConfig,
    /// Deletion retry settings
    pub cleanup: CleanupPolicy,
}

/// Start the EventSubscription controller.
///
/// Runs until the watch stream ends, which it does not under normal
/// operation.
pub async fn run_controller(
    client: Client,
    broker: BrokerGateway,
    config: ControllerConfig,
) -> Result<()> {
    let api: Api<EventSubscription> = Api::namespaced(client, &config.namespace);
    let store = Arc::new(KubeStore::from_api(api.clone()));

    let reconciler = Arc::new(
        Reconciler::new(store, broker)
            .with_metrics(ControllerMetrics::new())
            .with_cleanup_policy(config.cleanup),
    );

    info!(namespace = %config.namespace, "Starting EventSubscription controller");

    Dispatcher::new(reconciler, config.dispatcher)
        .run(subscription_events(api, Config::default()))
        .await;

    warn!("EventSubscription watch stream ended");
    Ok(())
}
