//! Desired-State Service
//!
//! Idempotent declaration of subscriptions on top of a
//! [`SubscriptionStore`]. Writes are gated on the content hashsum: an
//! upsert whose hash equals the stored one never touches the store.

use crate::crd::EventSubscriptionSpec;
use crate::error::{OperatorError, Result};
use crate::hashsum::normalize_filters;
use crate::naming::resource_name;
use crate::store::SubscriptionStore;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Metrics for the desired-state service
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Counter for upsert requests
    pub upserts: metrics::Counter,
    /// Counter for upserts that wrote to the store
    pub writes: metrics::Counter,
}

impl ServiceMetrics {
    /// Create new service metrics
    pub fn new() -> Self {
        Self {
            upserts: metrics::counter!("eventsub_upserts_total"),
            writes: metrics::counter!("eventsub_upsert_writes_total"),
        }
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Create-or-patch access to subscriptions
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    metrics: Option<ServiceMetrics>,
}

impl SubscriptionService {
    /// Service over a store
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self {
            store,
            metrics: None,
        }
    }

    /// Record upsert metrics
    pub fn with_metrics(mut self, metrics: ServiceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Declare a subscription.
    ///
    /// Creates it when absent, merge-patches it when its hashsum changed,
    /// and returns the stored spec untouched otherwise. An object deleted
    /// between the read and the patch is created afresh.
    #[instrument(skip(self, filters), fields(filter_count = filters.len()))]
    pub async fn upsert(
        &self,
        namespace: &str,
        service: &str,
        queue: &str,
        filters: &[Value],
    ) -> Result<EventSubscriptionSpec> {
        if let Some(ref metrics) = self.metrics {
            metrics.upserts.increment(1);
        }

        let desired = EventSubscriptionSpec::new(namespace, service, queue, normalize_filters(filters));
        if let Some(message) = desired.validation_message() {
            return Err(OperatorError::ValidationError(message));
        }
        let name = desired.resource_name();

        let stored = match self.store.get(&name).await {
            Ok(existing) => {
                if existing.spec.filters_hashsum == desired.filters_hashsum {
                    debug!(name = %name, hashsum = %desired.filters_hashsum, "Subscription unchanged");
                    return Ok(existing.spec);
                }
                info!(
                    name = %name,
                    old_hashsum = %existing.spec.filters_hashsum,
                    new_hashsum = %desired.filters_hashsum,
                    "Patching subscription"
                );
                match self.store.patch(&name, &desired).await {
                    Err(e) if e.is_not_found() => {
                        info!(name = %name, "Subscription deleted before patch, creating");
                        self.store.create(&desired).await?
                    }
                    other => other?,
                }
            }
            Err(e) if e.is_not_found() => {
                info!(name = %name, hashsum = %desired.filters_hashsum, "Creating subscription");
                self.store.create(&desired).await?
            }
            Err(e) => return Err(e),
        };

        if let Some(ref metrics) = self.metrics {
            metrics.writes.increment(1);
        }
        Ok(stored.spec)
    }

    /// Fetch a subscription by service and queue
    pub async fn get(&self, service: &str, queue: &str) -> Result<EventSubscriptionSpec> {
        let name = resource_name(service, queue);
        match self.store.get(&name).await {
            Ok(subscription) => Ok(subscription.spec),
            Err(e) if e.is_not_found() => Err(OperatorError::NotFound(name)),
            Err(e) => Err(e),
        }
    }

    /// Every subscription declared in a logical namespace
    pub async fn list(&self, namespace: &str) -> Result<Vec<EventSubscriptionSpec>> {
        let subscriptions = self.store.list().await?;
        Ok(subscriptions
            .into_iter()
            .map(|s| s.spec)
            .filter(|spec| spec.api_namespace == namespace)
            .collect())
    }

    /// Check that the store answers
    pub async fn probe(&self) -> Result<()> {
        self.store.list().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashsum::compute_hashsum;
    use crate::testing::InMemoryStore;
    use serde_json::json;

    fn service_with_store() -> (SubscriptionService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::default());
        (SubscriptionService::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_upsert_creates_when_absent() {
        let (service, store) = service_with_store();

        let spec = service
            .upsert("team1", "orders", "created", &[json!("type=created")])
            .await
            .unwrap();

        assert_eq!(store.create_calls(), 1);
        assert_eq!(store.patch_calls(), 0);
        assert_eq!(spec.api_namespace, "team1");
        assert!(store.object("orders-created").is_some());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (service, store) = service_with_store();
        let filters = [json!("type=created"), json!({"region": "eu"})];

        let first = service.upsert("team1", "orders", "created", &filters).await.unwrap();
        let second = service.upsert("team1", "orders", "created", &filters).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.create_calls(), 1);
        assert_eq!(store.patch_calls(), 0);
    }

    #[tokio::test]
    async fn test_upsert_patches_on_changed_hash() {
        let (service, store) = service_with_store();
        service
            .upsert("team1", "orders", "created", &[json!("a")])
            .await
            .unwrap();

        let spec = service
            .upsert("team1", "orders", "created", &[json!("b")])
            .await
            .unwrap();

        assert_eq!(store.create_calls(), 1);
        assert_eq!(store.patch_calls(), 1);
        assert_eq!(spec.filters, vec!["b"]);
    }

    #[tokio::test]
    async fn test_namespace_change_alone_is_not_a_write() {
        let (service, store) = service_with_store();
        let first = service
            .upsert("team1", "orders", "created", &[json!("a")])
            .await
            .unwrap();
        let second = service
            .upsert("team2", "orders", "created", &[json!("a")])
            .await
            .unwrap();

        // The namespace is outside the hash, so the stored spec wins
        assert_eq!(first.filters_hashsum, second.filters_hashsum);
        assert_eq!(second.api_namespace, "team1");
        assert_eq!(store.patch_calls(), 0);
    }

    #[tokio::test]
    async fn test_concrete_scenario() {
        let (service, store) = service_with_store();

        let h1 = service
            .upsert("team1", "orders", "created", &[json!("type=created")])
            .await
            .unwrap();
        assert!(store.object("orders-created").is_some());
        assert_eq!(store.create_calls(), 1);

        let filters = [json!("type=created"), json!("region=eu")];
        let h2 = service.upsert("team1", "orders", "created", &filters).await.unwrap();
        assert_ne!(h1.filters_hashsum, h2.filters_hashsum);
        assert_eq!(store.patch_calls(), 1);

        let h3 = service.upsert("team1", "orders", "created", &filters).await.unwrap();
        assert_eq!(h3, h2);
        assert_eq!(store.create_calls(), 1);
        assert_eq!(store.patch_calls(), 1);
    }

    #[tokio::test]
    async fn test_colon_bearing_identifiers_are_distinct_declarations() {
        let (service, store) = service_with_store();

        let first = service.upsert("team1", "a:b", "c", &[]).await.unwrap();
        let second = service.upsert("team1", "a", "b:c", &[]).await.unwrap();

        // Both kebab to the object `a-b-c`; the second declaration must win
        assert_ne!(first.filters_hashsum, second.filters_hashsum);
        assert_eq!((second.service.as_str(), second.queue.as_str()), ("a", "b:c"));
        assert_eq!(store.create_calls(), 1);
        assert_eq!(store.patch_calls(), 1);
        assert_eq!(store.object("a-b-c").unwrap().spec, second);
    }

    #[tokio::test]
    async fn test_upsert_creates_when_deleted_before_patch() {
        let (service, store) = service_with_store();
        service
            .upsert("team1", "orders", "created", &[json!("a")])
            .await
            .unwrap();
        store.remove_before_next_patch();

        let spec = service
            .upsert("team1", "orders", "created", &[json!("b")])
            .await
            .unwrap();

        assert_eq!(spec.filters, vec!["b"]);
        assert_eq!(store.patch_calls(), 1);
        assert_eq!(store.create_calls(), 2);
        assert_eq!(store.object("orders-created").unwrap().spec, spec);
    }

    #[tokio::test]
    async fn test_upsert_stores_structured_filters_as_json() {
        let (service, _) = service_with_store();
        let spec = service
            .upsert("team1", "orders", "created", &[json!({"type": "created"})])
            .await
            .unwrap();
        assert_eq!(spec.filters, vec![r#"{"type":"created"}"#]);
        assert_eq!(
            spec.filters_hashsum,
            compute_hashsum("orders", "created", &spec.filters)
        );
    }

    #[tokio::test]
    async fn test_upsert_propagates_store_errors() {
        let (service, store) = service_with_store();
        store.set_unavailable(true);

        let err = service
            .upsert("team1", "orders", "created", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::StoreUnavailable(_)));
        assert_eq!(store.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_upsert_rejects_invalid_input() {
        let (service, store) = service_with_store();
        let err = service.upsert("team1", "", "created", &[]).await.unwrap_err();
        assert!(matches!(err, OperatorError::ValidationError(_)));
        assert_eq!(store.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_get() {
        let (service, _) = service_with_store();
        service
            .upsert("team1", "orders", "created", &[json!("a")])
            .await
            .unwrap();

        let spec = service.get("orders", "created").await.unwrap();
        assert_eq!(spec.service, "orders");

        let err = service.get("orders", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace() {
        let (service, _) = service_with_store();
        service.upsert("ns-a", "orders", "created", &[]).await.unwrap();
        service.upsert("ns-a", "orders", "deleted", &[]).await.unwrap();
        service.upsert("ns-b", "payments", "settled", &[]).await.unwrap();

        let listed = service.list("ns-a").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|s| s.api_namespace == "ns-a"));

        assert!(service.list("ns-c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_propagates_store_errors() {
        let (service, store) = service_with_store();
        store.set_unavailable(true);
        assert!(service.list("ns-a").await.is_err());
    }
}
