//! In-memory test doubles for the store and broker capability traits

use crate::broker::{QueueBackend, QueueInfo};
use crate::crd::{
    EventSubscription, EventSubscriptionSpec, EventSubscriptionStatus, SUBSCRIPTION_FINALIZER,
};
use crate::error::{OperatorError, Result};
use crate::store::SubscriptionStore;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Ordered record of side effects shared between doubles
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }
}

/// A call observed by [`InMemoryBroker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Declare(String),
    Delete(String),
    List,
}

#[derive(Default)]
struct BrokerState {
    queues: BTreeMap<String, QueueInfo>,
    calls: Vec<BrokerCall>,
    failing_deletes: HashMap<String, u16>,
    fail_list: bool,
    fail_declare: bool,
}

/// Broker double keeping queues in a map
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    journal: Journal,
}

impl InMemoryBroker {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            state: Mutex::default(),
            journal,
        }
    }

    pub fn queues(&self) -> Vec<QueueInfo> {
        self.state.lock().queues.values().cloned().collect()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.state.lock().queues.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn insert_untagged(&self, name: &str) {
        self.state.lock().queues.insert(
            name.to_string(),
            QueueInfo {
                name: name.to_string(),
                arguments: BTreeMap::new(),
            },
        );
    }

    /// Deleting `name` fails with a transient 503
    pub fn fail_delete_of(&self, name: &str) {
        self.reject_delete_of(name, 503);
    }

    /// Deleting `name` fails with the given HTTP status
    pub fn reject_delete_of(&self, name: &str, status: u16) {
        self.state
            .lock()
            .failing_deletes
            .insert(name.to_string(), status);
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.lock().fail_list = fail;
    }

    pub fn fail_declare(&self, fail: bool) {
        self.state.lock().fail_declare = fail;
    }
}

fn broker_failure(status: u16, message: &str) -> OperatorError {
    OperatorError::BrokerOperationFailed {
        status,
        message: message.to_string(),
    }
}

#[async_trait]
impl QueueBackend for InMemoryBroker {
    async fn declare_queue(&self, name: &str, arguments: BTreeMap<String, Value>) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(BrokerCall::Declare(name.to_string()));
        if state.fail_declare {
            return Err(broker_failure(503, "declare refused"));
        }
        state.queues.entry(name.to_string()).or_insert(QueueInfo {
            name: name.to_string(),
            arguments,
        });
        self.journal.record(format!("broker:declare:{}", name));
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(BrokerCall::Delete(name.to_string()));
        if let Some(&status) = state.failing_deletes.get(name) {
            return Err(broker_failure(status, "delete refused"));
        }
        state.queues.remove(name);
        self.journal.record(format!("broker:delete:{}", name));
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<QueueInfo>> {
        let mut state = self.state.lock();
        state.calls.push(BrokerCall::List);
        if state.fail_list {
            return Err(OperatorError::BrokerTransport("connection refused".to_string()));
        }
        Ok(state.queues.values().cloned().collect())
    }
}

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<String, EventSubscription>,
    creates: usize,
    patches: usize,
    next_uid: usize,
    unavailable: bool,
    remove_before_patch: bool,
}

/// Resource store double keyed by object name
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    journal: Journal,
}

impl InMemoryStore {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            state: Mutex::default(),
            journal,
        }
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().creates
    }

    pub fn patch_calls(&self) -> usize {
        self.state.lock().patches
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn object(&self, name: &str) -> Option<EventSubscription> {
        self.state.lock().objects.get(name).cloned()
    }

    /// Insert an object directly, bypassing call counters
    pub fn seed(&self, subscription: EventSubscription) {
        let name = subscription.metadata.name.clone().unwrap_or_default();
        self.state.lock().objects.insert(name, subscription);
    }

    /// The next patch finds its object already deleted
    pub fn remove_before_next_patch(&self) {
        self.state.lock().remove_before_patch = true;
    }

    fn check_available(state: &StoreState) -> Result<()> {
        if state.unavailable {
            return Err(OperatorError::StoreUnavailable(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn get(&self, name: &str) -> Result<EventSubscription> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        state
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| OperatorError::NotFound(name.to_string()))
    }

    async fn create(&self, spec: &EventSubscriptionSpec) -> Result<EventSubscription> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        state.creates += 1;
        state.next_uid += 1;
        let name = spec.resource_name();
        let mut subscription = EventSubscription::new(&name, spec.clone());
        subscription.metadata.uid = Some(format!("uid-{}", state.next_uid));
        subscription.metadata.generation = Some(1);
        state.objects.insert(name, subscription.clone());
        Ok(subscription)
    }

    async fn patch(&self, name: &str, spec: &EventSubscriptionSpec) -> Result<EventSubscription> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        state.patches += 1;
        if std::mem::take(&mut state.remove_before_patch) {
            state.objects.remove(name);
        }
        let subscription = state
            .objects
            .get_mut(name)
            .ok_or_else(|| OperatorError::NotFound(name.to_string()))?;
        subscription.spec = spec.clone();
        subscription.metadata.generation = Some(subscription.metadata.generation.unwrap_or(0) + 1);
        Ok(subscription.clone())
    }

    async fn list(&self) -> Result<Vec<EventSubscription>> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        Ok(state.objects.values().cloned().collect())
    }

    async fn add_finalizer(&self, subscription: &EventSubscription) -> Result<()> {
        let name = subscription.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        if let Some(stored) = state.objects.get_mut(&name) {
            let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == SUBSCRIPTION_FINALIZER) {
                finalizers.push(SUBSCRIPTION_FINALIZER.to_string());
            }
        }
        self.journal.record(format!("store:add-finalizer:{}", name));
        Ok(())
    }

    async fn remove_finalizer(&self, subscription: &EventSubscription) -> Result<()> {
        let name = subscription.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        if let Some(stored) = state.objects.get_mut(&name) {
            if let Some(finalizers) = stored.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != SUBSCRIPTION_FINALIZER);
            }
            let released = stored
                .metadata
                .finalizers
                .as_ref()
                .map_or(true, |f| f.is_empty());
            if released && stored.metadata.deletion_timestamp.is_some() {
                state.objects.remove(&name);
            }
        }
        self.journal.record(format!("store:remove-finalizer:{}", name));
        Ok(())
    }

    async fn update_status(&self, name: &str, status: &EventSubscriptionStatus) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        if let Some(stored) = state.objects.get_mut(name) {
            stored.status = Some(status.clone());
        }
        self.journal.record(format!("store:status:{}", name));
        Ok(())
    }
}

/// Build a subscription as the watch stream would deliver it
pub fn subscription(
    namespace: &str,
    service: &str,
    queue: &str,
    filters: &[&str],
    uid: &str,
    generation: i64,
) -> EventSubscription {
    let spec = EventSubscriptionSpec::new(
        namespace,
        service,
        queue,
        filters.iter().map(|f| f.to_string()).collect(),
    );
    let name = spec.resource_name();
    let mut subscription = EventSubscription::new(&name, spec);
    subscription.metadata = ObjectMeta {
        name: Some(name),
        namespace: Some("default".to_string()),
        uid: Some(uid.to_string()),
        generation: Some(generation),
        ..Default::default()
    };
    subscription
}

/// Mark a subscription as deleting, keeping our finalizer attached
pub fn deleting(mut subscription: EventSubscription) -> EventSubscription {
    subscription.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    subscription.metadata.finalizers = Some(vec![SUBSCRIPTION_FINALIZER.to_string()]);
    subscription
}
