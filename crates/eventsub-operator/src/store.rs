//! Resource Store Client
//!
//! Capability trait over the EventSubscription resource API plus the
//! Kubernetes implementation. Objects are keyed by
//! [`resource_name`](crate::naming::resource_name).

use crate::crd::{
    EventSubscription, EventSubscriptionSpec, EventSubscriptionStatus, SUBSCRIPTION_FINALIZER,
};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use json_patch::{AddOperation, PatchOperation, RemoveOperation, TestOperation};
use jsonptr::PointerBuf;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::{debug, instrument};

/// Attempts at a finalizer patch before giving up on a moving list
const FINALIZER_PATCH_ATTEMPTS: u32 = 3;

/// Operations on stored EventSubscription resources
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Fetch by object name; `NotFound` when absent
    async fn get(&self, name: &str) -> Result<EventSubscription>;

    /// Create a new resource named after the spec
    async fn create(&self, spec: &EventSubscriptionSpec) -> Result<EventSubscription>;

    /// Merge-patch the full spec of an existing resource
    async fn patch(&self, name: &str, spec: &EventSubscriptionSpec) -> Result<EventSubscription>;

    /// Every stored resource
    async fn list(&self) -> Result<Vec<EventSubscription>>;

    /// Attach the cleanup finalizer; no-op when already present
    async fn add_finalizer(&self, subscription: &EventSubscription) -> Result<()>;

    /// Detach the cleanup finalizer, letting a pending deletion complete
    async fn remove_finalizer(&self, subscription: &EventSubscription) -> Result<()>;

    /// Replace the status subresource
    async fn update_status(&self, name: &str, status: &EventSubscriptionStatus) -> Result<()>;
}

/// Store backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    api: Api<EventSubscription>,
}

impl KubeStore {
    /// Store scoped to one Kubernetes namespace
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    /// Store over an existing API handle
    pub fn from_api(api: Api<EventSubscription>) -> Self {
        Self { api }
    }

    /// Apply a finalizer JSON patch, refetching and rebuilding it when its
    /// `test` precondition fails because the list moved underneath us
    async fn patch_finalizers<F>(&self, subscription: &EventSubscription, build: F) -> Result<()>
    where
        F: Fn(&EventSubscription) -> Option<json_patch::Patch>,
    {
        let name = subscription.name_any();
        let mut current = subscription.clone();
        let mut attempt = 1;
        loop {
            let Some(patch) = build(&current) else {
                return Ok(());
            };
            match self
                .api
                .patch(&name, &PatchParams::default(), &Patch::<()>::Json(patch))
                .await
            {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 422 && attempt < FINALIZER_PATCH_ATTEMPTS => {
                    debug!(name = %name, attempt, "Finalizer list changed, refetching");
                    current = self.api.get(&name).await.map_err(|e| classify(&name, e))?;
                    attempt += 1;
                }
                Err(e) => return Err(classify(&name, e)),
            }
        }
    }
}

fn finalizers_path() -> PointerBuf {
    PointerBuf::from_tokens(["metadata", "finalizers"])
}

/// JSON patch appending our finalizer. `None` when it is already attached.
///
/// Only `/metadata/finalizers` is tested, so concurrent label, annotation
/// or spec edits do not make the patch fail.
pub fn add_finalizer_patch(subscription: &EventSubscription) -> Option<json_patch::Patch> {
    if subscription.has_finalizer() {
        return None;
    }
    let current = subscription.finalizers();
    let ops = if current.is_empty() {
        vec![
            PatchOperation::Test(TestOperation {
                path: finalizers_path(),
                value: Value::Null,
            }),
            PatchOperation::Add(AddOperation {
                path: finalizers_path(),
                value: Value::from(vec![SUBSCRIPTION_FINALIZER]),
            }),
        ]
    } else {
        vec![
            PatchOperation::Test(TestOperation {
                path: finalizers_path(),
                value: Value::from(current.to_vec()),
            }),
            PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", "finalizers", "-"]),
                value: Value::from(SUBSCRIPTION_FINALIZER),
            }),
        ]
    };
    Some(json_patch::Patch(ops))
}

/// JSON patch removing our finalizer by index. `None` when it is absent.
pub fn remove_finalizer_patch(subscription: &EventSubscription) -> Option<json_patch::Patch> {
    let index = subscription
        .finalizers()
        .iter()
        .position(|f| f == SUBSCRIPTION_FINALIZER)?
        .to_string();
    let path = PointerBuf::from_tokens(["metadata", "finalizers", index.as_str()]);
    Some(json_patch::Patch(vec![
        PatchOperation::Test(TestOperation {
            path: path.clone(),
            value: Value::from(SUBSCRIPTION_FINALIZER),
        }),
        PatchOperation::Remove(RemoveOperation { path }),
    ]))
}

/// Map a kube error to the store taxonomy
pub(crate) fn classify(name: &str, error: kube::Error) -> OperatorError {
    match error {
        kube::Error::Api(ae) if ae.code == 404 => OperatorError::NotFound(name.to_string()),
        kube::Error::Api(ae) if ae.code == 503 => OperatorError::StoreUnavailable(ae.message),
        e @ kube::Error::Api(_) => OperatorError::KubeError(e),
        kube::Error::HyperError(e) => OperatorError::StoreUnavailable(e.to_string()),
        kube::Error::Service(e) => OperatorError::StoreUnavailable(e.to_string()),
        e => OperatorError::KubeError(e),
    }
}

#[async_trait]
impl SubscriptionStore for KubeStore {
    #[instrument(skip(self))]
    async fn get(&self, name: &str) -> Result<EventSubscription> {
        self.api.get(name).await.map_err(|e| classify(name, e))
    }

    #[instrument(skip(self, spec), fields(service = %spec.service, queue = %spec.queue))]
    async fn create(&self, spec: &EventSubscriptionSpec) -> Result<EventSubscription> {
        let name = spec.resource_name();
        let subscription = EventSubscription::new(&name, spec.clone());
        debug!(name = %name, "Creating EventSubscription");
        self.api
            .create(&PostParams::default(), &subscription)
            .await
            .map_err(|e| classify(&name, e))
    }

    #[instrument(skip(self, spec))]
    async fn patch(&self, name: &str, spec: &EventSubscriptionSpec) -> Result<EventSubscription> {
        debug!(name = %name, hashsum = %spec.filters_hashsum, "Patching EventSubscription");
        let patch = serde_json::json!({ "spec": spec });
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(name, e))
    }

    async fn list(&self) -> Result<Vec<EventSubscription>> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| classify("*", e))?;
        Ok(list.items)
    }

    async fn add_finalizer(&self, subscription: &EventSubscription) -> Result<()> {
        self.patch_finalizers(subscription, add_finalizer_patch).await
    }

    async fn remove_finalizer(&self, subscription: &EventSubscription) -> Result<()> {
        match self.patch_finalizers(subscription, remove_finalizer_patch).await {
            // Already gone
            Err(OperatorError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn update_status(&self, name: &str, status: &EventSubscriptionStatus) -> Result<()> {
        debug!(name = %name, phase = %status.phase, "Updating subscription status");
        let patch = serde_json::json!({ "status": status });
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(name, e))?;
        Ok(())
    }
}
