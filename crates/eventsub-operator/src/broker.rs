//! Broker Gateway
//!
//! Owns the tagging policy for broker queues: every queue the operator
//! declares carries the owning subscription's unique id as the
//! `x-owner-id` argument, so all queues of a subscription can be found
//! regardless of their names. The transport is a [`QueueBackend`].

use crate::error::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Queue argument holding the owner id
pub const OWNER_ID_ARGUMENT: &str = "x-owner-id";

/// A queue as reported by the broker
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueInfo {
    /// Queue name
    pub name: String,
    /// Declared queue arguments
    #[serde(default)]
    pub arguments: BTreeMap<String, Value>,
}

impl QueueInfo {
    /// Owner id tag, if the queue carries one
    pub fn owner_id(&self) -> Option<&str> {
        self.arguments.get(OWNER_ID_ARGUMENT).and_then(Value::as_str)
    }
}

/// Queue operations a broker transport must provide
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Declare a durable queue; declaring an existing queue succeeds
    async fn declare_queue(&self, name: &str, arguments: BTreeMap<String, Value>) -> Result<()>;

    /// Delete a queue; deleting an absent queue succeeds
    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// List every queue in the scope of this backend
    async fn list_queues(&self) -> Result<Vec<QueueInfo>>;
}

/// A queue whose deletion failed
#[derive(Debug, Clone, PartialEq)]
pub struct QueueFailure {
    /// Queue name
    pub queue: String,
    /// Error message from the backend
    pub message: String,
    /// Whether repeating the deletion can succeed
    pub retryable: bool,
}

/// Outcome of deleting the queues of one owner
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanupReport {
    /// Queues that were deleted
    pub deleted: Vec<String>,
    /// Queues whose deletion failed
    pub failed: Vec<QueueFailure>,
    /// Set when the owner's queues could not be listed at all
    pub list_error: Option<String>,
}

impl CleanupReport {
    /// Whether every owned queue is known to be gone
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.list_error.is_none()
    }

    /// Whether every failed deletion may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        self.failed.iter().all(|f| f.retryable)
    }
}

/// Gateway between the controller and the broker
#[derive(Clone)]
pub struct BrokerGateway {
    backend: Arc<dyn QueueBackend>,
}

impl BrokerGateway {
    /// Create a gateway over a queue backend
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    /// Declare `name` tagged with `owner_id`
    pub async fn create_queue(&self, owner_id: &str, name: &str) -> Result<()> {
        let mut arguments = BTreeMap::new();
        arguments.insert(
            OWNER_ID_ARGUMENT.to_string(),
            Value::String(owner_id.to_string()),
        );

        self.backend.declare_queue(name, arguments).await?;
        info!(queue = %name, owner_id = %owner_id, "Queue declared");
        Ok(())
    }

    /// Delete a queue by name
    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        self.backend.delete_queue(name).await?;
        info!(queue = %name, "Queue deleted");
        Ok(())
    }

    /// All queues tagged with `owner_id`
    pub async fn list_queues_by_owner(&self, owner_id: &str) -> Result<Vec<QueueInfo>> {
        let queues = self.backend.list_queues().await?;
        let owned: Vec<QueueInfo> = queues
            .into_iter()
            .filter(|q| q.owner_id() == Some(owner_id))
            .collect();
        debug!(owner_id = %owner_id, count = owned.len(), "Listed owned queues");
        Ok(owned)
    }

    /// Delete every queue tagged with `owner_id`.
    ///
    /// Deletions run concurrently; one failing deletion does not stop the
    /// others. Fails only when the owned queues cannot be listed.
    pub async fn delete_owned_queues(&self, owner_id: &str) -> Result<CleanupReport> {
        let owned = self.list_queues_by_owner(owner_id).await?;

        let outcomes = join_all(owned.iter().map(|queue| async move {
            (queue.name.clone(), self.delete_queue(&queue.name).await)
        }))
        .await;

        let mut report = CleanupReport::default();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(()) => report.deleted.push(name),
                Err(e) => {
                    warn!(queue = %name, owner_id = %owner_id, error = %e, "Failed to delete queue");
                    report.failed.push(QueueFailure {
                        retryable: e.is_retryable(),
                        message: e.to_string(),
                        queue: name,
                    });
                }
            }
        }
        Ok(report)
    }

    /// Delete every queue tagged with `owner_id`, then declare `new_name`.
    ///
    /// Cleanup problems are recorded in the returned report and never
    /// prevent the declaration. Only a failed declaration is an error.
    pub async fn replace_queues(&self, owner_id: &str, new_name: &str) -> Result<CleanupReport> {
        let report = match self.delete_owned_queues(owner_id).await {
            Ok(report) => report,
            Err(e) => {
                warn!(owner_id = %owner_id, error = %e, "Failed to list owned queues, declaring anyway");
                CleanupReport {
                    list_error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        self.create_queue(owner_id, new_name).await?;
        Ok(report)
    }
}
