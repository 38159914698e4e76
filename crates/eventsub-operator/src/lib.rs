//! # EventSubscription Operator
//!
//! Kubernetes operator that keeps RabbitMQ queues in line with declarative
//! `EventSubscription` resources.
//!
//! Services declare their interest in events over a small HTTP API. Each
//! declaration becomes an `EventSubscription` object whose spec carries a
//! content hashsum, so repeated identical declarations never write to the
//! cluster. A controller watches those objects and creates, replaces or
//! removes the matching broker queue.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use eventsub_operator::prelude::*;
//! use kube::Client;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::try_default().await?;
//!     let backend = ManagementClient::new(ManagementConfig::default())?;
//!     let broker = BrokerGateway::new(Arc::new(backend));
//!
//!     run_controller(client, broker, ControllerConfig {
//!         namespace: "default".to_string(),
//!         dispatcher: DispatcherConfig::default(),
//!         cleanup: CleanupPolicy::default(),
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Declare**: `PUT /subscriptions/{namespace}` upserts the resource,
//!    gated on the filters hashsum
//! 2. **Watch**: the raw watch stream is classified into added, modified,
//!    deletion-requested and removed events
//! 3. **Dispatch**: events are routed to one serial worker per resource uid
//! 4. **Act**: queues tagged with `x-owner-id = <uid>` are declared, replaced
//!    or deleted; a finalizer holds deletion until cleanup succeeds
//!
//! ## Naming
//!
//! For `apiNamespace=team1, service=orders, queue=created`:
//!
//! - object name: `orders-created`
//! - broker queue: `v4:eventsubscription:team1:orders:created:queue`
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`naming`] - Object and queue name derivation
//! - [`hashsum`] - Filter normalization and content hashing
//! - [`store`] - Resource store capability and its Kubernetes implementation
//! - [`service`] - Idempotent create-or-patch of subscriptions
//! - [`broker`] - Owner-tagged queue operations over a broker backend
//! - [`management`] - RabbitMQ management API backend
//! - [`watch`] - Typed lifecycle events from the watch stream
//! - [`dispatcher`] - Per-resource serial workers
//! - [`controller`] - Reconciliation of lifecycle events
//! - [`server`] - HTTP API
//! - [`error`] - Error types for operator operations
//!
//! ## Metrics
//!
//! - `eventsub_reconciliations_total` - Total reconciliation attempts
//! - `eventsub_reconciliation_errors_total` - Reconciliation errors
//! - `eventsub_reconciliation_duration_seconds` - Reconciliation latency
//! - `eventsub_upserts_total` - Upsert requests
//! - `eventsub_upsert_writes_total` - Upserts that wrote to the store
//! - `eventsub_dispatch_dropped_total` - Events dropped on a full worker queue

pub mod broker;
pub mod controller;
pub mod crd;
pub mod dispatcher;
pub mod error;
pub mod hashsum;
pub mod management;
pub mod naming;
pub mod server;
pub mod service;
pub mod store;
pub mod watch;

#[cfg(test)]
mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::broker::{BrokerGateway, CleanupReport, QueueBackend, QueueInfo};
    pub use crate::controller::{
        run_controller, CleanupPolicy, ControllerConfig, ControllerMetrics, Reconciler,
    };
    pub use crate::crd::{
        EventSubscription, EventSubscriptionSpec, EventSubscriptionStatus, SubscriptionPhase,
        SUBSCRIPTION_FINALIZER,
    };
    pub use crate::dispatcher::{Dispatcher, DispatcherConfig, EventHandler};
    pub use crate::error::{OperatorError, Result};
    pub use crate::management::{ManagementClient, ManagementConfig};
    pub use crate::naming::{queue_name, resource_name};
    pub use crate::server::{router, serve, ApiState};
    pub use crate::service::{ServiceMetrics, SubscriptionService};
    pub use crate::store::{KubeStore, SubscriptionStore};
    pub use crate::watch::{subscription_events, SubscriptionEvent};
}
