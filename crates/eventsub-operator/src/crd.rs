//! Custom Resource Definition for the EventSubscription operator
//!
//! This module defines the `EventSubscription` CRD: the declarative intent
//! that a broker queue named after `(apiNamespace, service, queue)` exists
//! and follows the declared filters.

use crate::hashsum::{compute_hashsum, is_valid_hashsum};
use crate::naming::{queue_name, resource_name};
use kube::{CustomResource, ResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Finalizer that blocks deletion until the owned broker queues are gone
pub const SUBSCRIPTION_FINALIZER: &str = "events.serverframework.io/remove-orphaned-queues";

/// Maximum number of filters on a single subscription
pub const MAX_FILTERS: usize = 100;

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// EventSubscription custom resource
///
/// # Example
///
/// ```yaml
/// apiVersion: events.serverframework.io/v1
/// kind: EventSubscription
/// metadata:
///   name: orders-created
/// spec:
///   apiNamespace: team1
///   service: orders
///   queue: created
///   filters:
///     - "type=created"
///     - '{"region":"eu"}'
///   filtersHashsum: 0c4f6f0c3e1b5d2b8e6e1f4e0a9f3b7d
/// ```
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "events.serverframework.io",
    version = "v1",
    kind = "EventSubscription",
    plural = "eventsubscriptions",
    shortname = "esub",
    namespaced,
    status = "EventSubscriptionStatus",
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".spec.apiNamespace"}"#,
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.service"}"#,
    printcolumn = r#"{"name":"Queue","type":"string","jsonPath":".spec.queue"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_derived_name"))]
pub struct EventSubscriptionSpec {
    /// Publishing service
    #[validate(length(min = 1, max = 63, message = "service must be 1-63 characters"))]
    pub service: String,

    /// Queue identifier within the service
    #[validate(length(min = 1, max = 63, message = "queue must be 1-63 characters"))]
    pub queue: String,

    /// Ordered filter expressions; structured filters are stored JSON-encoded
    #[serde(default)]
    #[validate(length(max = 100, message = "maximum 100 filters allowed"))]
    pub filters: Vec<String>,

    /// Logical tenant scope of the subscription
    #[validate(length(min = 1, max = 63, message = "apiNamespace must be 1-63 characters"))]
    pub api_namespace: String,

    /// Content hash over service, queue and filters
    #[validate(custom(function = "validate_hashsum"))]
    pub filters_hashsum: String,
}

fn validate_hashsum(value: &str) -> Result<(), ValidationError> {
    if is_valid_hashsum(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_hashsum")
            .with_message(format!("'{}' is not a 32-character hex digest", value).into()))
    }
}

/// The object name derived from service and queue must be a valid Kubernetes name
fn validate_derived_name(spec: &EventSubscriptionSpec) -> Result<(), ValidationError> {
    let name = spec.resource_name();
    if name.len() > 253 || !NAME_REGEX.is_match(&name) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", name).into(),
        ));
    }
    Ok(())
}

impl EventSubscriptionSpec {
    /// Build a spec from already-normalized filters, computing its hashsum
    pub fn new(
        namespace: impl Into<String>,
        service: impl Into<String>,
        queue: impl Into<String>,
        filters: Vec<String>,
    ) -> Self {
        let service = service.into();
        let queue = queue.into();
        let filters_hashsum = compute_hashsum(&service, &queue, &filters);
        Self {
            service,
            queue,
            filters,
            api_namespace: namespace.into(),
            filters_hashsum,
        }
    }

    /// Kubernetes object name for this subscription
    pub fn resource_name(&self) -> String {
        resource_name(&self.service, &self.queue)
    }

    /// Broker queue name for this subscription
    pub fn queue_name(&self) -> String {
        queue_name(&self.api_namespace, &self.service, &self.queue)
    }

    /// Collect validation failures into a single message
    pub fn validation_message(&self) -> Option<String> {
        let errors = self.validate().err()?;
        let mut messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| match &e.message {
                    Some(message) => format!("{}: {}", field, message),
                    None => format!("{}: {}", field, e.code),
                })
            })
            .collect();
        messages.sort();
        Some(messages.join("; "))
    }
}

impl EventSubscription {
    /// System-assigned identity used as the owner tag on broker queues
    pub fn unique_id(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    /// Whether our finalizer is attached
    pub fn has_finalizer(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|f| f == SUBSCRIPTION_FINALIZER)
    }

    /// Whether deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Queue name recorded by the last successful reconciliation
    pub fn recorded_queue_name(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.queue_name.as_deref())
    }
}

/// Reconciliation phase of a subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SubscriptionPhase {
    #[default]
    Pending,
    Ready,
    Error,
}

impl std::fmt::Display for SubscriptionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionPhase::Pending => write!(f, "Pending"),
            SubscriptionPhase::Ready => write!(f, "Ready"),
            SubscriptionPhase::Error => write!(f, "Error"),
        }
    }
}

/// Status of the EventSubscription resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventSubscriptionStatus {
    /// Current phase
    #[serde(default)]
    pub phase: SubscriptionPhase,

    /// Human-readable message about current state
    #[serde(default)]
    pub message: String,

    /// Broker queue declared by the last reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,

    /// Hashsum the broker state was last reconciled against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_hashsum: Option<String>,

    /// Last time the subscription was synced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<String>,
}
