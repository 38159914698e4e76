//! Error types for the EventSubscription operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Resource lookup miss in the store
    #[error("EventSubscription not found: {0}")]
    NotFound(String),

    /// The resource store could not be reached or refused the request
    #[error("Resource store unavailable: {0}")]
    StoreUnavailable(String),

    /// Kubernetes API / transport error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The broker answered a queue operation with an error
    #[error("Broker operation failed ({status}): {message}")]
    BrokerOperationFailed { status: u16, message: String },

    /// The broker could not be reached
    #[error("Broker transport error: {0}")]
    BrokerTransport(String),

    /// Custom resource type registration failed at startup
    #[error("Resource registration failed: {0}")]
    RegistrationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Whether this error is a store lookup miss
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound(_) => true,
            OperatorError::KubeError(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::StoreUnavailable(_)
                | OperatorError::BrokerTransport(_)
        ) || matches!(
            self,
            OperatorError::BrokerOperationFailed { status, .. } if *status >= 500 || *status == 429
        )
    }

    /// Machine-readable error kind for HTTP error bodies
    pub fn error_kind(&self) -> &'static str {
        match self {
            OperatorError::NotFound(_) => "NotFound",
            OperatorError::StoreUnavailable(_) => "StoreUnavailable",
            OperatorError::KubeError(_) => "TransportError",
            OperatorError::BrokerOperationFailed { .. } => "BrokerOperationFailed",
            OperatorError::BrokerTransport(_) => "TransportError",
            OperatorError::RegistrationFailed(_) => "RegistrationFailed",
            OperatorError::InvalidConfig(_) => "InvalidConfig",
            OperatorError::ValidationError(_) => "ValidationError",
            OperatorError::Internal(_) => "Internal",
        }
    }

    /// Get the HTTP status code
    pub fn http_status(&self) -> u16 {
        if self.is_not_found() {
            return 404;
        }
        match self {
            OperatorError::ValidationError(_) => 422,
            _ => 500,
        }
    }
}
