//! RabbitMQ Management Client
//!
//! Production [`QueueBackend`] speaking the RabbitMQ management HTTP API.
//! Every operation is scoped to one virtual host.

use crate::broker::{QueueBackend, QueueInfo};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Default management API base URL
const DEFAULT_BASE_URL: &str = "http://localhost:15672";

/// Default request timeout for management calls
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum error body bytes to read
const MAX_ERROR_BODY_BYTES: usize = 4096;

/// Configuration for the management client
#[derive(Debug, Clone)]
pub struct ManagementConfig {
    /// Management API base URL
    pub base_url: String,
    /// Virtual host all queues live in
    pub vhost: String,
    /// Management user
    pub username: String,
    /// Management password
    pub password: SecretString,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: SecretString::from("guest".to_string()),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Serialize)]
struct DeclareQueueRequest<'a> {
    durable: bool,
    auto_delete: bool,
    arguments: &'a BTreeMap<String, Value>,
}

/// Client for the RabbitMQ management API
pub struct ManagementClient {
    config: ManagementConfig,
    client: reqwest::Client,
}

impl std::fmt::Debug for ManagementClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementClient")
            .field("base_url", &self.config.base_url)
            .field("vhost", &self.config.vhost)
            .field("username", &self.config.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl ManagementClient {
    /// Create a client from configuration
    pub fn new(mut config: ManagementConfig) -> Result<Self> {
        if !config.base_url.starts_with("https://") && !config.base_url.starts_with("http://") {
            return Err(OperatorError::InvalidConfig(format!(
                "management URL must start with http:// or https://, got: {}",
                config.base_url
            )));
        }
        if config.vhost.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "vhost must not be empty".to_string(),
            ));
        }
        config.base_url = config.base_url.trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OperatorError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        debug!(base_url = %config.base_url, vhost = %config.vhost, "Management client initialized");

        Ok(Self { config, client })
    }

    fn queues_url(&self) -> String {
        format!(
            "{}/api/queues/{}",
            self.config.base_url,
            urlencoding::encode(&self.config.vhost)
        )
    }

    fn queue_url(&self, name: &str) -> String {
        format!("{}/{}", self.queues_url(), urlencoding::encode(name))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.basic_auth(
            &self.config.username,
            Some(self.config.password.expose_secret()),
        )
    }

    /// Turn a non-success response into an error, reading a bounded body
    async fn error_from_response(response: reqwest::Response) -> OperatorError {
        let status = response.status().as_u16();
        let message = match response.bytes().await {
            Ok(b) if b.len() > MAX_ERROR_BODY_BYTES => {
                String::from_utf8_lossy(&b[..MAX_ERROR_BODY_BYTES]).to_string()
            }
            Ok(b) => String::from_utf8_lossy(&b).to_string(),
            Err(_) => String::new(),
        };
        OperatorError::BrokerOperationFailed { status, message }
    }
}

fn transport_error(e: reqwest::Error) -> OperatorError {
    OperatorError::BrokerTransport(e.to_string())
}

#[async_trait]
impl QueueBackend for ManagementClient {
    async fn declare_queue(&self, name: &str, arguments: BTreeMap<String, Value>) -> Result<()> {
        let url = self.queue_url(name);
        debug!(url = %url, "Declaring queue");

        let response = self
            .authorize(self.client.put(&url))
            .json(&DeclareQueueRequest {
                durable: true,
                auto_delete: false,
                arguments: &arguments,
            })
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from_response(response).await)
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let url = self.queue_url(name);
        debug!(url = %url, "Deleting queue");

        let response = self
            .authorize(self.client.delete(&url))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::NOT_FOUND {
            debug!(queue = %name, "Queue already absent");
            Ok(())
        } else {
            Err(Self::error_from_response(response).await)
        }
    }

    async fn list_queues(&self) -> Result<Vec<QueueInfo>> {
        let url = self.queues_url();

        let response = self
            .authorize(self.client.get(&url))
            .query(&[("columns", "name,arguments")])
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let queues: Vec<QueueInfo> = response.json().await.map_err(|e| {
            warn!(error = %e, "Unreadable queue listing");
            transport_error(e)
        })?;
        Ok(queues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str, vhost: &str) -> ManagementClient {
        ManagementClient::new(ManagementConfig {
            base_url: base_url.to_string(),
            vhost: vhost.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = ManagementConfig::default();
        assert_eq!(config.base_url, "http://localhost:15672");
        assert_eq!(config.vhost, "/");
        assert_eq!(config.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_default_vhost_is_encoded() {
        let client = client("http://rabbit:15672/", "/");
        assert_eq!(client.queues_url(), "http://rabbit:15672/api/queues/%2F");
    }

    #[test]
    fn test_queue_name_is_encoded() {
        let client = client("http://rabbit:15672", "events");
        assert_eq!(
            client.queue_url("v4:eventsubscription:team1:orders:created:queue"),
            "http://rabbit:15672/api/queues/events/v4%3Aeventsubscription%3Ateam1%3Aorders%3Acreated%3Aqueue"
        );
    }

    #[test]
    fn test_rejects_bad_url() {
        let err = ManagementClient::new(ManagementConfig {
            base_url: "rabbit:15672".to_string(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, OperatorError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_empty_vhost() {
        let err = ManagementClient::new(ManagementConfig {
            vhost: String::new(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, OperatorError::InvalidConfig(_)));
    }

    #[test]
    fn test_debug_redacts_password() {
        let client = ManagementClient::new(ManagementConfig {
            password: SecretString::from("s3cret".to_string()),
            ..Default::default()
        })
        .unwrap();
        let rendered = format!("{:?}", client);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn test_declare_request_shape() {
        let mut arguments = BTreeMap::new();
        arguments.insert("x-owner-id".to_string(), Value::String("uid-1".to_string()));
        let body = serde_json::to_value(DeclareQueueRequest {
            durable: true,
            auto_delete: false,
            arguments: &arguments,
        })
        .unwrap();
        assert_eq!(body["durable"], true);
        assert_eq!(body["arguments"]["x-owner-id"], "uid-1");
    }
}
