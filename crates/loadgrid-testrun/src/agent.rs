//! Runner control API client
//!
//! Every runner listens on [`AGENT_CONTROL_PORT`] and exposes a small REST
//! API: `GET /v1/status` answers once the runner is up and paused,
//! `PATCH /v1/status` resumes or stops it, and `/v1/setup` runs the test's
//! setup function for private load zone runs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;
use tracing::{debug, info, warn};

use loadgrid_common::AGENT_CONTROL_PORT;

#[cfg(test)]
use mockall::automock;

/// Errors talking to a runner
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// HTTP client could not be constructed
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// Request never got a response
    #[error("request to {host} failed: {source}")]
    Transport {
        /// Target host
        host: String,
        /// Underlying transport error
        #[source]
        source: reqwest::Error,
    },

    /// Runner answered with an error status
    #[error("{host} answered HTTP {status}")]
    Status {
        /// Target host
        host: String,
        /// HTTP status code
        status: u16,
    },

    /// Runner answered with a body we could not use
    #[error("invalid response from {host}: {message}")]
    InvalidResponse {
        /// Target host
        host: String,
        /// What was wrong with it
        message: String,
    },
}

impl AgentError {
    /// Whether retrying the same call later can succeed.
    ///
    /// Transport failures and 5xx/429 answers are transient; anything the
    /// runner rejected outright is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Client(_) => false,
            AgentError::Transport { .. } => true,
            AgentError::Status { status, .. } => *status >= 500 || *status == 429,
            AgentError::InvalidResponse { .. } => false,
        }
    }
}

/// Body of a `PATCH /v1/status` call
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StatusCommand {
    data: StatusData,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
struct StatusData {
    id: &'static str,
    #[serde(rename = "type")]
    type_: &'static str,
    attributes: StatusAttributes,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
struct StatusAttributes {
    paused: bool,
    stopped: bool,
}

impl StatusCommand {
    fn new(stopped: bool) -> Self {
        Self {
            data: StatusData {
                id: "default",
                type_: "status",
                attributes: StatusAttributes {
                    paused: false,
                    stopped,
                },
            },
        }
    }

    /// Resume a paused runner
    pub fn start() -> Self {
        Self::new(false)
    }

    /// Stop a running runner
    pub fn stop() -> Self {
        Self::new(true)
    }

    /// JSON body
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!(self)
    }
}

/// `http://<host>:6565/v1/status`
pub fn status_url(host: &str) -> String {
    format!("http://{}:{}/v1/status", host, AGENT_CONTROL_PORT)
}

/// `http://<host>:6565/v1/setup`
pub fn setup_url(host: &str) -> String {
    format!("http://{}:{}/v1/setup", host, AGENT_CONTROL_PORT)
}

/// Trait abstracting calls to runner control APIs
///
/// This trait allows mocking runners in tests while using HTTP in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Ready iff `GET /v1/status` answers below 400. Transport errors count
    /// as not ready.
    async fn probe_status(&self, host: &str) -> bool;

    /// Resume the paused runner on `host`
    async fn start(&self, host: &str) -> Result<(), AgentError>;

    /// Stop the runner on `host`
    async fn stop(&self, host: &str) -> Result<(), AgentError>;

    /// Run the setup function on the first host and hand its result to every
    /// host.
    async fn setup(&self, hosts: &[String]) -> Result<(), AgentError>;
}

/// [`AgentClient`] speaking HTTP to the runners
#[derive(Clone)]
pub struct HttpAgentClient {
    http: reqwest::Client,
}

impl HttpAgentClient {
    /// Create a client whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(AgentError::Client)?;
        Ok(Self { http })
    }

    /// Send `body` to `url` and fail on any status of 400 or above
    pub(crate) async fn send(
        &self,
        host: &str,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, AgentError> {
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|source| AgentError::Transport {
            host: host.to_string(),
            source,
        })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(AgentError::Status {
                host: host.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn patch_status(&self, host: &str, command: StatusCommand) -> Result<(), AgentError> {
        let body = command.to_value();
        self.send(host, Method::PATCH, &status_url(host), Some(&body))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn probe_status(&self, host: &str) -> bool {
        match self
            .send(host, Method::GET, &status_url(host), None)
            .await
        {
            Ok(_) => true,
            Err(AgentError::Status { status, .. }) => {
                debug!(host, status, "Runner not ready");
                false
            }
            Err(e) => {
                warn!(host, error = %e, "Failed to get runner status");
                false
            }
        }
    }

    async fn start(&self, host: &str) -> Result<(), AgentError> {
        self.patch_status(host, StatusCommand::start()).await
    }

    async fn stop(&self, host: &str) -> Result<(), AgentError> {
        self.patch_status(host, StatusCommand::stop()).await
    }

    async fn setup(&self, hosts: &[String]) -> Result<(), AgentError> {
        let Some(first) = hosts.first() else {
            return Ok(());
        };

        info!(host = %first, "Running setup");
        let response = self
            .send(first, Method::POST, &setup_url(first), None)
            .await?;
        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::InvalidResponse {
                host: first.clone(),
                message: e.to_string(),
            })?;

        for host in hosts {
            self.send(host, Method::PUT, &setup_url(host), Some(&data))
                .await?;
        }
        info!(hosts = hosts.len(), "Setup data distributed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_command_matches_control_api_payload() {
        assert_eq!(
            StatusCommand::start().to_value(),
            serde_json::json!({
                "data": {
                    "id": "default",
                    "type": "status",
                    "attributes": {"paused": false, "stopped": false}
                }
            })
        );
    }

    #[test]
    fn stop_command_sets_stopped() {
        let value = StatusCommand::stop().to_value();
        assert_eq!(value["data"]["attributes"]["stopped"], true);
        assert_eq!(value["data"]["attributes"]["paused"], false);
    }

    #[test]
    fn urls_use_control_port() {
        assert_eq!(status_url("10.0.0.7"), "http://10.0.0.7:6565/v1/status");
        assert_eq!(setup_url("smoke-1"), "http://smoke-1:6565/v1/setup");
    }

    #[test]
    fn story_server_errors_are_retryable_client_errors_are_not() {
        let status = |status| AgentError::Status {
            host: "10.0.0.1".to_string(),
            status,
        };
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(422).is_retryable());
        assert!(!AgentError::InvalidResponse {
            host: "10.0.0.1".to_string(),
            message: "expected JSON".to_string(),
        }
        .is_retryable());
    }

    #[tokio::test]
    async fn setup_with_no_hosts_is_a_noop() {
        let client = HttpAgentClient::new(Duration::from_secs(1)).unwrap();
        assert!(client.setup(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_runner_is_not_ready() {
        let client = HttpAgentClient::new(Duration::from_millis(200)).unwrap();
        // port 6565 on the loopback address is not listening in tests
        assert!(!client.probe_status("127.0.0.1").await);
    }
}
