//! Cloud reporting service client
//!
//! Cloud-backed TestRuns are registered with the reporting service before
//! their runners are created, and unrecoverable failures are reported there
//! so the service can abort the run on its side.

use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use loadgrid_common::crd::TestRun;

#[cfg(test)]
use mockall::automock;

/// Errors talking to the reporting service
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    /// HTTP client could not be constructed
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// Request never got a response
    #[error("request to {url} failed: {source}")]
    Transport {
        /// Target URL
        url: String,
        /// Underlying transport error
        #[source]
        source: reqwest::Error,
    },

    /// Service answered with an error status
    #[error("{url} answered HTTP {status}: {body}")]
    Status {
        /// Target URL
        url: String,
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// Service answered with a body we could not use
    #[error("invalid response from {url}: {message}")]
    InvalidResponse {
        /// Target URL
        url: String,
        /// What was wrong with it
        message: String,
    },
}

/// Error categories understood by the reporting service
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum CloudErrorKind {
    /// The operator could not bring the runners up
    OperatorStartError,
    /// The test's setup function failed
    SetupError,
}

/// Event sent to the reporting service
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudEvent {
    /// Error category
    pub error_code: CloudErrorKind,
    /// Human-readable detail
    #[serde(default)]
    pub detail: String,
    /// Ask the service to abort the run
    #[serde(default)]
    pub abort: bool,
}

impl CloudEvent {
    /// Start building an error event of `kind`
    pub fn error(kind: CloudErrorKind) -> Self {
        Self {
            error_code: kind,
            detail: String::new(),
            abort: false,
        }
    }

    /// Attach a detail message
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Request an abort of the run
    pub fn with_abort(mut self) -> Self {
        self.abort = true;
        self
    }
}

/// Trait abstracting the reporting service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudReporter: Send + Sync {
    /// Register `run` and return the identifier the service assigned to it
    async fn create_test_run(&self, run: &TestRun) -> Result<String, CloudError>;

    /// Deliver `events` for the run registered as `run_id`
    async fn send_events(&self, run_id: &str, events: &[CloudEvent]) -> Result<(), CloudError>;
}

/// Send `events` and log instead of failing.
///
/// Reporting is best effort: a reconcile pass never fails because the
/// reporting service is unreachable.
pub async fn report_events(reporter: &dyn CloudReporter, run_id: &str, events: &[CloudEvent]) {
    if let Err(e) = reporter.send_events(run_id, events).await {
        error!(test_run_id = %run_id, error = %e, "Failed to send events to cloud");
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTestRunRequest<'a> {
    name: &'a str,
    namespace: &'a str,
    parallelism: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTestRunResponse {
    test_run_id: String,
}

#[derive(Serialize)]
struct EventsRequest<'a> {
    events: &'a [CloudEvent],
}

/// [`CloudReporter`] speaking JSON over HTTP
pub struct HttpCloudReporter {
    http: reqwest::Client,
    host: String,
    token: Option<String>,
}

impl HttpCloudReporter {
    /// Create a reporter for the service at `host`
    pub fn new(
        host: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CloudError::Client)?;
        Ok(Self {
            http,
            host: host.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn post<T: Serialize + Sync>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<reqwest::Response, CloudError> {
        let mut request = self.http.post(url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|source| CloudError::Transport {
            url: url.to_string(),
            source,
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Status {
                url: url.to_string(),
                status,
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl CloudReporter for HttpCloudReporter {
    async fn create_test_run(&self, run: &TestRun) -> Result<String, CloudError> {
        let url = format!("{}/v1/test_runs", self.host);
        let name = run.name_any();
        let namespace = run.namespace().unwrap_or_default();
        let body = CreateTestRunRequest {
            name: &name,
            namespace: &namespace,
            parallelism: run.spec.parallelism,
        };

        let response = self.post(&url, &body).await?;
        let created: CreateTestRunResponse = response
            .json()
            .await
            .map_err(|e| CloudError::InvalidResponse {
                url: url.clone(),
                message: e.to_string(),
            })?;

        info!(
            test_run = %name,
            test_run_id = %created.test_run_id,
            "Registered test run with cloud"
        );
        Ok(created.test_run_id)
    }

    async fn send_events(&self, run_id: &str, events: &[CloudEvent]) -> Result<(), CloudError> {
        let url = format!("{}/v1/test_runs/{}/events", self.host, run_id);
        self.post(&url, &EventsRequest { events }).await?;
        Ok(())
    }
}

/// [`CloudReporter`] that only logs, used when no service is configured
pub struct LogCloudReporter;

#[async_trait]
impl CloudReporter for LogCloudReporter {
    async fn create_test_run(&self, run: &TestRun) -> Result<String, CloudError> {
        let id = run.uid().unwrap_or_else(|| run.name_any());
        info!(
            test_run = %run.name_any(),
            test_run_id = %id,
            "No cloud service configured, using local id"
        );
        Ok(id)
    }

    async fn send_events(&self, run_id: &str, events: &[CloudEvent]) -> Result<(), CloudError> {
        for event in events {
            warn!(
                test_run_id = %run_id,
                error_code = ?event.error_code,
                detail = %event.detail,
                abort = event.abort,
                "Cloud event"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadgrid_common::crd::TestRunSpec;

    #[test]
    fn story_abort_event_builder() {
        let event = CloudEvent::error(CloudErrorKind::SetupError)
            .with_detail("setup function failed: boom")
            .with_abort();
        assert_eq!(event.error_code, CloudErrorKind::SetupError);
        assert!(event.abort);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["errorCode"], "SetupError");
        assert_eq!(json["detail"], "setup function failed: boom");
        assert_eq!(json["abort"], true);
    }

    #[test]
    fn plain_error_event_does_not_abort() {
        let event = CloudEvent::error(CloudErrorKind::OperatorStartError);
        assert!(!event.abort);
        assert!(event.detail.is_empty());
    }

    #[test]
    fn host_trailing_slash_is_trimmed() {
        let reporter =
            HttpCloudReporter::new("https://cloud.example/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(reporter.host, "https://cloud.example");
    }

    #[tokio::test]
    async fn log_reporter_falls_back_to_name_without_uid() {
        let run = TestRun::new("smoke", TestRunSpec::default());
        assert_eq!(LogCloudReporter.create_test_run(&run).await.unwrap(), "smoke");
        assert!(LogCloudReporter
            .send_events("smoke", &[CloudEvent::error(CloudErrorKind::SetupError)])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn report_events_swallows_failures() {
        let mut reporter = MockCloudReporter::new();
        reporter.expect_send_events().times(1).returning(|_, _| {
            Err(CloudError::InvalidResponse {
                url: "https://cloud.example/v1/test_runs/42/events".to_string(),
                message: "expected JSON".to_string(),
            })
        });

        report_events(
            &reporter,
            "42",
            &[CloudEvent::error(CloudErrorKind::OperatorStartError).with_abort()],
        )
        .await;
    }
}
