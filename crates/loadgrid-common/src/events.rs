//! Kubernetes Event recording for the TestRun controller.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`.
    ///
    /// * `reason` - machine-readable reason (see [`reasons`])
    /// * `action` - what the controller was doing (see [`actions`])
    /// * `note` - optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event. Used in tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons emitted on TestRuns.
pub mod reasons {
    /// All runner jobs (and services) were created
    pub const RUNNERS_CREATED: &str = "RunnersCreated";
    /// Every runner answered its status probe
    pub const RUNNERS_READY: &str = "RunnersReady";
    /// Start command delivered to every runner
    pub const TEST_STARTED: &str = "TestStarted";
    /// Stop command queued for every runner
    pub const TEST_STOPPED: &str = "TestStopped";
    /// All runner jobs completed
    pub const TEST_FINISHED: &str = "TestFinished";
    /// Starting one or more runners failed
    pub const START_FAILED: &str = "StartFailed";
    /// A runner from an earlier run still exists
    pub const STALE_RUNNER: &str = "StaleRunner";
}

/// Event actions emitted on TestRuns.
pub mod actions {
    /// Creating runner resources
    pub const CREATE: &str = "Create";
    /// Starting runners
    pub const START: &str = "Start";
    /// Stopping runners
    pub const STOP: &str = "Stop";
    /// Standard reconciliation
    pub const RECONCILE: &str = "Reconcile";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::STALE_RUNNER,
                actions::CREATE,
                Some("runner smoke-1 exists".to_string()),
            )
            .await;
    }
}
