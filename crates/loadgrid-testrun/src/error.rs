//! TestRun controller error types

use loadgrid_common::crd::ConditionKind;

use crate::agent::AgentError;
use crate::cloud::CloudError;
use crate::segmentation::SegmentError;

/// One runner that refused the start command
#[derive(Debug)]
pub struct AgentFailure {
    /// Host the command was sent to
    pub host: String,
    /// What went wrong
    pub error: AgentError,
}

#[derive(Debug, thiserror::Error)]
pub enum TestRunError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Common(#[from] loadgrid_common::Error),

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error("runner {runner} from an earlier run still exists")]
    StaleRunner { runner: String },

    #[error("failed to start {failed}/{total} agents: {}", render_failures(.failures))]
    AgentStart {
        failed: usize,
        total: usize,
        failures: Vec<AgentFailure>,
    },

    #[error("setup failed: {0}")]
    Setup(#[source] AgentError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("status of {0} changed during reconcile")]
    StatusConflict(String),

    #[error("cloud reporter error: {0}")]
    Cloud(#[from] CloudError),

    #[error("missing namespace on TestRun")]
    MissingNamespace,

    #[error("missing uid on TestRun")]
    MissingUid,

    #[error("cannot find condition {0}")]
    MissingCondition(ConditionKind),
}

fn render_failures(failures: &[AgentFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.host, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn story_aggregate_start_error_names_every_failed_host() {
        let err = TestRunError::AgentStart {
            failed: 2,
            total: 5,
            failures: vec![
                AgentFailure {
                    host: "10.0.0.2".to_string(),
                    error: AgentError::Status {
                        host: "10.0.0.2".to_string(),
                        status: 500,
                    },
                },
                AgentFailure {
                    host: "10.0.0.4".to_string(),
                    error: AgentError::Status {
                        host: "10.0.0.4".to_string(),
                        status: 503,
                    },
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("failed to start 2/5 agents: "));
        assert!(msg.contains("10.0.0.2: "));
        assert!(msg.contains("; 10.0.0.4: "));
    }

    #[test]
    fn missing_condition_names_the_kind() {
        let err = TestRunError::MissingCondition(ConditionKind::Running);
        assert_eq!(err.to_string(), "cannot find condition Running");
    }
}
