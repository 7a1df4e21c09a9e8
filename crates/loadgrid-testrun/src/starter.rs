//! Synchronous start of every runner from the operator

use tracing::{error, info};

use crate::agent::AgentClient;
use crate::error::{AgentFailure, TestRunError};

/// Send the start command to every host, in order.
///
/// A failing host does not stop the remaining ones; all failures are
/// reported together.
pub async fn start_agents(agent: &dyn AgentClient, hosts: &[String]) -> Result<(), TestRunError> {
    info!(total = hosts.len(), "Starting runners");

    let mut failures = Vec::new();
    for host in hosts {
        if let Err(e) = agent.start(host).await {
            error!(host = %host, error = %e, "Failed to start runner");
            failures.push(AgentFailure {
                host: host.clone(),
                error: e,
            });
        }
    }

    if failures.is_empty() {
        return Ok(());
    }
    Err(TestRunError::AgentStart {
        failed: failures.len(),
        total: hosts.len(),
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::agent::{AgentError, MockAgentClient};

    fn hosts(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("10.0.0.{}", i)).collect()
    }

    #[tokio::test]
    async fn every_runner_started() {
        let mut agent = MockAgentClient::new();
        agent.expect_start().times(3).returning(|_| Ok(()));

        assert!(start_agents(&agent, &hosts(3)).await.is_ok());
    }

    #[tokio::test]
    async fn story_two_of_five_failing_are_reported_together() {
        let called = Arc::new(Mutex::new(Vec::new()));
        let mut agent = MockAgentClient::new();
        let calls = called.clone();
        agent.expect_start().times(5).returning(move |host| {
            calls.lock().unwrap().push(host.to_string());
            if host == "10.0.0.2" || host == "10.0.0.5" {
                Err(AgentError::Status {
                    host: host.to_string(),
                    status: 500,
                })
            } else {
                Ok(())
            }
        });

        let err = start_agents(&agent, &hosts(5)).await.unwrap_err();
        match &err {
            TestRunError::AgentStart {
                failed,
                total,
                failures,
            } => {
                assert_eq!(*failed, 2);
                assert_eq!(*total, 5);
                let failed_hosts: Vec<&str> = failures.iter().map(|f| f.host.as_str()).collect();
                assert_eq!(failed_hosts, vec!["10.0.0.2", "10.0.0.5"]);
            }
            other => panic!("Expected AgentStart, got {other:?}"),
        }
        assert!(err.to_string().starts_with("failed to start 2/5 agents"));

        // every host, failing or not, got exactly one start command
        let called = called.lock().unwrap();
        for host in hosts(5) {
            assert_eq!(called.iter().filter(|h| **h == host).count(), 1, "{host}");
        }
    }

    #[tokio::test]
    async fn no_hosts_is_success() {
        let agent = MockAgentClient::new();
        assert!(start_agents(&agent, &[]).await.is_ok());
    }
}
