//! Bounded dispatch pool for runner commands
//!
//! The reconcile loop must never wait on a slow runner. Commands are handed to
//! a bounded queue with a non-blocking send and a fixed set of workers drains
//! it. When the queue is full the request is shed and the caller is told so;
//! nothing blocks and nothing is retried here.
//!
//! The pool is created once per process and shared through the controller
//! context:
//!
//! ```text
//! let (queue, receiver) = DispatchQueue::new(1000);
//! let workers = receiver.spawn_workers(10, Arc::new(agent));
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{status_url, AgentError, HttpAgentClient, StatusCommand};

/// One HTTP call to one runner
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchRequest {
    /// Namespace of the owning TestRun
    pub namespace: String,
    /// Full target URL
    pub url: String,
    /// HTTP method
    pub method: Method,
    /// JSON body
    pub payload: serde_json::Value,
    /// Name of the owning TestRun
    pub test_run_name: String,
    /// Runner host, kept for logging
    pub host: String,
}

impl DispatchRequest {
    fn status_patch(
        namespace: &str,
        test_run_name: &str,
        host: &str,
        command: StatusCommand,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            url: status_url(host),
            method: Method::PATCH,
            payload: command.to_value(),
            test_run_name: test_run_name.to_string(),
            host: host.to_string(),
        }
    }

    /// Resume the runner on `host`
    pub fn start(namespace: &str, test_run_name: &str, host: &str) -> Self {
        Self::status_patch(namespace, test_run_name, host, StatusCommand::start())
    }

    /// Stop the runner on `host`
    pub fn stop(namespace: &str, test_run_name: &str, host: &str) -> Self {
        Self::status_patch(namespace, test_run_name, host, StatusCommand::stop())
    }
}

/// Outcome of [`DispatchQueue::enqueue`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// Accepted; a worker will pick it up
    Queued,
    /// Queue was full; the request was dropped
    Shed,
    /// Workers are gone; the request was dropped
    Closed,
}

/// Executes dispatch requests on behalf of the workers
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Perform one request
    async fn dispatch(&self, req: &DispatchRequest) -> Result<(), AgentError>;
}

#[async_trait]
impl Dispatcher for HttpAgentClient {
    async fn dispatch(&self, req: &DispatchRequest) -> Result<(), AgentError> {
        self.send(&req.host, req.method.clone(), &req.url, Some(&req.payload))
            .await
            .map(|_| ())
    }
}

/// Sending half of the pool
#[derive(Clone, Debug)]
pub struct DispatchQueue {
    tx: mpsc::Sender<DispatchRequest>,
}

/// Receiving half of the pool, consumed by [`DispatchReceiver::spawn_workers`]
#[derive(Debug)]
pub struct DispatchReceiver {
    rx: mpsc::Receiver<DispatchRequest>,
}

impl DispatchQueue {
    /// Create a queue holding at most `capacity` pending requests
    pub fn new(capacity: usize) -> (DispatchQueue, DispatchReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (DispatchQueue { tx }, DispatchReceiver { rx })
    }

    /// Hand `req` to the workers without waiting
    pub fn enqueue(&self, req: DispatchRequest) -> Enqueued {
        match self.tx.try_send(req) {
            Ok(()) => Enqueued::Queued,
            Err(mpsc::error::TrySendError::Full(req)) => {
                warn!(
                    test_run = %req.test_run_name,
                    namespace = %req.namespace,
                    url = %req.url,
                    "Dispatch queue is full, dropping request"
                );
                Enqueued::Shed
            }
            Err(mpsc::error::TrySendError::Closed(req)) => {
                warn!(
                    test_run = %req.test_run_name,
                    url = %req.url,
                    "Dispatch queue is closed, dropping request"
                );
                Enqueued::Closed
            }
        }
    }
}

impl DispatchReceiver {
    /// Start `workers` tasks draining the queue through `dispatcher`.
    ///
    /// Workers exit once every [`DispatchQueue`] handle has been dropped and
    /// the queue is empty.
    pub fn spawn_workers(
        self,
        workers: usize,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(self.rx));
        info!(workers, "Starting dispatch workers");

        (0..workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    loop {
                        // lock only while waiting so other workers can dispatch concurrently
                        let next = rx.lock().await.recv().await;
                        let Some(req) = next else {
                            debug!(worker, "Dispatch queue closed, worker exiting");
                            break;
                        };
                        match dispatcher.dispatch(&req).await {
                            Ok(()) => debug!(
                                worker,
                                test_run = %req.test_run_name,
                                url = %req.url,
                                "Dispatched request"
                            ),
                            Err(e) => warn!(
                                worker,
                                test_run = %req.test_run_name,
                                namespace = %req.namespace,
                                url = %req.url,
                                error = %e,
                                "Dispatch failed"
                            ),
                        }
                    }
                })
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<DispatchRequest> {
        self.rx.try_recv().ok()
    }
}
