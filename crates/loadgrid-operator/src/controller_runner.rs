//! Controller runner - builds the TestRun controller future

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use loadgrid_common::crd::TestRun;
use loadgrid_testrun::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the TestRun controller future
///
/// Runner Jobs are owned by their TestRun, so a Job finishing triggers a
/// reconcile of its owner without waiting for the monitoring requeue.
pub fn build_testrun_controller(
    client: Client,
    ctx: Arc<Context>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let runs: Api<TestRun> = Api::all(client.clone());
    let jobs: Api<Job> = Api::all(client);

    tracing::info!("- TestRun controller");

    Box::pin(
        Controller::new(runs, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .owns(
                jobs,
                WatcherConfig::default()
                    .timeout(WATCH_TIMEOUT_SECS)
                    .labels(&format!(
                        "{}={}",
                        loadgrid_common::LABEL_APP,
                        loadgrid_common::LABEL_APP_VALUE
                    )),
            )
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("TestRun")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
