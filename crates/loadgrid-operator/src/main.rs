//! loadgrid operator - distributed, segmented load tests on Kubernetes

mod controller_runner;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use loadgrid_common::crd::TestRun;
use loadgrid_common::telemetry::{init_telemetry, TelemetryConfig};
use loadgrid_common::FIELD_MANAGER;
use loadgrid_testrun::agent::HttpAgentClient;
use loadgrid_testrun::cloud::{CloudReporter, HttpCloudReporter, LogCloudReporter};
use loadgrid_testrun::dispatch::DispatchQueue;
use loadgrid_testrun::Context;

/// loadgrid - run k6 load tests split across parallel runners
#[derive(Parser, Debug)]
#[command(name = "loadgrid-operator", version, about, long_about = None)]
struct Cli {
    /// Print the TestRun CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Number of workers sending fire-and-forget runner commands
    #[arg(long, env = "LOADGRID_DISPATCH_WORKERS", default_value_t = 10)]
    dispatch_workers: usize,

    /// Pending runner commands held before new ones are shed
    #[arg(long, env = "LOADGRID_DISPATCH_QUEUE", default_value_t = 1000)]
    dispatch_queue_capacity: usize,

    /// Base URL of the cloud reporting service; events are only logged when unset
    #[arg(long, env = "LOADGRID_CLOUD_HOST")]
    cloud_host: Option<String>,

    /// Bearer token for the cloud reporting service
    #[arg(long, env = "LOADGRID_CLOUD_TOKEN", hide_env_values = true)]
    cloud_token: Option<String>,

    /// Timeout for calls to runner control APIs and the cloud service
    #[arg(long, env = "LOADGRID_AGENT_TIMEOUT_SECS", default_value_t = 10)]
    agent_timeout_secs: u64,

    /// Do not install or update the TestRun CRD on startup
    #[arg(long, env = "LOADGRID_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&TestRun::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    run_controller(cli).await
}

/// Install or update the TestRun CRD using server-side apply
///
/// This keeps the CRD version in step with the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing TestRun CRD...");
    crds.patch(
        "testruns.loadgrid.dev",
        &params,
        &Patch::Apply(&TestRun::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install TestRun CRD: {}", e))?;

    Ok(())
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Starting loadgrid operator");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if !cli.skip_crd_install {
        ensure_crd_installed(&client).await?;
    }

    let timeout = Duration::from_secs(cli.agent_timeout_secs);
    let agent = Arc::new(
        HttpAgentClient::new(timeout)
            .map_err(|e| anyhow::anyhow!("Failed to create agent client: {}", e))?,
    );

    let cloud: Arc<dyn CloudReporter> = match cli.cloud_host {
        Some(host) => {
            tracing::info!(cloud_host = %host, "Reporting to cloud service");
            Arc::new(
                HttpCloudReporter::new(host, cli.cloud_token, timeout)
                    .map_err(|e| anyhow::anyhow!("Failed to create cloud reporter: {}", e))?,
            )
        }
        None => {
            tracing::info!("No cloud service configured, cloud events are only logged");
            Arc::new(LogCloudReporter)
        }
    };

    let (queue, receiver) = DispatchQueue::new(cli.dispatch_queue_capacity);
    let workers = receiver.spawn_workers(cli.dispatch_workers, agent.clone());

    let ctx = Context::builder(client.clone(), queue)
        .agent_client(agent)
        .cloud_reporter(cloud)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build controller context: {}", e))?;

    tracing::info!(
        dispatch_workers = cli.dispatch_workers,
        dispatch_queue_capacity = cli.dispatch_queue_capacity,
        "Starting controllers:"
    );
    controller_runner::build_testrun_controller(client, Arc::new(ctx)).await;

    // the controller owned the last queue handle; let workers finish what is queued
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "Dispatch worker panicked");
        }
    }

    tracing::info!("loadgrid operator shut down");
    Ok(())
}
