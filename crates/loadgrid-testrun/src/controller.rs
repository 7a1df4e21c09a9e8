//! TestRun reconciliation controller
//!
//! Drives a TestRun through its stages:
//! - `Initialization` → conditions initialized → `Initialized`
//! - `Initialized` → cloud registration, token, conflict check, runners created → `Created`
//! - `Created` → every runner pod running and answering → setup, start → `Started`
//! - `Started` → all runner Jobs completed → `Finished`, or cloud abort → `Stopped`
//! - `Stopped` → all runner Jobs completed → `Finished`
//! - `Finished` / `Error` → nothing left to do
//!
//! Each pass performs at most one stage transition and persists the status
//! with a single merge patch guarded by the observed `resourceVersion`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use loadgrid_common::crd::{ConditionKind, Stage, TestRun, TestRunStatus};
use loadgrid_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use loadgrid_common::{Error, FIELD_MANAGER};

use crate::agent::{AgentClient, HttpAgentClient};
use crate::cloud::{report_events, CloudErrorKind, CloudEvent, CloudReporter, LogCloudReporter};
use crate::dispatch::{DispatchQueue, DispatchRequest, Enqueued};
use crate::error::TestRunError;
use crate::resources::{
    build_starter_job, create_runner_resources, is_job_finished, run_selector, runner_name,
    runner_selector,
};
use crate::starter::start_agents;

#[cfg(test)]
use mockall::automock;

/// Requeue after a stage transition and while waiting for runners
const SHORT_REQUEUE: Duration = Duration::from_secs(1);

/// Requeue while the cloud token Secret is not available
const TOKEN_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue when runners from a previous run may still be terminating
const CONFLICT_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue while runners are executing
const MONITOR_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue after a failed reconcile
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// An existing runner is tolerated this long after initialization
const CONFLICT_GRACE_SECS: i64 = 30;

/// Runners not ready after this long are reported to the cloud
const STUCK_READINESS_SECS: i64 = 5 * 60;

/// Key of the token inside the cloud token Secret
const CLOUD_TOKEN_KEY: &str = "token";

/// Default timeout for runner control API calls
const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Name reported on Kubernetes Events
pub const CONTROLLER_NAME: &str = "loadgrid-testrun-controller";

/// Trait abstracting Kubernetes client operations for TestRuns
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Job, `None` if it does not exist
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error>;

    /// Create a Job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error>;

    /// Create a Service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;

    /// Create a ConfigMap
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> Result<(), Error>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    /// List Services matching a label selector
    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>, Error>;

    /// List Jobs matching a label selector
    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>, Error>;

    /// Get a Secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Merge-patch the status of a TestRun.
    ///
    /// When `resource_version` is set the API server rejects the patch with
    /// 409 if the object changed since it was read.
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &TestRunStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), job).await?;
        Ok(())
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), service).await?;
        Ok(())
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), config_map).await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &TestRunStatus,
    ) -> Result<(), Error> {
        let api: Api<TestRun> = Api::namespaced(self.client.clone(), namespace);

        let mut status_patch = serde_json::json!({
            "status": status
        });
        if let Some(resource_version) = resource_version {
            status_patch["metadata"] = serde_json::json!({ "resourceVersion": resource_version });
        }

        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }
}

/// Controller context shared by every reconcile
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let (queue, receiver) = DispatchQueue::new(1000);
/// let ctx = Context::builder(client, queue)
///     .cloud_reporter(reporter)
///     .build()?;
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Runner control API client
    pub agent: Arc<dyn AgentClient>,
    /// Cloud reporting service
    pub cloud: Arc<dyn CloudReporter>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Process-wide dispatch pool for fire-and-forget runner commands
    pub dispatch: DispatchQueue,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, dispatch: DispatchQueue) -> ContextBuilder {
        ContextBuilder::new(client, dispatch)
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        agent: Arc<dyn AgentClient>,
        cloud: Arc<dyn CloudReporter>,
        dispatch: DispatchQueue,
    ) -> Self {
        Self {
            kube,
            agent,
            cloud,
            events: Arc::new(loadgrid_common::events::NoopEventPublisher),
            dispatch,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    dispatch: DispatchQueue,
    kube: Option<Arc<dyn KubeClient>>,
    agent: Option<Arc<dyn AgentClient>>,
    cloud: Option<Arc<dyn CloudReporter>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client, dispatch: DispatchQueue) -> Self {
        Self {
            client,
            dispatch,
            kube: None,
            agent: None,
            cloud: None,
            events: None,
        }
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the runner control API client
    pub fn agent_client(mut self, agent: Arc<dyn AgentClient>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Set the cloud reporter; defaults to [`LogCloudReporter`]
    pub fn cloud_reporter(mut self, cloud: Arc<dyn CloudReporter>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, TestRunError> {
        let agent: Arc<dyn AgentClient> = match self.agent {
            Some(agent) => agent,
            None => Arc::new(HttpAgentClient::new(DEFAULT_AGENT_TIMEOUT)?),
        };

        Ok(Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            agent,
            cloud: self.cloud.unwrap_or_else(|| Arc::new(LogCloudReporter)),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            dispatch: self.dispatch,
        })
    }
}

/// Error policy for the TestRun controller.
///
/// Logs the error and requeues for retry after 30 seconds.
pub fn error_policy(run: Arc<TestRun>, error: &TestRunError, _ctx: Arc<Context>) -> Action {
    warn!(test_run = %run.name_any(), error = %error, "TestRun reconcile error, will retry");
    Action::requeue(ERROR_REQUEUE)
}

/// Reconcile a TestRun through one step of its lifecycle.
#[instrument(skip(run, ctx), fields(test_run = %run.name_any()))]
pub async fn reconcile(run: Arc<TestRun>, ctx: Arc<Context>) -> Result<Action, TestRunError> {
    let stage = run.stage();
    if !run.test_run_id().is_empty() {
        debug!(test_run_id = %run.test_run_id(), "Cloud-backed run");
    }
    info!(%stage, "Reconciling TestRun");

    let result = match stage {
        Stage::Initialization => reconcile_initialization(&run, &ctx).await,
        Stage::Initialized => reconcile_initialized(&run, &ctx).await,
        Stage::Created => reconcile_created(&run, &ctx).await,
        Stage::Started => reconcile_started(&run, &ctx).await,
        Stage::Stopped => reconcile_completion(&run, &ctx).await,
        Stage::Finished | Stage::Error => Ok(Action::await_change()),
    };

    match result {
        Err(TestRunError::StatusConflict(_)) => {
            debug!("TestRun changed during reconcile, retrying");
            Ok(Action::requeue(SHORT_REQUEUE))
        }
        other => other,
    }
}

/// Initialization: set every condition to its starting value.
async fn reconcile_initialization(run: &TestRun, ctx: &Context) -> Result<Action, TestRunError> {
    let mut status = run.status.clone().unwrap_or_default();
    let now = Utc::now();

    if let Err(message) = run.spec.validate() {
        warn!(%message, "Invalid TestRun spec");
        status.stage = Stage::Error;
        status.message = Some(message);
        persist(ctx, run, &status).await?;
        return Ok(Action::await_change());
    }

    let conditions = &mut status.conditions;
    conditions.set(ConditionKind::Running, false, now);
    conditions.set(ConditionKind::CloudTestRun, run.is_cloud(), now);
    conditions.set(
        ConditionKind::CloudPlzTestRun,
        run.spec.private_load_zone,
        now,
    );
    if run.is_cloud() {
        conditions.set(ConditionKind::CloudTestRunCreated, false, now);
    }
    conditions.set(ConditionKind::CloudTestRunAborted, false, now);

    status.stage = Stage::Initialized;
    status.message = None;
    persist(ctx, run, &status).await?;

    info!(cloud = run.is_cloud(), "TestRun initialized");
    Ok(Action::requeue(SHORT_REQUEUE))
}

/// Initialized: register with the cloud, then create every runner.
async fn reconcile_initialized(run: &TestRun, ctx: &Context) -> Result<Action, TestRunError> {
    let name = run.name_any();
    let namespace = run.namespace().ok_or(TestRunError::MissingNamespace)?;
    let mut status = run.status.clone().unwrap_or_default();
    let now = Utc::now();

    let mut token = None;
    if let Some(secret_name) = &run.spec.token {
        if !status.conditions.is_true(ConditionKind::CloudTestRunCreated) {
            let test_run_id = ctx.cloud.create_test_run(run).await?;
            info!(test_run_id = %test_run_id, "Registered cloud test run");
            status.test_run_id = Some(test_run_id);
            status
                .conditions
                .set(ConditionKind::CloudTestRunCreated, true, now);
            persist(ctx, run, &status).await?;
            return Ok(Action::requeue(SHORT_REQUEUE));
        }

        match load_token(ctx, &namespace, secret_name).await {
            Ok(Some(loaded)) => token = Some(loaded),
            Ok(None) => {
                info!(secret = %secret_name, "Cloud token not ready yet");
                return Ok(Action::requeue(TOKEN_REQUEUE));
            }
            Err(e) => {
                error!(secret = %secret_name, error = %e, "Failed to load cloud token");
                return Ok(Action::await_change());
            }
        }
    }

    let first_runner = runner_name(&name, 1);
    let conflict = match ctx.kube.get_job(&namespace, &first_runner).await {
        Ok(None) => false,
        Ok(Some(_)) => true,
        Err(e) => {
            warn!(runner = %first_runner, error = %e, "Could not check for existing runner");
            true
        }
    };
    if conflict {
        let within_grace = status.conditions.is_unknown(ConditionKind::CloudTestRun)
            || status
                .conditions
                .since_transition(ConditionKind::CloudTestRun, now)
                .map_or(true, |elapsed| elapsed.num_seconds() <= CONFLICT_GRACE_SECS);

        if within_grace {
            info!(runner = %first_runner, "Runner from a previous run still exists, waiting");
            return Ok(Action::requeue(CONFLICT_REQUEUE));
        }

        publish(
            ctx,
            run,
            EventType::Warning,
            reasons::STALE_RUNNER,
            actions::CREATE,
            Some(format!("runner {} already exists", first_runner)),
        )
        .await;
        report_abort(
            ctx,
            run,
            &status,
            CloudErrorKind::OperatorStartError,
            format!(
                "runner {} already exists; delete the previous run",
                first_runner
            ),
        )
        .await;
        return Err(TestRunError::StaleRunner {
            runner: first_runner,
        });
    }

    if let Err(e) = create_runner_resources(ctx.kube.as_ref(), run, token.as_deref()).await {
        error!(error = %e, "Failed to create runner resources");
        report_abort(
            ctx,
            run,
            &status,
            CloudErrorKind::OperatorStartError,
            format!("failed to create runner resources: {}", e),
        )
        .await;
        return Err(e);
    }

    publish(
        ctx,
        run,
        EventType::Normal,
        reasons::RUNNERS_CREATED,
        actions::CREATE,
        Some(format!("created {} runners", run.spec.parallelism)),
    )
    .await;

    status.stage = Stage::Created;
    persist(ctx, run, &status).await?;
    Ok(Action::requeue(SHORT_REQUEUE))
}

/// Created: wait for every runner, then set up and start them together.
async fn reconcile_created(run: &TestRun, ctx: &Context) -> Result<Action, TestRunError> {
    let name = run.name_any();
    let namespace = run.namespace().ok_or(TestRunError::MissingNamespace)?;
    let mut status = run.status.clone().unwrap_or_default();
    let now = Utc::now();
    let total = run.spec.parallelism as usize;

    let pods = match ctx.kube.list_pods(&namespace, &runner_selector(&name)).await {
        Ok(pods) => pods,
        Err(e) => {
            error!(error = %e, "Could not list runner pods");
            return Ok(Action::requeue(SHORT_REQUEUE));
        }
    };
    let running: Vec<&Pod> = pods.iter().filter(|pod| is_pod_running(pod)).collect();
    info!(ready = running.len(), total, "Waiting for runner pods");

    if running.len() != total {
        let waited = status
            .conditions
            .since_transition(ConditionKind::Running, now)
            .ok_or(TestRunError::MissingCondition(ConditionKind::Running))?;

        if waited.num_seconds() > STUCK_READINESS_SECS {
            let message = format!(
                "runner pods are not ready after {} minutes, check runner jobs and pods",
                STUCK_READINESS_SECS / 60
            );
            warn!(ready = running.len(), total, "{}", message);
            report_abort(ctx, run, &status, CloudErrorKind::OperatorStartError, message).await;
        }
        return Ok(Action::requeue(SHORT_REQUEUE));
    }

    let hosts = resolve_hosts(ctx, run, &namespace, &running).await?;
    if hosts.len() != total {
        info!(ready = hosts.len(), total, "Waiting for runner services");
        return Ok(Action::requeue(SHORT_REQUEUE));
    }

    let probes = join_all(hosts.iter().map(|host| ctx.agent.probe_status(host))).await;
    let answering = probes.into_iter().filter(|ready| *ready).count();
    if answering != total {
        info!(ready = answering, total, "Waiting for runners to answer status probes");
        return Ok(Action::requeue(SHORT_REQUEUE));
    }

    publish(
        ctx,
        run,
        EventType::Normal,
        reasons::RUNNERS_READY,
        actions::START,
        None,
    )
    .await;

    if status.conditions.is_true(ConditionKind::CloudPlzTestRun) {
        if let Err(e) = ctx.agent.setup(&hosts).await {
            if e.is_retryable() {
                return Err(TestRunError::Setup(e));
            }

            error!(error = %e, "Setup function failed, requesting abort");
            let message = format!("setup function failed: {}", e);
            report_abort(ctx, run, &status, CloudErrorKind::SetupError, message.clone()).await;
            status.stage = Stage::Error;
            status.message = Some(message);
            persist(ctx, run, &status).await?;
            return Ok(Action::await_change());
        }
    }

    if run.spec.use_legacy_starter {
        let starter = build_starter_job(run, &hosts)?;
        match ctx.kube.create_job(&namespace, &starter).await {
            Ok(()) => info!("Created starter Job"),
            Err(e) if e.is_conflict() => debug!("Starter Job already exists"),
            Err(e) => {
                error!(error = %e, "Failed to launch starter Job");
                return Ok(Action::requeue(SHORT_REQUEUE));
            }
        }
    } else if let Err(e) = start_agents(ctx.agent.as_ref(), &hosts).await {
        error!(error = %e, "Failed to start runners from the operator");
        publish(
            ctx,
            run,
            EventType::Warning,
            reasons::START_FAILED,
            actions::START,
            Some(e.to_string()),
        )
        .await;
        return Ok(Action::requeue(SHORT_REQUEUE));
    }

    status.stage = Stage::Started;
    status.conditions.set(ConditionKind::Running, true, now);
    persist(ctx, run, &status).await?;

    publish(
        ctx,
        run,
        EventType::Normal,
        reasons::TEST_STARTED,
        actions::START,
        Some(format!("started {} runners", total)),
    )
    .await;
    Ok(Action::requeue(MONITOR_REQUEUE))
}

/// Started: stop on cloud abort, otherwise watch for completion.
async fn reconcile_started(run: &TestRun, ctx: &Context) -> Result<Action, TestRunError> {
    let mut status = run.status.clone().unwrap_or_default();
    if !status.conditions.is_true(ConditionKind::CloudTestRunAborted) {
        return reconcile_completion(run, ctx).await;
    }

    let name = run.name_any();
    let namespace = run.namespace().ok_or(TestRunError::MissingNamespace)?;

    let pods = ctx.kube.list_pods(&namespace, &runner_selector(&name)).await?;
    let running: Vec<&Pod> = pods.iter().filter(|pod| is_pod_running(pod)).collect();
    let hosts = resolve_hosts(ctx, run, &namespace, &running).await?;

    let shed = hosts
        .iter()
        .map(|host| ctx.dispatch.enqueue(DispatchRequest::stop(&namespace, &name, host)))
        .filter(|outcome| *outcome != Enqueued::Queued)
        .count();
    info!(hosts = hosts.len(), shed, "Cloud requested abort, queued stop commands");

    publish(
        ctx,
        run,
        EventType::Normal,
        reasons::TEST_STOPPED,
        actions::STOP,
        Some("aborted by cloud".to_string()),
    )
    .await;

    status.stage = Stage::Stopped;
    persist(ctx, run, &status).await?;
    Ok(Action::requeue(MONITOR_REQUEUE))
}

/// Started or Stopped: finish once every runner Job has completed.
async fn reconcile_completion(run: &TestRun, ctx: &Context) -> Result<Action, TestRunError> {
    let name = run.name_any();
    let namespace = run.namespace().ok_or(TestRunError::MissingNamespace)?;
    let total = run.spec.parallelism as usize;

    let jobs = ctx.kube.list_jobs(&namespace, &runner_selector(&name)).await?;
    let finished = jobs.iter().filter(|job| is_job_finished(job)).count();
    if finished < total {
        debug!(finished, total, "Runners still executing");
        return Ok(Action::requeue(MONITOR_REQUEUE));
    }

    let mut status = run.status.clone().unwrap_or_default();
    status.stage = Stage::Finished;
    status
        .conditions
        .set(ConditionKind::Running, false, Utc::now());
    persist(ctx, run, &status).await?;

    info!("All runners completed");
    publish(
        ctx,
        run,
        EventType::Normal,
        reasons::TEST_FINISHED,
        actions::RECONCILE,
        None,
    )
    .await;
    Ok(Action::await_change())
}

fn is_pod_running(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

/// Addresses of the runners: pod IPs, or the ClusterIPs of their Services.
async fn resolve_hosts(
    ctx: &Context,
    run: &TestRun,
    namespace: &str,
    running: &[&Pod],
) -> Result<Vec<String>, TestRunError> {
    if run.spec.use_direct_pod_ips {
        let mut hosts: Vec<String> = running
            .iter()
            .filter_map(|pod| pod.status.as_ref()?.pod_ip.clone())
            .collect();
        hosts.sort();
        return Ok(hosts);
    }

    let services = ctx
        .kube
        .list_services(namespace, &run_selector(&run.name_any()))
        .await?;
    Ok(services
        .iter()
        .filter_map(|svc| svc.spec.as_ref()?.cluster_ip.clone())
        .filter(|ip| !ip.is_empty() && ip != "None")
        .collect())
}

/// Read the cloud token; `None` until the Secret and its key exist.
async fn load_token(
    ctx: &Context,
    namespace: &str,
    secret_name: &str,
) -> Result<Option<String>, TestRunError> {
    let Some(secret) = ctx.kube.get_secret(namespace, secret_name).await? else {
        return Ok(None);
    };
    let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(CLOUD_TOKEN_KEY)) else {
        return Ok(None);
    };
    let token = String::from_utf8(bytes.0.clone()).map_err(|_| {
        Error::validation_for(secret_name, "cloud token is not valid UTF-8")
    })?;
    Ok((!token.is_empty()).then_some(token))
}

async fn persist(ctx: &Context, run: &TestRun, status: &TestRunStatus) -> Result<(), TestRunError> {
    let name = run.name_any();
    let namespace = run.namespace().ok_or(TestRunError::MissingNamespace)?;
    match ctx
        .kube
        .patch_status(&namespace, &name, run.resource_version(), status)
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.is_conflict() => Err(TestRunError::StatusConflict(name)),
        Err(e) => Err(e.into()),
    }
}

async fn publish(
    ctx: &Context,
    run: &TestRun,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    ctx.events
        .publish(&run.object_ref(&()), type_, reason, action, note)
        .await;
}

/// Ask the cloud to abort a cloud-backed run. No-op for local runs.
async fn report_abort(
    ctx: &Context,
    run: &TestRun,
    status: &TestRunStatus,
    kind: CloudErrorKind,
    detail: String,
) {
    if !status.conditions.is_true(ConditionKind::CloudTestRun) {
        return;
    }
    let test_run_id = status.test_run_id.as_deref().unwrap_or_default();
    let event = CloudEvent::error(kind).with_detail(detail).with_abort();
    debug!(test_run = %run.name_any(), test_run_id, "Reporting abort to cloud");
    report_events(ctx.cloud.as_ref(), test_run_id, &[event]).await;
}
