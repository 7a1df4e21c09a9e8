//! Runner resource construction
//!
//! Builds the objects a TestRun fans out into:
//! - one ConfigMap `<run>` holding the shared segment sequence (parallelism > 1)
//! - one runner Job `<run>-<i>` per segment, started paused
//! - one Service `<run>-<i>` per runner unless runners are addressed by pod IP
//! - the legacy starter Job `<run>-starter`
//!
//! Every object carries a controller owner reference to the TestRun so it is
//! garbage-collected with it.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use tracing::info;

use loadgrid_common::crd::TestRun;
use loadgrid_common::{
    AGENT_CONTROL_PORT, LABEL_APP, LABEL_APP_VALUE, LABEL_RUNNER, LABEL_RUN_OWNER, LABEL_STARTER,
};

use crate::agent::{status_url, StatusCommand};
use crate::controller::KubeClient;
use crate::error::TestRunError;
use crate::segmentation::{segment_flag, segment_sequence};

/// Label carrying the runner index, used to select a single runner pod
pub const LABEL_RUNNER_INDEX: &str = "runner-index";

/// Key of the segment sequence inside the shared ConfigMap
pub const SEGMENT_CONFIG_KEY: &str = "config.json";

/// Environment variable carrying the cloud token into runners
pub const CLOUD_TOKEN_ENV: &str = "K6_CLOUD_TOKEN";

const SCRIPT_VOLUME: &str = "script";
const SCRIPT_MOUNT_PATH: &str = "/test";
const SEGMENT_VOLUME: &str = "segments";
const SEGMENT_MOUNT_PATH: &str = "/loadgrid";

/// Name of runner `index` of `run_name`
pub fn runner_name(run_name: &str, index: u32) -> String {
    format!("{}-{}", run_name, index)
}

/// Name of the legacy starter Job
pub fn starter_name(run_name: &str) -> String {
    format!("{}-starter", run_name)
}

/// Labels carried by every object derived from `run_name`
pub fn run_labels(run_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), LABEL_APP_VALUE.to_string()),
        (LABEL_RUN_OWNER.to_string(), run_name.to_string()),
    ])
}

/// Label selector matching every runner pod or Job of `run_name`
pub fn runner_selector(run_name: &str) -> String {
    format!(
        "{}={},{}={},{}=true",
        LABEL_APP, LABEL_APP_VALUE, LABEL_RUN_OWNER, run_name, LABEL_RUNNER
    )
}

/// Label selector matching every object derived from `run_name`
pub fn run_selector(run_name: &str) -> String {
    format!(
        "{}={},{}={}",
        LABEL_APP, LABEL_APP_VALUE, LABEL_RUN_OWNER, run_name
    )
}

fn runner_labels(run_name: &str, index: u32) -> BTreeMap<String, String> {
    let mut labels = run_labels(run_name);
    labels.insert(LABEL_RUNNER.to_string(), "true".to_string());
    labels.insert(LABEL_RUNNER_INDEX.to_string(), index.to_string());
    labels
}

fn owner_reference(run: &TestRun) -> Result<OwnerReference, TestRunError> {
    run.controller_owner_ref(&()).ok_or(TestRunError::MissingUid)
}

fn metadata(
    run: &TestRun,
    name: String,
    labels: BTreeMap<String, String>,
) -> Result<ObjectMeta, TestRunError> {
    Ok(ObjectMeta {
        name: Some(name),
        namespace: Some(run.namespace().ok_or(TestRunError::MissingNamespace)?),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(run)?]),
        ..Default::default()
    })
}

/// Shared segment sequence ConfigMap, `None` for a single runner
pub fn build_segment_config_map(run: &TestRun) -> Result<Option<ConfigMap>, TestRunError> {
    let Some(sequence) = segment_sequence(run.spec.parallelism) else {
        return Ok(None);
    };
    let config = serde_json::json!({ "executionSegmentSequence": sequence });

    Ok(Some(ConfigMap {
        metadata: metadata(run, run.name_any(), run_labels(&run.name_any()))?,
        data: Some(BTreeMap::from([(
            SEGMENT_CONFIG_KEY.to_string(),
            serde_json::to_string(&config)?,
        )])),
        ..Default::default()
    }))
}

fn runner_command(run: &TestRun, index: u32) -> Result<Vec<String>, TestRunError> {
    let total = run.spec.parallelism;
    let name = runner_name(&run.name_any(), index);

    let mut command = vec![
        "k6".to_string(),
        "run".to_string(),
        format!("--address=0.0.0.0:{}", AGENT_CONTROL_PORT),
        "--paused".to_string(),
        "--tag".to_string(),
        format!("instance_id={}", index),
        "--tag".to_string(),
        format!("job_name={}", name),
    ];
    if let Some(arguments) = &run.spec.arguments {
        command.extend(arguments.split_whitespace().map(str::to_string));
    }
    command.push(segment_flag(index, total)?);
    if total > 1 {
        command.push(format!("--config={}/{}", SEGMENT_MOUNT_PATH, SEGMENT_CONFIG_KEY));
    }
    command.push(format!("{}/{}", SCRIPT_MOUNT_PATH, run.spec.script.file));
    Ok(command)
}

/// Runner Job for `index`, started paused and waiting for a start command.
///
/// `token` is injected as [`CLOUD_TOKEN_ENV`] when present. `segment_config`
/// is the shared ConfigMap built by [`build_segment_config_map`].
pub fn build_runner_job(
    run: &TestRun,
    index: u32,
    token: Option<&str>,
    segment_config: Option<&ConfigMap>,
) -> Result<Job, TestRunError> {
    let run_name = run.name_any();
    let name = runner_name(&run_name, index);
    let labels = runner_labels(&run_name, index);
    let runner = &run.spec.runner;

    let mut env = runner.env.clone();
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        env.push(EnvVar {
            name: CLOUD_TOKEN_ENV.to_string(),
            value: Some(token.to_string()),
            ..Default::default()
        });
    }

    let mut volume_mounts = vec![VolumeMount {
        name: SCRIPT_VOLUME.to_string(),
        mount_path: SCRIPT_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    }];
    let mut volumes = vec![Volume {
        name: SCRIPT_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: run.spec.script.config_map.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }];
    if let Some(config_map) = segment_config {
        volume_mounts.push(VolumeMount {
            name: SEGMENT_VOLUME.to_string(),
            mount_path: SEGMENT_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(Volume {
            name: SEGMENT_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.name_any(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let container = Container {
        name: "k6".to_string(),
        image: Some(runner.image().to_string()),
        image_pull_policy: runner.image_pull_policy.clone(),
        command: Some(runner_command(run, index)?),
        env: (!env.is_empty()).then_some(env),
        ports: Some(vec![ContainerPort {
            container_port: i32::from(AGENT_CONTROL_PORT),
            name: Some("http-api".to_string()),
            ..Default::default()
        }]),
        resources: runner.resources.clone(),
        security_context: runner.security_context.clone(),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    Ok(Job {
        metadata: metadata(run, name.clone(), labels.clone())?,
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    hostname: Some(name),
                    containers: vec![container],
                    volumes: Some(volumes),
                    restart_policy: Some("Never".to_string()),
                    service_account_name: runner.service_account_name.clone(),
                    node_selector: (!runner.node_selector.is_empty())
                        .then(|| runner.node_selector.clone()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// ClusterIP Service exposing the control port of runner `index`
pub fn build_runner_service(run: &TestRun, index: u32) -> Result<Service, TestRunError> {
    let run_name = run.name_any();
    let selector = runner_labels(&run_name, index);

    Ok(Service {
        metadata: metadata(run, runner_name(&run_name, index), run_labels(&run_name))?,
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("http-api".to_string()),
                port: i32::from(AGENT_CONTROL_PORT),
                target_port: Some(IntOrString::Int(i32::from(AGENT_CONTROL_PORT))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Legacy starter Job resuming every runner in `hosts` with curl
pub fn build_starter_job(run: &TestRun, hosts: &[String]) -> Result<Job, TestRunError> {
    let run_name = run.name_any();
    let mut labels = run_labels(&run_name);
    labels.insert(LABEL_STARTER.to_string(), "true".to_string());
    let starter = &run.spec.starter;

    let payload = serde_json::to_string(&StatusCommand::start())?;
    let script = hosts
        .iter()
        .map(|host| {
            format!(
                "curl --retry 3 -X PATCH -H 'Content-Type: application/json' {} -d '{}'",
                status_url(host),
                payload
            )
        })
        .collect::<Vec<_>>()
        .join(" && ");

    let container = Container {
        name: "k6-curl".to_string(),
        image: Some(starter.image().to_string()),
        image_pull_policy: starter.image_pull_policy.clone(),
        command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
        resources: starter.resources.clone(),
        security_context: starter.security_context.clone(),
        ..Default::default()
    };

    Ok(Job {
        metadata: metadata(run, starter_name(&run_name), labels.clone())?,
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Create the segment ConfigMap, then each runner Job and its Service in
/// index order.
///
/// Stops at the first failure without removing what was already created.
pub async fn create_runner_resources(
    kube: &dyn KubeClient,
    run: &TestRun,
    token: Option<&str>,
) -> Result<(), TestRunError> {
    let namespace = run.namespace().ok_or(TestRunError::MissingNamespace)?;
    let run_name = run.name_any();

    let segment_config = build_segment_config_map(run)?;
    if let Some(config_map) = &segment_config {
        kube.create_config_map(&namespace, config_map).await?;
        info!(test_run = %run_name, "Created segment ConfigMap");
    }

    for index in 1..=run.spec.parallelism {
        let job = build_runner_job(run, index, token, segment_config.as_ref())?;
        kube.create_job(&namespace, &job).await?;
        info!(test_run = %run_name, runner = %runner_name(&run_name, index), "Created runner Job");

        if !run.spec.use_direct_pod_ips {
            let service = build_runner_service(run, index)?;
            kube.create_service(&namespace, &service).await?;
        }
    }
    Ok(())
}

/// True once a Job has completed, successfully or not
pub fn is_job_finished(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True")
        })
        .unwrap_or(false)
}
