//! TestRun CRD types
//!
//! A `TestRun` describes one distributed load test: the script to execute,
//! how many runners to split it across, and how the runners are started.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements, SecurityContext};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::Conditions;

/// Runner image used when `spec.runner.image` is not set
pub const DEFAULT_RUNNER_IMAGE: &str = "grafana/k6:latest";

/// Starter image used when `spec.starter.image` is not set
pub const DEFAULT_STARTER_IMAGE: &str = "curlimages/curl:8.11.1";

// =============================================================================
// Stage
// =============================================================================

/// Lifecycle stage of a TestRun
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Freshly created, conditions not yet initialized
    #[default]
    Initialization,
    /// Conditions initialized, runners not yet created
    Initialized,
    /// Runner jobs created, waiting for them to become ready
    Created,
    /// Start command delivered to every runner
    Started,
    /// Stop requested, waiting for runners to exit
    Stopped,
    /// All runners completed
    Finished,
    /// Unrecoverable failure
    Error,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialization => write!(f, "initialization"),
            Self::Initialized => write!(f, "initialized"),
            Self::Created => write!(f, "created"),
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
            Self::Finished => write!(f, "finished"),
            Self::Error => write!(f, "error"),
        }
    }
}

// =============================================================================
// Spec pieces
// =============================================================================

/// Location of the test script
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSpec {
    /// ConfigMap holding the script
    pub config_map: String,

    /// Key (file name) of the script inside the ConfigMap
    #[serde(default = "default_script_file")]
    pub file: String,
}

impl Default for ScriptSpec {
    fn default() -> Self {
        Self {
            config_map: String::new(),
            file: default_script_file(),
        }
    }
}

fn default_script_file() -> String {
    "test.js".to_string()
}

/// Pod settings for runner jobs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSpec {
    /// Runner image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Image pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Extra environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Container resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Container security context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,

    /// Service account the runner pods run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Node selector for runner pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

impl RunnerSpec {
    /// Image to run, falling back to [`DEFAULT_RUNNER_IMAGE`]
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_RUNNER_IMAGE)
    }
}

/// Pod settings for the legacy starter job
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StarterSpec {
    /// Starter image (must provide `curl`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Image pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Container security context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,

    /// Container resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

impl StarterSpec {
    /// Image to run, falling back to [`DEFAULT_STARTER_IMAGE`]
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_STARTER_IMAGE)
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Distributed load test split across `parallelism` runners
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "loadgrid.dev",
    version = "v1alpha1",
    kind = "TestRun",
    plural = "testruns",
    shortname = "tr",
    namespaced,
    status = "TestRunStatus",
    printcolumn = r#"{"name":"Stage","type":"string","jsonPath":".status.stage"}"#,
    printcolumn = r#"{"name":"Parallelism","type":"integer","jsonPath":".spec.parallelism"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TestRunSpec {
    /// Number of runners the load is split across
    pub parallelism: u32,

    /// Script to execute
    pub script: ScriptSpec,

    /// Extra arguments appended to the runner command line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,

    /// Runner pod settings
    #[serde(default)]
    pub runner: RunnerSpec,

    /// Legacy starter pod settings
    #[serde(default)]
    pub starter: StarterSpec,

    /// Address runners by pod IP instead of creating a Service per runner
    #[serde(default)]
    pub use_direct_pod_ips: bool,

    /// Start runners from a dedicated starter Job instead of from the operator
    #[serde(default)]
    pub use_legacy_starter: bool,

    /// Secret holding the cloud token; its presence makes the run cloud-backed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Run in a private load zone (requires a setup call before start)
    #[serde(default)]
    pub private_load_zone: bool,
}

impl Default for TestRunSpec {
    fn default() -> Self {
        Self {
            parallelism: 1,
            script: ScriptSpec::default(),
            arguments: None,
            runner: RunnerSpec::default(),
            starter: StarterSpec::default(),
            use_direct_pod_ips: false,
            use_legacy_starter: false,
            token: None,
            private_load_zone: false,
        }
    }
}

impl TestRunSpec {
    /// Validate the spec
    pub fn validate(&self) -> Result<(), String> {
        if self.parallelism == 0 {
            return Err("parallelism must be at least 1".to_string());
        }
        if self.script.config_map.is_empty() {
            return Err("script.configMap must be set".to_string());
        }
        if self.script.file.is_empty() {
            return Err("script.file must be set".to_string());
        }
        Ok(())
    }
}

/// Status of a TestRun
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestRunStatus {
    /// Current lifecycle stage
    #[serde(default)]
    pub stage: Stage,

    /// Identifier assigned by the cloud service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_run_id: Option<String>,

    /// Timestamped flags consulted by timeout policies
    #[serde(default)]
    pub conditions: Conditions,

    /// Human-readable message about the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TestRun {
    /// Current stage, `Initialization` if no status has been written yet
    pub fn stage(&self) -> Stage {
        self.status.as_ref().map(|s| s.stage).unwrap_or_default()
    }

    /// Whether events for this run are reported to the cloud service
    pub fn is_cloud(&self) -> bool {
        self.spec.token.is_some()
    }

    /// Cloud run identifier, empty if not yet assigned
    pub fn test_run_id(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.test_run_id.as_deref())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn sample_spec() -> TestRunSpec {
        TestRunSpec {
            parallelism: 4,
            script: ScriptSpec {
                config_map: "checkout-script".to_string(),
                file: "checkout.js".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn spec_defaults() {
        let spec = TestRunSpec::default();
        assert_eq!(spec.parallelism, 1);
        assert_eq!(spec.script.file, "test.js");
        assert_eq!(spec.runner.image(), DEFAULT_RUNNER_IMAGE);
        assert_eq!(spec.starter.image(), DEFAULT_STARTER_IMAGE);
        assert!(!spec.use_direct_pod_ips);
    }

    #[test]
    fn validation_rejects_zero_parallelism() {
        let spec = TestRunSpec {
            parallelism: 0,
            ..sample_spec()
        };
        assert!(spec.validate().unwrap_err().contains("parallelism"));
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn validation_requires_script_config_map() {
        let spec = TestRunSpec {
            script: ScriptSpec::default(),
            ..sample_spec()
        };
        assert!(spec.validate().unwrap_err().contains("configMap"));
    }

    #[test]
    fn story_spec_parses_from_manifest() {
        let yaml = serde_json::json!({
            "parallelism": 3,
            "script": {"configMap": "smoke"},
            "useDirectPodIps": true,
            "token": "cloud-token",
            "runner": {"image": "grafana/k6:0.55.0"}
        });
        let spec: TestRunSpec = serde_json::from_value(yaml).unwrap();
        assert_eq!(spec.parallelism, 3);
        assert_eq!(spec.script.file, "test.js");
        assert!(spec.use_direct_pod_ips);
        assert_eq!(spec.runner.image(), "grafana/k6:0.55.0");

        let run = TestRun::new("smoke", spec);
        assert!(run.is_cloud());
    }

    #[test]
    fn stage_defaults_to_initialization_without_status() {
        let run = TestRun::new("fresh", sample_spec());
        assert_eq!(run.stage(), Stage::Initialization);
        assert_eq!(run.test_run_id(), "");
        assert!(!run.is_cloud());
    }

    #[test]
    fn stage_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Stage::Created).unwrap(), "created");
        assert_eq!(Stage::Started.to_string(), "started");
    }

    #[test]
    fn crd_has_expected_names() {
        let crd = TestRun::crd();
        assert_eq!(crd.spec.group, "loadgrid.dev");
        assert_eq!(crd.spec.names.kind, "TestRun");
        assert_eq!(crd.spec.names.plural, "testruns");
    }
}
