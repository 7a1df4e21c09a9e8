//! Custom Resource Definitions for loadgrid
//!
//! `TestRun` is the only CRD; conditions live in their own module because the
//! controller consults them for its timeout policies.

pub mod conditions;
mod test_run;

pub use conditions::{Condition, ConditionKind, ConditionStatus, Conditions};
pub use test_run::{
    RunnerSpec, ScriptSpec, Stage, StarterSpec, TestRun, TestRunSpec, TestRunStatus,
    DEFAULT_RUNNER_IMAGE, DEFAULT_STARTER_IMAGE,
};
