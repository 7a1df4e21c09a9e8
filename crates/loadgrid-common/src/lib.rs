//! Common types for loadgrid: CRDs, errors, events, and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod telemetry;

pub use error::Error;

/// Port the runner's REST control API listens on
pub const AGENT_CONTROL_PORT: u16 = 6565;

/// Label key identifying the product that owns a derived resource
pub const LABEL_APP: &str = "app";

/// Value of [`LABEL_APP`] on every derived resource
pub const LABEL_APP_VALUE: &str = "k6";

/// Label key carrying the name of the owning TestRun
pub const LABEL_RUN_OWNER: &str = "run-owner";

/// Label marking runner pods (as opposed to the starter or initializer)
pub const LABEL_RUNNER: &str = "runner";

/// Label marking the legacy starter pod
pub const LABEL_STARTER: &str = "starter";

/// Field manager name used for status patches
pub const FIELD_MANAGER: &str = "loadgrid-controller";
