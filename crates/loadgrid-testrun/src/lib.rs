//! TestRun controller for loadgrid
//!
//! Drives a distributed load test through its lifecycle:
//! - Splits the load into one execution segment per runner
//! - Creates one runner Job (and optional Service) per segment
//! - Waits for every runner to report ready, then starts them together
//! - Watches the runners until they complete, stopping them on cloud abort
//!
//! Start and stop commands that must not block the reconcile loop go through
//! the bounded [`dispatch`] pool, created once per process.

pub mod agent;
pub mod cloud;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod resources;
pub mod segmentation;
mod starter;

pub use controller::{error_policy, reconcile, Context, ContextBuilder};
pub use error::TestRunError;
pub use starter::start_agents;
