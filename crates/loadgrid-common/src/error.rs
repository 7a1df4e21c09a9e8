//! Error types shared by loadgrid controllers
//!
//! Variants carry the TestRun name where one is known so that log lines and
//! Kubernetes Events can point at the offending resource.

use thiserror::Error;

/// Main error type for loadgrid operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for TestRun inputs
    #[error("validation error for {run}: {message}")]
    Validation {
        /// Name of the TestRun (or referenced object) with invalid input
        run: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error for a specific TestRun
    pub fn validation_for(run: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            run: run.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// True when the API server rejected a write because the object changed underneath us
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
