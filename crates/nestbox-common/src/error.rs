//! Unified error types for the Nestbox workspace.
//!
//! Variants follow the runtime's failure classes: user errors are rejected
//! before any mutation, setup errors abort a single container's startup,
//! and cleanup errors never reach this type at all (they are logged and
//! swallowed at the call site).

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum NestboxError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A user-supplied value (limit string, volume spec, command) is invalid.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the invalid value.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// An id prefix matched more than one container.
    #[error("ambiguous container ID: {prefix} matches {matches} containers")]
    AmbiguousId {
        /// The prefix that was looked up.
        prefix: String,
        /// Number of matching containers.
        matches: usize,
    },

    /// The container's process is still alive.
    #[error("cannot remove running container {id}; stop it first with 'nbx stop {id}'")]
    StillRunning {
        /// Short identifier of the running container.
        id: String,
    },

    /// No address is left in the container subnet.
    #[error("no available IP addresses in pool {subnet}")]
    PoolExhausted {
        /// The exhausted subnet in CIDR notation.
        subnet: String,
    },

    /// An external networking tool exited unsuccessfully.
    #[error("{program} failed: {message}")]
    Command {
        /// The program that was invoked.
        program: String,
        /// Exit status and captured stderr.
        message: String,
    },

    /// A fatal container setup step failed.
    #[error("container setup failed at {step}: {message}")]
    Setup {
        /// Name of the failing step.
        step: String,
        /// Description of the failure.
        message: String,
    },

    /// A permission or capability error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl NestboxError {
    /// Builds an [`NestboxError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds an [`NestboxError::InvalidInput`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Builds a [`NestboxError::Setup`] for the named step.
    pub fn setup(step: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Setup {
            step: step.into(),
            message: message.to_string(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, NestboxError>;
