//! Unified error types for the Palisade workspace.
//!
//! Every crate in the workspace reports failures through [`RuntimeError`];
//! the child side of a container creation additionally maps any of these
//! into the reserved exit status before it dies.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
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

    /// A permission or privilege error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// The running kernel rejected or does not support an isolation
    /// primitive (namespace type, cgroup controller, capability).
    #[error("unsupported by this kernel: {what}")]
    Unsupported {
        /// Description of the unsupported operation.
        what: String,
    },

    /// A kernel-level operation failed.
    #[error("kernel operation `{op}` failed: {message}")]
    Kernel {
        /// Name of the failed operation.
        op: &'static str,
        /// Stringified cause.
        message: String,
    },

    /// A synchronization barrier between parent and child broke down.
    #[error("synchronization failure: {message}")]
    Sync {
        /// Description of the broken rendezvous.
        message: String,
    },
}

impl RuntimeError {
    /// Wraps an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps a failed kernel operation with its stringified cause.
    pub fn kernel(op: &'static str, cause: impl fmt::Display) -> Self {
        Self::Kernel {
            op,
            message: cause.to_string(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_error_carries_operation_name() {
        let err = RuntimeError::kernel("unshare", "EPERM");
        assert_eq!(err.to_string(), "kernel operation `unshare` failed: EPERM");
    }

    #[test]
    fn io_error_carries_path() {
        let err = RuntimeError::io(
            "/var/lock/.demo.lock",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(err.to_string().contains("/var/lock/.demo.lock"));
    }
}
