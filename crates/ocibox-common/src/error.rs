//! Unified error types for the ocibox workspace.
//!
//! The variants follow the runtime's failure taxonomy: configuration
//! problems are raised before any state exists, transition errors have no
//! side effects, IPC errors are fatal to the current operation, hook and
//! process errors carry the lifecycle point they came from.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum OciboxError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The bundle, specification, or a configuration value is invalid.
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

    /// A container with the same identifier already exists.
    #[error("container {id} already exists")]
    AlreadyExists {
        /// Identifier of the existing container.
        id: String,
    },

    /// The operation is not valid for the container's current status.
    #[error("cannot {operation} container {id}: status is {status}")]
    InvalidTransition {
        /// Container identifier.
        id: String,
        /// Current status.
        status: String,
        /// Rejected operation.
        operation: &'static str,
    },

    /// Socket creation, dial, or encoding failed.
    #[error("IPC failure ({context}): {source}")]
    Ipc {
        /// Which socket or exchange failed.
        context: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A lifecycle hook failed.
    #[error("{hook} hook failed: {message}")]
    Hook {
        /// Hook identification (lifecycle point and path).
        hook: String,
        /// Failure description.
        message: String,
    },

    /// A lifecycle hook exceeded its timeout.
    #[error("{hook} hook timed out after {timeout_secs}s")]
    HookTimeout {
        /// Hook identification (lifecycle point and path).
        hook: String,
        /// Configured timeout.
        timeout_secs: u64,
    },

    /// The container process failed before or during exec.
    #[error("container process error: {message}")]
    Process {
        /// Failure description.
        message: String,
    },

    /// A cgroup operation failed.
    #[error("cgroup error at {path}: {message}")]
    Cgroup {
        /// Cgroup directory involved.
        path: PathBuf,
        /// Failure description.
        message: String,
    },

    /// A permission or capability error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// The master process rejected a control request.
    #[error("{message}")]
    Rejected {
        /// Error text reported by the master.
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

impl OciboxError {
    /// Wraps an I/O error raised while talking over a socket.
    pub fn ipc(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Ipc {
            context: context.into(),
            source,
        }
    }

    /// Wraps an I/O error raised at a filesystem path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, OciboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_error_names_operation_and_status() {
        let err = OciboxError::InvalidTransition {
            id: "web".into(),
            status: "running".into(),
            operation: "delete",
        };
        assert_eq!(err.to_string(), "cannot delete container web: status is running");
    }

    #[test]
    fn already_exists_message() {
        let err = OciboxError::AlreadyExists { id: "db".into() };
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn hook_timeout_message_is_distinct() {
        let err = OciboxError::HookTimeout {
            hook: "prestart /bin/sleep".into(),
            timeout_secs: 2,
        };
        assert_eq!(err.to_string(), "prestart /bin/sleep hook timed out after 2s");
    }
}
