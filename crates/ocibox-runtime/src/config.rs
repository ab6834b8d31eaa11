//! Engine configuration carried across the CLI / master boundary.
//!
//! The CLI builds an [`EngineConfig`] at `create` time and stores it as the
//! opaque blob of the instance record; the master reads it back, keeps it
//! current (state, cgroup path) and rewrites it on every transition.

use std::fmt;
use std::path::PathBuf;

use ocibox_common::spec::Spec;
use ocibox_common::types::{LogFormat, State};
use serde::{Deserialize, Serialize};

/// Engines known to this build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// OCI bundle engine.
    #[default]
    Oci,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oci => write!(f, "oci"),
        }
    }
}

/// Everything the master needs to drive one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Absolute bundle directory.
    pub bundle: PathBuf,
    /// Container log file.
    pub log_path: PathBuf,
    /// Container log format.
    pub log_format: LogFormat,
    /// File receiving the container PID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,
    /// Parsed bundle specification.
    pub spec: Spec,
    /// Live container state.
    pub state: State,
    /// Socket receiving one state document per transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_socket: Option<PathBuf>,
    /// Run a placeholder process that never execs.
    #[serde(default)]
    pub empty_process: bool,
    /// Cgroup directory, once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup: Option<PathBuf>,
}

impl EngineConfig {
    /// Whether the container process gets a pseudo-terminal.
    #[must_use]
    pub fn terminal(&self) -> bool {
        self.spec.process.as_ref().is_some_and(|p| p.terminal)
    }

    /// Absolute root filesystem path.
    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        self.spec.rootfs(&self.bundle)
    }
}
