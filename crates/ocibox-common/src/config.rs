//! Runtime-wide configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    CGROUP_V2_PATH, DEFAULT_KILL_TIMEOUT_SECS, INSTANCES_DIR, runtime_dir,
};
use crate::types::LogFormat;

/// Settings shared by every engine operation.
///
/// Built by the CLI from flags and environment variables, or directly by
/// library users and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Per-user directory holding instance records and sockets.
    pub runtime_dir: PathBuf,
    /// Mount point of the cgroup v2 hierarchy.
    pub cgroup_root: PathBuf,
    /// Log format used when `create` does not name one.
    pub default_log_format: LogFormat,
    /// Grace period used by `kill` when none is given.
    pub kill_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_dir: runtime_dir().clone(),
            cgroup_root: PathBuf::from(CGROUP_V2_PATH),
            default_log_format: LogFormat::default(),
            kill_timeout: Duration::from_secs(DEFAULT_KILL_TIMEOUT_SECS),
        }
    }
}

impl RuntimeConfig {
    /// Configuration rooted at an explicit runtime directory.
    #[must_use]
    pub fn with_runtime_dir(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            ..Self::default()
        }
    }

    /// Overrides the cgroup root.
    #[must_use]
    pub fn cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    /// Directory holding one sub-directory per container.
    #[must_use]
    pub fn instances_dir(&self) -> PathBuf {
        self.runtime_dir.join(INSTANCES_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_paths() {
        let cfg = RuntimeConfig::with_runtime_dir("/tmp/rt").cgroup_root("/tmp/cg");
        assert_eq!(cfg.instances_dir(), PathBuf::from("/tmp/rt/instances"));
        assert_eq!(cfg.cgroup_root, PathBuf::from("/tmp/cg"));
        assert_eq!(cfg.kill_timeout, Duration::from_secs(DEFAULT_KILL_TIMEOUT_SECS));
    }
}
