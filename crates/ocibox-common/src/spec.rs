//! OCI bundle specification (`config.json`).
//!
//! Only the subset of the runtime specification the engine acts on is
//! modelled; unknown fields are ignored on load.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::BUNDLE_CONFIG;
use crate::error::{OciboxError, Result};

/// Root of a bundle's `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    /// Specification version.
    #[serde(default)]
    pub oci_version: String,
    /// Root filesystem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,
    /// Container process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,
    /// Hostname set inside a new UTS namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Arbitrary metadata copied into the container state.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Lifecycle hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,
    /// Linux-specific configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
}

/// Root filesystem configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    /// Path to the root filesystem, relative to the bundle unless absolute.
    pub path: PathBuf,
    /// Whether the root filesystem is read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// Container process configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Allocate a pseudo-terminal for the process.
    #[serde(default)]
    pub terminal: bool,
    /// Initial terminal geometry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_size: Option<ConsoleSize>,
    /// Identity the process runs as.
    #[serde(default)]
    pub user: User,
    /// Command line; `args[0]` is resolved against `PATH` inside the rootfs.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment in `KEY=value` form.
    #[serde(default)]
    pub env: Vec<String>,
    /// Absolute working directory inside the rootfs.
    #[serde(default = "default_cwd")]
    pub cwd: String,
    /// Set `PR_SET_NO_NEW_PRIVS` before exec.
    #[serde(default)]
    pub no_new_privileges: bool,
}

fn default_cwd() -> String {
    "/".to_string()
}

impl Default for Process {
    fn default() -> Self {
        Self {
            terminal: false,
            console_size: None,
            user: User::default(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: default_cwd(),
            no_new_privileges: false,
        }
    }
}

impl Process {
    /// Returns the `PATH` value from the process environment, if any.
    pub fn path_env(&self) -> Option<&str> {
        self.env.iter().find_map(|kv| kv.strip_prefix("PATH="))
    }
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSize {
    /// Rows.
    pub height: u16,
    /// Columns.
    pub width: u16,
}

/// Process identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// User ID.
    #[serde(default)]
    pub uid: u32,
    /// Group ID.
    #[serde(default)]
    pub gid: u32,
    /// Supplementary group IDs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

/// Hooks grouped by lifecycle point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hooks {
    /// Run after `Created` is committed, before the process is released.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prestart: Vec<Hook>,
    /// Run after `Running` is committed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststart: Vec<Hook>,
    /// Run after `Stopped` is committed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststop: Vec<Hook>,
}

/// One hook command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    /// Absolute path of the executable.
    pub path: PathBuf,
    /// Arguments including `argv[0]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment in `KEY=value` form.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Linux-specific configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    /// Namespaces to create or join.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<Namespace>,
    /// User namespace UID mappings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,
    /// User namespace GID mappings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,
    /// Cgroup resource limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<LinuxResources>,
    /// Cgroup path, relative to the cgroup root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<PathBuf>,
}

/// A namespace to create, or to join when `path` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace kind.
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    /// Existing namespace file to join.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Linux namespace kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// PID namespace.
    Pid,
    /// Network namespace.
    Network,
    /// Mount namespace.
    Mount,
    /// IPC namespace.
    Ipc,
    /// UTS namespace.
    Uts,
    /// User namespace.
    User,
    /// Cgroup namespace.
    Cgroup,
}

impl NamespaceType {
    /// Every kind, in the order they are joined.
    pub const ALL: [Self; 7] = [
        Self::User,
        Self::Ipc,
        Self::Uts,
        Self::Network,
        Self::Pid,
        Self::Mount,
        Self::Cgroup,
    ];

    /// File name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Network => "net",
            Self::Mount => "mnt",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::User => "user",
            Self::Cgroup => "cgroup",
        }
    }
}

/// User namespace ID mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    /// First ID inside the namespace.
    #[serde(rename = "containerID")]
    pub container_id: u32,
    /// First ID on the host.
    #[serde(rename = "hostID")]
    pub host_id: u32,
    /// Number of IDs mapped.
    pub size: u32,
}

/// Cgroup resource limits, also the document accepted by `update`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxResources {
    /// Memory limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryResources>,
    /// CPU limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuResources>,
    /// Process count limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids: Option<PidsResources>,
    /// Block I/O weight.
    #[serde(rename = "blockIO", default, skip_serializing_if = "Option::is_none")]
    pub block_io: Option<BlockIoResources>,
}

impl LinuxResources {
    /// Returns `true` when no controller has a setting.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.memory.is_none() && self.cpu.is_none() && self.pids.is_none() && self.block_io.is_none()
    }
}

/// Memory limits in bytes; `-1` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryResources {
    /// Hard limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    /// Soft reservation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<i64>,
    /// Memory plus swap limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<i64>,
}

/// CPU limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuResources {
    /// Relative shares (cgroup v1 scale, 2..=262144).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    /// Quota in microseconds per period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    /// Period in microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    /// Allowed CPUs, e.g. `0-3`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    /// Allowed memory nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mems: Option<String>,
}

/// Process count limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidsResources {
    /// Maximum number of tasks; `-1` or `0` means unlimited.
    pub limit: i64,
}

/// Block I/O weight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIoResources {
    /// Weight, 10..=1000.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u16>,
}

impl Spec {
    /// Loads and validates `config.json` from a bundle directory.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the file is missing, unparseable,
    /// or fails validation.
    pub fn load(bundle: &Path, empty_process: bool) -> Result<Self> {
        let path = bundle.join(BUNDLE_CONFIG);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| OciboxError::config(format!("cannot read {}: {e}", path.display())))?;
        let spec: Self = serde_json::from_str(&content)
            .map_err(|e| OciboxError::config(format!("cannot parse {}: {e}", path.display())))?;
        spec.validate(empty_process)?;
        Ok(spec)
    }

    /// Checks the fields the engine depends on.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first invalid field.
    pub fn validate(&self, empty_process: bool) -> Result<()> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| OciboxError::config("root is required"))?;
        if root.path.as_os_str().is_empty() {
            return Err(OciboxError::config("root.path cannot be empty"));
        }

        let process = self
            .process
            .as_ref()
            .ok_or_else(|| OciboxError::config("process is required"))?;
        if process.args.is_empty() && !empty_process {
            return Err(OciboxError::config("process.args cannot be empty"));
        }
        if !process.cwd.starts_with('/') {
            return Err(OciboxError::config("process.cwd must be an absolute path"));
        }

        if let Some(linux) = &self.linux {
            let mut seen = HashSet::new();
            for ns in &linux.namespaces {
                if !seen.insert(ns.ns_type) {
                    return Err(OciboxError::config(format!(
                        "duplicate namespace: {}",
                        ns.ns_type.proc_name()
                    )));
                }
            }
        }

        if let Some(hooks) = &self.hooks {
            for hook in hooks.prestart.iter().chain(&hooks.poststart).chain(&hooks.poststop) {
                if !hook.path.is_absolute() {
                    return Err(OciboxError::config(format!(
                        "hook path must be absolute: {}",
                        hook.path.display()
                    )));
                }
                if hook.timeout == Some(0) {
                    return Err(OciboxError::config("hook timeout must be greater than 0"));
                }
            }
        }

        Ok(())
    }

    /// Absolute root filesystem path for a bundle.
    #[must_use]
    pub fn rootfs(&self, bundle: &Path) -> PathBuf {
        match &self.root {
            Some(root) if root.path.is_absolute() => root.path.clone(),
            Some(root) => bundle.join(&root.path),
            None => bundle.join("rootfs"),
        }
    }

    /// Namespaces listed under `linux.namespaces`.
    #[must_use]
    pub fn namespaces(&self) -> &[Namespace] {
        self.linux.as_ref().map_or(&[], |l| l.namespaces.as_slice())
    }

    /// Resource limits listed under `linux.resources`.
    #[must_use]
    pub fn resources(&self) -> Option<&LinuxResources> {
        self.linux.as_ref().and_then(|l| l.resources.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "ociVersion": "1.0.2",
        "root": { "path": "rootfs" },
        "process": { "args": ["/bin/sh"], "cwd": "/" }
    }"#;

    fn write_bundle(json: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(BUNDLE_CONFIG), json).expect("write config");
        dir
    }

    #[test]
    fn loads_minimal_bundle() {
        let dir = write_bundle(MINIMAL);
        let spec = Spec::load(dir.path(), false).expect("load");
        assert_eq!(spec.rootfs(dir.path()), dir.path().join("rootfs"));
        assert!(spec.namespaces().is_empty());
        assert!(spec.resources().is_none());
    }

    #[test]
    fn missing_config_is_configuration_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Spec::load(dir.path(), false).expect_err("must fail");
        assert!(matches!(err, OciboxError::Config { .. }));
    }

    #[test]
    fn empty_args_rejected_unless_empty_process() {
        let dir = write_bundle(r#"{"root":{"path":"/"},"process":{"args":[]}}"#);
        assert!(Spec::load(dir.path(), false).is_err());
        assert!(Spec::load(dir.path(), true).is_ok());
    }

    #[test]
    fn relative_cwd_rejected() {
        let dir = write_bundle(r#"{"root":{"path":"/"},"process":{"args":["true"],"cwd":"tmp"}}"#);
        assert!(Spec::load(dir.path(), false).is_err());
    }

    #[test]
    fn duplicate_namespace_rejected() {
        let dir = write_bundle(
            r#"{"root":{"path":"/"},"process":{"args":["true"]},
               "linux":{"namespaces":[{"type":"pid"},{"type":"pid"}]}}"#,
        );
        let err = Spec::load(dir.path(), false).expect_err("must fail");
        assert!(err.to_string().contains("duplicate namespace"));
    }

    #[test]
    fn unknown_namespace_type_rejected() {
        let dir = write_bundle(
            r#"{"root":{"path":"/"},"process":{"args":["true"]},
               "linux":{"namespaces":[{"type":"bogus"}]}}"#,
        );
        assert!(Spec::load(dir.path(), false).is_err());
    }

    #[test]
    fn parses_resources_and_hooks() {
        let dir = write_bundle(
            r#"{"root":{"path":"/"},"process":{"args":["true"],"env":["PATH=/usr/bin:/bin"]},
               "hooks":{"prestart":[{"path":"/bin/true","timeout":3}]},
               "linux":{"resources":{"memory":{"limit":1048576},"cpu":{"shares":512},
                        "pids":{"limit":32},"blockIO":{"weight":200}},
                        "uidMappings":[{"containerID":0,"hostID":1000,"size":1}]}}"#,
        );
        let spec = Spec::load(dir.path(), false).expect("load");
        let res = spec.resources().expect("resources");
        assert_eq!(res.memory.and_then(|m| m.limit), Some(1_048_576));
        assert_eq!(res.pids.map(|p| p.limit), Some(32));
        assert_eq!(res.block_io.and_then(|b| b.weight), Some(200));
        let hooks = spec.hooks.as_ref().expect("hooks");
        assert_eq!(hooks.prestart[0].timeout, Some(3));
        let linux = spec.linux.as_ref().expect("linux");
        assert_eq!(linux.uid_mappings[0].host_id, 1000);
        assert_eq!(spec.process.as_ref().and_then(Process::path_env), Some("/usr/bin:/bin"));
    }

    #[test]
    fn relative_hook_path_rejected() {
        let dir = write_bundle(
            r#"{"root":{"path":"/"},"process":{"args":["true"]},
               "hooks":{"poststop":[{"path":"cleanup.sh"}]}}"#,
        );
        assert!(Spec::load(dir.path(), false).is_err());
    }
}
