//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Runtime directory used when running as root without `XDG_RUNTIME_DIR`.
pub const SYSTEM_RUNTIME_DIR: &str = "/run/ocibox";

/// Returns the per-user runtime directory.
///
/// Prefers `$XDG_RUNTIME_DIR/ocibox`, then the system directory when it is
/// writable, and finally a user-scoped directory under the temp dir.
fn resolve_runtime_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_RUNTIME_DIR") {
        let user_dir = PathBuf::from(xdg).join(APP_NAME);
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    let system_dir = PathBuf::from(SYSTEM_RUNTIME_DIR);
    if std::fs::create_dir_all(&system_dir).is_ok() {
        return system_dir;
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "nobody".into());
    tracing::debug!(user = %user, "no writable runtime directory, using temp dir");
    std::env::temp_dir().join(format!("{APP_NAME}-{user}"))
}

static RUNTIME_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved runtime directory for this session.
pub fn runtime_dir() -> &'static PathBuf {
    RUNTIME_DIR.get_or_init(resolve_runtime_dir)
}

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Parent cgroup for containers without an explicit `cgroupsPath`.
pub const CGROUP_PARENT: &str = "ocibox";

/// OCI runtime specification version reported in state documents.
pub const OCI_VERSION: &str = "1.0.2";

/// Name of the bundle specification file.
pub const BUNDLE_CONFIG: &str = "config.json";

/// Sub-directory of the runtime directory holding instance records.
pub const INSTANCES_DIR: &str = "instances";

/// File name of an instance record inside its instance directory.
pub const INSTANCE_FILE: &str = "instance.json";

/// File name of the attach socket inside an instance directory.
pub const ATTACH_SOCKET: &str = "attach.sock";

/// File name of the control socket inside an instance directory.
pub const CONTROL_SOCKET: &str = "control.sock";

/// File name of the default container log inside an instance directory.
pub const DEFAULT_LOG_FILE: &str = "container.log";

/// Maximum length of a container identifier.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Maximum size of one framed control message.
pub const MAX_CONTROL_FRAME: usize = 64 * 1024;

/// Default grace period for `kill` before escalating to `SIGKILL`.
pub const DEFAULT_KILL_TIMEOUT_SECS: u64 = 10;

/// Maximum number of bytes retained for the terminal replay line.
pub const TERMINAL_LINE_MAX: usize = 8 * 1024;

/// Application name used in paths and cgroup names.
pub const APP_NAME: &str = "ocibox";
