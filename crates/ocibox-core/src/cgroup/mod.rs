//! Cgroups v2 resource management.
//!
//! One [`CgroupManager`] wraps the cgroup directory of one container. It
//! applies the initial resource limits, applies live updates, freezes and
//! thaws the group for pause/resume, and removes the directory at cleanup.
//! It knows nothing about the engine that drives it.

pub mod cpu;
pub mod freezer;
pub mod io;
pub mod memory;
pub mod pids;

use std::path::{Path, PathBuf};

use ocibox_common::constants::CGROUP_PARENT;
use ocibox_common::error::{OciboxError, Result};
use ocibox_common::spec::LinuxResources;

/// Handle to the cgroup of a specific container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupManager {
    /// Path to this container's cgroup directory.
    path: PathBuf,
}

impl CgroupManager {
    /// Resolves the cgroup directory for a container.
    ///
    /// `cgroups_path` from the bundle is taken relative to `root`; without
    /// it the group is placed at `<root>/ocibox/<container_id>`.
    #[must_use]
    pub fn resolve(root: &Path, container_id: &str, cgroups_path: Option<&Path>) -> PathBuf {
        match cgroups_path {
            Some(p) => root.join(p.strip_prefix("/").unwrap_or(p)),
            None => root.join(CGROUP_PARENT).join(container_id),
        }
    }

    /// Creates the cgroup directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup directory cannot be created.
    pub fn create(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path).map_err(|e| OciboxError::Cgroup {
            path: path.clone(),
            message: format!("cannot create cgroup: {e}"),
        })?;
        tracing::info!(path = %path.display(), "cgroup created");
        Ok(Self { path })
    }

    /// Wraps an existing cgroup directory without touching it.
    #[must_use]
    pub const fn open(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the cgroup directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies resource limits to this cgroup.
    ///
    /// Delegates to the controller-specific writers. Controllers without a
    /// setting in `resources` are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to a cgroup control file fails.
    pub fn apply(&self, resources: &LinuxResources) -> Result<()> {
        if let Some(cpu) = &resources.cpu {
            cpu::apply(&self.path, cpu)?;
        }
        if let Some(mem) = &resources.memory {
            memory::apply(&self.path, mem)?;
        }
        if let Some(pids) = &resources.pids {
            pids::apply(&self.path, pids)?;
        }
        if let Some(blkio) = &resources.block_io {
            io::apply(&self.path, blkio)?;
        }
        Ok(())
    }

    /// Applies a replacement resource document to a live cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup no longer exists or a write fails.
    pub fn update(&self, resources: &LinuxResources) -> Result<()> {
        if !self.path.is_dir() {
            return Err(OciboxError::Cgroup {
                path: self.path.clone(),
                message: "cgroup does not exist".into(),
            });
        }
        self.apply(resources)?;
        tracing::info!(path = %self.path.display(), "cgroup resources updated");
        Ok(())
    }

    /// Adds a process to this cgroup by writing its PID.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    pub fn add_process(&self, pid: i32) -> Result<()> {
        write_control(&self.path, "cgroup.procs", &pid.to_string())?;
        tracing::debug!(pid, "added process to cgroup");
        Ok(())
    }

    /// Freezes every process in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the freeze request fails or does not settle.
    pub fn freeze(&self) -> Result<()> {
        freezer::set_frozen(&self.path, true)
    }

    /// Thaws the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the thaw request fails or does not settle.
    pub fn thaw(&self) -> Result<()> {
        freezer::set_frozen(&self.path, false)
    }

    /// Removes the cgroup directory.
    ///
    /// The kernel only allows removing an empty cgroup with `rmdir`; a
    /// directory holding regular files (as in a test tree) falls back to a
    /// recursive removal.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup directory cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        if std::fs::remove_dir(&self.path).is_err() {
            std::fs::remove_dir_all(&self.path).map_err(|e| OciboxError::Cgroup {
                path: self.path.clone(),
                message: format!("cannot remove cgroup: {e}"),
            })?;
        }
        tracing::info!(path = %self.path.display(), "cgroup destroyed");
        Ok(())
    }
}

/// Writes one value into a cgroup control file.
pub(crate) fn write_control(dir: &Path, file: &str, value: &str) -> Result<()> {
    let path = dir.join(file);
    std::fs::write(&path, value).map_err(|e| OciboxError::Cgroup {
        path,
        message: format!("cannot write {value:?}: {e}"),
    })
}

/// Formats a limit where negative values mean unlimited.
pub(crate) fn limit_value(limit: i64) -> String {
    if limit < 0 {
        "max".to_string()
    } else {
        limit.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocibox_common::spec::{BlockIoResources, CpuResources, MemoryResources, PidsResources};

    fn read(dir: &Path, file: &str) -> String {
        std::fs::read_to_string(dir.join(file)).expect("read control file")
    }

    #[test]
    fn resolve_uses_parent_or_cgroups_path() {
        let root = Path::new("/sys/fs/cgroup");
        assert_eq!(
            CgroupManager::resolve(root, "web", None),
            PathBuf::from("/sys/fs/cgroup/ocibox/web")
        );
        assert_eq!(
            CgroupManager::resolve(root, "web", Some(Path::new("/pods/web"))),
            PathBuf::from("/sys/fs/cgroup/pods/web")
        );
    }

    #[test]
    fn apply_writes_every_controller() {
        let root = tempfile::tempdir().expect("tempdir");
        let cg = CgroupManager::create(root.path().join("c1")).expect("create");
        let resources = LinuxResources {
            memory: Some(MemoryResources {
                limit: Some(1024 * 1024),
                reservation: Some(512 * 1024),
                swap: Some(2 * 1024 * 1024),
            }),
            cpu: Some(CpuResources {
                shares: Some(1024),
                quota: Some(50_000),
                period: Some(100_000),
                cpus: Some("0-1".into()),
                mems: None,
            }),
            pids: Some(PidsResources { limit: 64 }),
            block_io: Some(BlockIoResources { weight: Some(500) }),
        };
        cg.apply(&resources).expect("apply");

        assert_eq!(read(cg.path(), "memory.max"), "1048576");
        assert_eq!(read(cg.path(), "memory.low"), "524288");
        assert_eq!(read(cg.path(), "memory.swap.max"), "1048576");
        assert_eq!(read(cg.path(), "cpu.weight"), "39");
        assert_eq!(read(cg.path(), "cpu.max"), "50000 100000");
        assert_eq!(read(cg.path(), "cpuset.cpus"), "0-1");
        assert_eq!(read(cg.path(), "pids.max"), "64");
        assert_eq!(read(cg.path(), "io.weight"), "default 4950");
    }

    #[test]
    fn update_only_touches_given_controllers() {
        let root = tempfile::tempdir().expect("tempdir");
        let cg = CgroupManager::create(root.path().join("c2")).expect("create");
        cg.apply(&LinuxResources {
            pids: Some(PidsResources { limit: 10 }),
            ..LinuxResources::default()
        })
        .expect("apply");
        cg.update(&LinuxResources {
            memory: Some(MemoryResources {
                limit: Some(-1),
                ..MemoryResources::default()
            }),
            ..LinuxResources::default()
        })
        .expect("update");
        assert_eq!(read(cg.path(), "pids.max"), "10");
        assert_eq!(read(cg.path(), "memory.max"), "max");
    }

    #[test]
    fn update_of_missing_cgroup_fails() {
        let root = tempfile::tempdir().expect("tempdir");
        let cg = CgroupManager::open(root.path().join("gone"));
        assert!(cg.update(&LinuxResources::default()).is_err());
    }

    #[test]
    fn destroy_removes_directory() {
        let root = tempfile::tempdir().expect("tempdir");
        let cg = CgroupManager::create(root.path().join("c3")).expect("create");
        cg.add_process(1).expect("add");
        cg.destroy().expect("destroy");
        assert!(!cg.path().exists());
        cg.destroy().expect("second destroy is a no-op");
    }
}
