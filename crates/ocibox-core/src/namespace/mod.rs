//! Linux namespace management for container isolation.
//!
//! Maps bundle namespace entries to `clone(2)` flags for namespaces that
//! are created, and opens the namespace files of namespaces that are
//! joined with `setns(2)`.

pub mod user;

use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::sched::CloneFlags;
use ocibox_common::error::{OciboxError, Result};
use ocibox_common::spec::{Namespace, NamespaceType};

/// Returns the `clone(2)` flag creating a namespace of the given kind.
#[must_use]
pub const fn clone_flag(kind: NamespaceType) -> CloneFlags {
    match kind {
        NamespaceType::Pid => CloneFlags::CLONE_NEWPID,
        NamespaceType::Network => CloneFlags::CLONE_NEWNET,
        NamespaceType::Mount => CloneFlags::CLONE_NEWNS,
        NamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
        NamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
        NamespaceType::User => CloneFlags::CLONE_NEWUSER,
        NamespaceType::Cgroup => CloneFlags::CLONE_NEWCGROUP,
    }
}

/// Combined flags for every namespace that is created rather than joined.
#[must_use]
pub fn new_namespace_flags(namespaces: &[Namespace]) -> CloneFlags {
    namespaces
        .iter()
        .filter(|ns| ns.path.is_none())
        .fold(CloneFlags::empty(), |acc, ns| acc | clone_flag(ns.ns_type))
}

/// Returns whether a namespace of the given kind is created.
#[must_use]
pub fn creates(namespaces: &[Namespace], kind: NamespaceType) -> bool {
    namespaces
        .iter()
        .any(|ns| ns.ns_type == kind && ns.path.is_none())
}

/// An open namespace file, ready to be joined.
#[derive(Debug)]
pub struct NamespaceHandle {
    /// Namespace kind.
    pub kind: NamespaceType,
    /// Namespace file the descriptor was opened from.
    pub path: PathBuf,
    fd: OwnedFd,
}

impl NamespaceHandle {
    /// Opens a namespace file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(kind: NamespaceType, path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| OciboxError::io(path, e))?;
        Ok(Self {
            kind,
            path: path.to_path_buf(),
            fd: file.into(),
        })
    }

    /// Raw descriptor, for use where only async-signal-safe calls are allowed.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// `setns(2)` nstype argument for this namespace.
    #[must_use]
    pub const fn nstype(&self) -> libc::c_int {
        clone_flag(self.kind).bits()
    }

    /// Moves the calling thread into this namespace.
    ///
    /// For a PID namespace only children created afterwards are affected.
    ///
    /// # Errors
    ///
    /// Returns an error if `setns(2)` fails.
    pub fn join(&self) -> Result<()> {
        nix::sched::setns(self.fd.as_fd(), clone_flag(self.kind)).map_err(|e| {
            OciboxError::PermissionDenied {
                message: format!("setns {} failed: {e}", self.path.display()),
            }
        })?;
        tracing::debug!(kind = self.kind.proc_name(), "joined namespace");
        Ok(())
    }
}

/// Opens every namespace listed with a `path`, user namespace first.
///
/// # Errors
///
/// Returns an error if a namespace file cannot be opened.
pub fn open_joined(namespaces: &[Namespace]) -> Result<Vec<NamespaceHandle>> {
    let mut handles = Vec::new();
    for kind in NamespaceType::ALL {
        for ns in namespaces.iter().filter(|ns| ns.ns_type == kind) {
            if let Some(path) = &ns.path {
                handles.push(NamespaceHandle::open(kind, path)?);
            }
        }
    }
    Ok(handles)
}

/// Opens the namespaces of a running process that differ from the caller's.
///
/// Namespaces shared with the caller are skipped: joining one's own user
/// namespace is rejected by the kernel.
///
/// # Errors
///
/// Returns an error if the process does not exist or a namespace file
/// cannot be opened.
pub fn process_namespaces(pid: i32) -> Result<Vec<NamespaceHandle>> {
    let mut handles = Vec::new();
    for kind in NamespaceType::ALL {
        let target = PathBuf::from(format!("/proc/{pid}/ns/{}", kind.proc_name()));
        let own = PathBuf::from(format!("/proc/self/ns/{}", kind.proc_name()));
        let target_ino = match std::fs::metadata(&target) {
            Ok(m) => m.ino(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && kind == NamespaceType::Cgroup => {
                continue;
            }
            Err(e) => return Err(OciboxError::io(target, e)),
        };
        let own_ino = std::fs::metadata(&own).map_err(|e| OciboxError::io(&own, e))?.ino();
        if target_ino != own_ino {
            handles.push(NamespaceHandle::open(kind, &target)?);
        }
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(kind: NamespaceType, path: Option<&str>) -> Namespace {
        Namespace {
            ns_type: kind,
            path: path.map(PathBuf::from),
        }
    }

    #[test]
    fn flags_cover_created_namespaces_only() {
        let list = [
            ns(NamespaceType::Pid, None),
            ns(NamespaceType::Mount, None),
            ns(NamespaceType::Network, Some("/proc/1/ns/net")),
        ];
        let flags = new_namespace_flags(&list);
        assert!(flags.contains(CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(creates(&list, NamespaceType::Pid));
        assert!(!creates(&list, NamespaceType::Network));
    }

    #[test]
    fn own_namespaces_are_not_rejoined() {
        let handles = process_namespaces(i32::try_from(std::process::id()).expect("pid fits")).expect("read /proc");
        assert!(handles.is_empty());
    }

    #[test]
    fn joined_namespaces_open_user_first() {
        let list = [
            ns(NamespaceType::Uts, Some("/proc/self/ns/uts")),
            ns(NamespaceType::User, Some("/proc/self/ns/user")),
        ];
        let handles = open_joined(&list).expect("open");
        assert_eq!(handles[0].kind, NamespaceType::User);
        assert_eq!(handles[1].kind, NamespaceType::Uts);
        assert!(handles[0].raw_fd() >= 0);
    }
}
