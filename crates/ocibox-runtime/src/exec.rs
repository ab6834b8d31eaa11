//! Running an additional process inside a running container.
//!
//! The process joins every namespace of the container's init process that
//! differs from ours, moves into the container cgroup, changes root and
//! directory like the init process did, and inherits the caller's stdio.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::Command;

use ocibox_common::error::{OciboxError, Result};
use ocibox_common::spec::{NamespaceType, Process};
use ocibox_core::namespace::{self, NamespaceHandle};

use crate::config::EngineConfig;
use crate::process::resolve_program;

fn os_err(context: &str, e: std::io::Error) -> OciboxError {
    OciboxError::Process {
        message: format!("exec {context}: {e}"),
    }
}

/// Runs `args` inside the container whose init process is `pid` and
/// returns its exit code (`128 + signo` when killed by a signal).
///
/// # Errors
///
/// Returns a configuration error for empty `args`, or a process error if
/// the namespaces cannot be opened or the process cannot be spawned.
pub fn run(config: &EngineConfig, pid: i32, args: &[String]) -> Result<i32> {
    let (arg0, rest) = args
        .split_first()
        .ok_or_else(|| OciboxError::config("exec requires a command"))?;
    let base = config.spec.process.clone().unwrap_or_default();

    let host_root = config.rootfs();
    let proc_root = if host_root == Path::new("/") {
        None
    } else {
        Some(PathBuf::from(format!("/proc/{pid}/root")))
    };
    let lookup = Process {
        args: args.to_vec(),
        ..base.clone()
    };
    let program = resolve_program(&lookup, proc_root.as_deref().unwrap_or_else(|| Path::new("/")))?;

    let (joined, pid_ns): (Vec<NamespaceHandle>, Vec<NamespaceHandle>) = namespace::process_namespaces(pid)?
        .into_iter()
        .partition(|ns| ns.kind != NamespaceType::Pid);
    let cgroup_procs = config
        .cgroup
        .as_ref()
        .map(|dir| {
            let path = dir.join("cgroup.procs");
            std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| OciboxError::io(path, e))
        })
        .transpose()?;

    let to_c = |what: &str, bytes: &[u8]| {
        CString::new(bytes).map_err(|_| OciboxError::config(format!("{what} contains a NUL byte")))
    };
    let root_c = proc_root.as_ref().map(|p| to_c("root", p.as_os_str().as_bytes())).transpose()?;
    let cwd_c = to_c("cwd", base.cwd.as_bytes())?;
    let user = base.user.clone();

    let mut cmd = Command::new(&program);
    let _ = cmd
        .arg0(arg0)
        .args(rest)
        .env_clear()
        .envs(base.env.iter().filter_map(|kv| kv.split_once('=')));

    let fds: Vec<(RawFd, libc::c_int)> = joined.iter().map(|ns| (ns.raw_fd(), ns.nstype())).collect();
    let procs_fd = cgroup_procs.as_ref().map(File::as_raw_fd);
    // SAFETY: the closure runs between fork and exec and only issues raw
    // system calls on descriptors and strings owned by this frame, which
    // outlives the spawn.
    unsafe {
        let _ = cmd.pre_exec(move || enter_container(&fds, procs_fd, root_c.as_ref(), &cwd_c, &user));
    }

    tracing::info!(pid, program = %program.display(), "exec into container");
    let spawner = std::thread::Builder::new()
        .name("ocibox-exec".into())
        .spawn(move || -> Result<i32> {
            if let Some(ns) = pid_ns.first() {
                ns.join()?;
            }
            let status = cmd.status().map_err(|e| os_err("spawn", e))?;
            drop(joined);
            drop(cgroup_procs);
            Ok(status
                .code()
                .or_else(|| status.signal().map(|s| 128 + s))
                .unwrap_or(255))
        })
        .map_err(|e| os_err("thread", e))?;
    spawner.join().map_err(|_| OciboxError::Process {
        message: "exec thread panicked".into(),
    })?
}

fn check(rc: libc::c_int) -> std::io::Result<()> {
    if rc < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Child side of exec, between fork and exec.
fn enter_container(
    namespaces: &[(RawFd, libc::c_int)],
    cgroup_procs: Option<RawFd>,
    root: Option<&CString>,
    cwd: &CString,
    user: &ocibox_common::spec::User,
) -> std::io::Result<()> {
    // SAFETY: raw system calls on valid descriptors and NUL-terminated
    // strings; no allocation happens here.
    unsafe {
        for &(fd, nstype) in namespaces {
            check(libc::setns(fd, nstype))?;
        }
        if let Some(fd) = cgroup_procs {
            // "0" moves the writing process.
            if libc::write(fd, b"0".as_ptr().cast(), 1) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        if let Some(root) = root {
            check(libc::chroot(root.as_ptr()))?;
        }
        check(libc::chdir(cwd.as_ptr()))?;

        if libc::setgroups(user.additional_gids.len(), user.additional_gids.as_ptr()) < 0
            && !user.additional_gids.is_empty()
        {
            return Err(std::io::Error::last_os_error());
        }
        if libc::getgid() != user.gid {
            check(libc::setgid(user.gid))?;
        }
        if libc::getuid() != user.uid {
            check(libc::setuid(user.uid))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ocibox_common::spec::{Root, Spec};
    use ocibox_common::types::{ContainerId, LogFormat, State};

    use super::*;

    fn host_config() -> EngineConfig {
        let id = ContainerId::parse("exec-test").expect("id");
        // SAFETY: reading ids has no preconditions.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        EngineConfig {
            bundle: PathBuf::from("/"),
            log_path: PathBuf::from("/dev/null"),
            log_format: LogFormat::Basic,
            pid_file: None,
            spec: Spec {
                root: Some(Root {
                    path: PathBuf::from("/"),
                    readonly: false,
                }),
                process: Some(Process {
                    args: vec!["true".into()],
                    env: vec!["PATH=/usr/bin:/bin".into()],
                    user: ocibox_common::spec::User {
                        uid,
                        gid,
                        additional_gids: Vec::new(),
                    },
                    ..Process::default()
                }),
                ..Spec::default()
            },
            state: State::new(&id, PathBuf::from("/"), BTreeMap::new()),
            sync_socket: None,
            empty_process: false,
            cgroup: None,
        }
    }

    fn own_pid() -> i32 {
        i32::try_from(std::process::id()).expect("pid fits")
    }

    #[test]
    fn exit_code_is_returned() {
        let code = run(&host_config(), own_pid(), &["sh".into(), "-c".into(), "exit 7".into()]).expect("exec");
        assert_eq!(code, 7);
    }

    #[test]
    fn container_env_replaces_callers() {
        let mut config = host_config();
        if let Some(p) = config.spec.process.as_mut() {
            p.env.push("EXEC_MARK=inside".into());
        }
        let code = run(
            &config,
            own_pid(),
            &["sh".into(), "-c".into(), "test \"$EXEC_MARK\" = inside".into()],
        )
        .expect("exec");
        assert_eq!(code, 0);
    }

    #[test]
    fn empty_command_is_config_error() {
        assert!(matches!(
            run(&host_config(), own_pid(), &[]),
            Err(OciboxError::Config { .. })
        ));
    }
}
