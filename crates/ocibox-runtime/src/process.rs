//! Container process spawning.
//!
//! The container process is created with `clone(2)` in its new namespaces.
//! Everything it needs is prepared by the master beforehand (C strings,
//! namespace descriptors, stdio descriptors) so that the child only makes
//! raw system calls between `clone` and `execve`.
//!
//! Child sequence: join namespaces, wire stdio, close stray descriptors,
//! change root and directory, set the hostname, report [`READY`], wait for
//! [`START`], switch identity, exec. Any failure is reported over the sync
//! socket as a failure frame.

use std::ffi::{CString, OsString};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::fcntl::OFlag;
use nix::unistd::{Pid, pipe2};
use ocibox_common::error::{OciboxError, Result};
use ocibox_common::spec::{ConsoleSize, NamespaceType, Process};
use ocibox_core::namespace::{self, NamespaceHandle};
use ocibox_core::terminal;

use crate::config::EngineConfig;
use crate::handshake::{ChildStage, READY, START, SyncPipe, failure_frame};
use crate::streams::{ParentStdio, PtyMaster};

/// `PATH` searched when the process environment does not set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const STACK_SIZE: usize = 1024 * 1024;

/// Container-side ends of the standard streams.
#[derive(Debug)]
pub enum ChildStdio {
    /// Separate pipe ends for stdin, stdout and stderr.
    Pipes {
        /// Read end of stdin.
        stdin: OwnedFd,
        /// Write end of stdout.
        stdout: OwnedFd,
        /// Write end of stderr.
        stderr: OwnedFd,
    },
    /// Pseudo-terminal slave, becoming the controlling terminal.
    Pty(OwnedFd),
}

fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(|e| OciboxError::Process {
        message: format!("pipe2 failed: {e}"),
    })
}

/// Allocates the container's standard streams.
///
/// # Errors
///
/// Returns an error if pipes or the pseudo-terminal cannot be allocated.
pub fn setup_stdio(terminal: bool, size: Option<ConsoleSize>) -> Result<(ParentStdio, ChildStdio)> {
    if terminal {
        let pty = terminal::open(size)?;
        let master = PtyMaster::new(pty.master).map_err(|e| OciboxError::ipc("pty master", e))?;
        return Ok((ParentStdio::Pty(Arc::new(master)), ChildStdio::Pty(pty.slave)));
    }
    let (stdin_r, stdin_w) = pipe()?;
    let (stdout_r, stdout_w) = pipe()?;
    let (stderr_r, stderr_w) = pipe()?;
    Ok((
        ParentStdio::Pipes {
            stdin: stdin_w,
            stdout: stdout_r,
            stderr: stderr_r,
        },
        ChildStdio::Pipes {
            stdin: stdin_r,
            stdout: stdout_w,
            stderr: stderr_w,
        },
    ))
}

/// Resolves `args[0]` against the container's `PATH`, relative to `rootfs`.
///
/// The returned path is as seen from inside the container.
///
/// # Errors
///
/// Returns a process error if no executable is found.
pub fn resolve_program(process: &Process, rootfs: &Path) -> Result<PathBuf> {
    let arg0 = process.args.first().ok_or_else(|| OciboxError::config("process.args is empty"))?;
    if arg0.contains('/') {
        return Ok(PathBuf::from(arg0));
    }
    let search = process.path_env().unwrap_or(DEFAULT_PATH);
    let prefixed: OsString = std::env::join_paths(
        search
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| rootfs.join(dir.trim_start_matches('/'))),
    )
    .map_err(|e| OciboxError::config(format!("invalid PATH: {e}")))?;

    let found = which::which_in(arg0, Some(prefixed), rootfs).map_err(|e| OciboxError::Process {
        message: format!("{arg0}: executable not found in container PATH: {e}"),
    })?;
    Ok(match found.strip_prefix(rootfs) {
        Ok(inner) => Path::new("/").join(inner),
        Err(_) => found,
    })
}

fn cstring(what: &str, value: impl AsRef<[u8]>) -> Result<CString> {
    CString::new(value.as_ref()).map_err(|_| OciboxError::config(format!("{what} contains a NUL byte")))
}

/// Everything the child needs, prepared before `clone`.
#[derive(Debug)]
struct ChildPlan {
    joined: Vec<NamespaceHandle>,
    sync_fd: RawFd,
    stdio: [RawFd; 3],
    pty: bool,
    rootfs: Option<CString>,
    cwd: CString,
    hostname: Option<CString>,
    uid: libc::uid_t,
    gid: libc::gid_t,
    groups: Vec<libc::gid_t>,
    no_new_privs: bool,
    empty: bool,
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Spawns the container process and returns its PID with the master end of
/// the sync socket. The process is left waiting at the ready checkpoint.
///
/// # Errors
///
/// Returns a configuration error for unusable process settings, or a
/// process error if namespaces cannot be opened or `clone` fails.
pub fn spawn(config: &EngineConfig, stdio: ChildStdio) -> Result<(Pid, SyncPipe)> {
    let process = config
        .spec
        .process
        .as_ref()
        .ok_or_else(|| OciboxError::config("bundle has no process"))?;
    let namespaces = config.spec.namespaces();
    let rootfs = config.rootfs();

    let (parent_sock, child_sock) = StdUnixStream::pair().map_err(|e| OciboxError::ipc("sync socket pair", e))?;

    let (joined, pid_ns): (Vec<_>, Vec<_>) = namespace::open_joined(namespaces)?
        .into_iter()
        .partition(|ns| ns.kind != NamespaceType::Pid);

    let (program, argv) = if config.empty_process {
        (CString::default(), Vec::new())
    } else {
        let program = resolve_program(process, &rootfs)?;
        let argv = process
            .args
            .iter()
            .map(|a| cstring("process.args", a))
            .collect::<Result<Vec<_>>>()?;
        (cstring("process.args[0]", program.as_os_str().as_bytes())?, argv)
    };

    let (stdio_fds, pty) = match &stdio {
        ChildStdio::Pipes { stdin, stdout, stderr } => {
            ([stdin.as_raw_fd(), stdout.as_raw_fd(), stderr.as_raw_fd()], false)
        }
        ChildStdio::Pty(slave) => ([slave.as_raw_fd(); 3], true),
    };

    let hostname = match &config.spec.hostname {
        Some(name) if namespace::creates(namespaces, NamespaceType::Uts) => Some(cstring("hostname", name)?),
        _ => None,
    };

    let plan = ChildPlan {
        joined,
        sync_fd: child_sock.as_raw_fd(),
        stdio: stdio_fds,
        pty,
        rootfs: if rootfs == Path::new("/") {
            None
        } else {
            Some(cstring("root.path", rootfs.as_os_str().as_bytes())?)
        },
        cwd: cstring("process.cwd", &process.cwd)?,
        hostname,
        uid: process.user.uid,
        gid: process.user.gid,
        groups: process.user.additional_gids.clone(),
        no_new_privs: process.no_new_privileges,
        empty: config.empty_process,
        program,
        argv,
        envp: process
            .env
            .iter()
            .map(|e| cstring("process.env", e))
            .collect::<Result<Vec<_>>>()?,
    };
    let flags = namespace::new_namespace_flags(namespaces);

    // setns(CLONE_NEWPID) only affects children of the calling thread, so
    // the clone happens on a dedicated thread that may join it.
    let spawner = std::thread::Builder::new()
        .name("ocibox-clone".into())
        .spawn(move || -> Result<Pid> {
            if let Some(ns) = pid_ns.first() {
                ns.join()?;
            }
            let argv = null_terminated(&plan.argv);
            let envp = null_terminated(&plan.envp);
            let mut stack = vec![0u8; STACK_SIZE];
            let cb: nix::sched::CloneCb<'_> = Box::new(|| -> isize {
                // SAFETY: runs in the freshly cloned child, which only
                // issues raw system calls on data prepared above.
                unsafe { child_main(&plan, &argv, &envp) }
            });
            // SAFETY: the child does not share memory with the parent
            // (no CLONE_VM) and never returns into Rust code that could
            // observe inconsistent state; it either execs or _exits.
            let pid = unsafe { nix::sched::clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) }.map_err(|e| {
                OciboxError::Process {
                    message: format!("clone failed: {e}"),
                }
            })?;
            drop(stdio);
            drop(child_sock);
            Ok(pid)
        })
        .map_err(|e| OciboxError::Process {
            message: format!("cannot start spawner thread: {e}"),
        })?;
    let pid = spawner.join().map_err(|_| OciboxError::Process {
        message: "spawner thread panicked".into(),
    })??;

    tracing::info!(pid = pid.as_raw(), flags = ?flags, "container process spawned");
    Ok((pid, SyncPipe::new(parent_sock)?))
}

/// Reports `stage` with the current errno and exits.
unsafe fn fail(sync: RawFd, stage: ChildStage) -> ! {
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    let frame = failure_frame(stage, errno);
    // SAFETY: frame is a valid buffer of the given length.
    unsafe {
        let _ = libc::write(sync, frame.as_ptr().cast(), frame.len());
        libc::_exit(127)
    }
}

/// Closes every descriptor above stderr except `keep`.
unsafe fn close_stray_fds(keep: RawFd) {
    let Ok(upper) = libc::c_uint::try_from(keep) else {
        return;
    };
    // SAFETY: closing descriptors has no memory-safety implications.
    unsafe {
        let below = upper <= 3 || libc::syscall(libc::SYS_close_range, 3u32, upper - 1, 0u32) == 0;
        let above = libc::syscall(libc::SYS_close_range, upper + 1, libc::c_uint::MAX, 0u32) == 0;
        if !(below && above) {
            for fd in (3..1024).filter(|&fd| fd != keep) {
                let _ = libc::close(fd);
            }
        }
    }
}

/// Blocks forever as a placeholder init: reaps children, exits on
/// `SIGINT` or `SIGTERM`.
unsafe fn pause_forever() -> ! {
    // SAFETY: sigset_t is plain data initialised by sigemptyset.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        let _ = libc::sigemptyset(&raw mut set);
        for sig in [libc::SIGCHLD, libc::SIGINT, libc::SIGTERM] {
            let _ = libc::sigaddset(&raw mut set, sig);
        }
        let _ = libc::sigprocmask(libc::SIG_BLOCK, &raw const set, std::ptr::null_mut());
        loop {
            let mut sig = 0;
            if libc::sigwait(&raw const set, &raw mut sig) != 0 {
                continue;
            }
            if sig == libc::SIGCHLD {
                while libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) > 0 {}
            } else {
                libc::_exit(0);
            }
        }
    }
}

/// Body of the cloned container process.
unsafe fn child_main(plan: &ChildPlan, argv: &[*const libc::c_char], envp: &[*const libc::c_char]) -> ! {
    // SAFETY: only raw system calls on descriptors and C strings owned by
    // `plan`, which stays alive in the child's copy of the address space.
    unsafe {
        for ns in &plan.joined {
            if libc::setns(ns.raw_fd(), ns.nstype()) < 0 {
                fail(plan.sync_fd, ChildStage::Namespaces);
            }
        }

        let sync = libc::fcntl(plan.sync_fd, libc::F_DUPFD_CLOEXEC, 3);
        if sync < 0 {
            fail(plan.sync_fd, ChildStage::Sync);
        }

        if plan.pty {
            let slave = plan.stdio[0];
            if libc::setsid() < 0 || libc::ioctl(slave, libc::TIOCSCTTY, 0) < 0 {
                fail(sync, ChildStage::Stdio);
            }
        }
        for (target, &fd) in (0..).zip(plan.stdio.iter()) {
            if libc::dup2(fd, target) < 0 {
                fail(sync, ChildStage::Stdio);
            }
        }
        close_stray_fds(sync);

        if let Some(rootfs) = &plan.rootfs {
            if libc::chroot(rootfs.as_ptr()) < 0 {
                fail(sync, ChildStage::Rootfs);
            }
        }
        if libc::chdir(plan.cwd.as_ptr()) < 0 {
            fail(sync, ChildStage::Cwd);
        }
        if let Some(name) = &plan.hostname {
            if libc::sethostname(name.as_ptr(), name.as_bytes().len()) < 0 {
                fail(sync, ChildStage::Hostname);
            }
        }

        let ready = READY;
        if libc::write(sync, (&raw const ready).cast(), 1) != 1 {
            fail(sync, ChildStage::Sync);
        }
        let mut byte = 0u8;
        if libc::read(sync, (&raw mut byte).cast(), 1) != 1 || byte != START {
            fail(sync, ChildStage::Sync);
        }

        if plan.empty {
            let _ = libc::close(sync);
            pause_forever();
        }

        if libc::setgroups(plan.groups.len(), plan.groups.as_ptr()) < 0 && !plan.groups.is_empty() {
            fail(sync, ChildStage::Identity);
        }
        if libc::getgid() != plan.gid && libc::setgid(plan.gid) < 0 {
            fail(sync, ChildStage::Identity);
        }
        if libc::getuid() != plan.uid && libc::setuid(plan.uid) < 0 {
            fail(sync, ChildStage::Identity);
        }
        if plan.no_new_privs && libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) < 0 {
            fail(sync, ChildStage::Identity);
        }

        let _ = libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        let mut unblock: libc::sigset_t = std::mem::zeroed();
        let _ = libc::sigemptyset(&raw mut unblock);
        let _ = libc::sigprocmask(libc::SIG_SETMASK, &raw const unblock, std::ptr::null_mut());

        let _ = libc::execve(plan.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
        fail(sync, ChildStage::Exec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(args: &[&str], env: &[&str]) -> Process {
        Process {
            args: args.iter().map(ToString::to_string).collect(),
            env: env.iter().map(ToString::to_string).collect(),
            ..Process::default()
        }
    }

    #[test]
    fn absolute_program_is_kept() {
        let p = process(&["/bin/true"], &[]);
        assert_eq!(resolve_program(&p, Path::new("/")).expect("resolve"), PathBuf::from("/bin/true"));
    }

    #[test]
    fn program_is_resolved_inside_rootfs() {
        let root = tempfile::tempdir().expect("tempdir");
        let bin = root.path().join("opt/app");
        std::fs::create_dir_all(&bin).expect("mkdir");
        let exe = bin.join("serve");
        std::fs::write(&exe, "#!/bin/sh\n").expect("write");
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        }

        let p = process(&["serve"], &["PATH=/usr/bin:/opt/app"]);
        let resolved = resolve_program(&p, root.path()).expect("resolve");
        assert_eq!(resolved, PathBuf::from("/opt/app/serve"));
    }

    #[test]
    fn missing_program_is_process_error() {
        let root = tempfile::tempdir().expect("tempdir");
        let p = process(&["definitely-not-here"], &[]);
        assert!(matches!(
            resolve_program(&p, root.path()),
            Err(OciboxError::Process { .. })
        ));
    }

    #[tokio::test]
    async fn pipe_stdio_has_matching_ends() {
        let (parent, child) = setup_stdio(false, None).expect("stdio");
        assert!(parent.pty().is_none());
        assert!(matches!(child, ChildStdio::Pipes { .. }));
    }
}
