//! Master process lifecycle.
//!
//! The master owns one container from `Creating` to `Stopped`. It sets up
//! the cgroup, stdio and sockets, spawns the container process, commits
//! `Created`, runs prestart hooks and then detaches from its caller. From
//! there a single control loop serves control messages until the monitor
//! reports the container's exit, after which the master cleans up.

use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use ocibox_common::config::RuntimeConfig;
use ocibox_common::constants::{ATTACH_SOCKET, CONTROL_SOCKET};
use ocibox_common::error::{OciboxError, Result};
use ocibox_common::spec::{Hooks, NamespaceType};
use ocibox_common::types::{Control, ControlReply, Status};
use ocibox_core::cgroup::CgroupManager;
use ocibox_core::namespace;
use ocibox_core::signal::{describe_escalation, describe_exit};
use ocibox_core::terminal;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;

use crate::control::{read_frame, write_frame};
use crate::handshake::SyncPipe;
use crate::hooks::{self, HookPoint};
use crate::instance::InstanceStore;
use crate::logs::LogWriter;
use crate::process;
use crate::streams::{Multiplexer, ParentStdio, PtyMaster};
use crate::sync::StateSync;

/// How long output may stay open after the container exits.
const STREAM_GRACE: Duration = Duration::from_secs(2);
/// How long a control client may take to send its request.
const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How the master tells its caller that creation finished.
#[derive(Debug)]
pub enum Detach {
    /// Re-executed master: success closes stdout, failure prints
    /// `{"error": ...}` on it.
    Stdio,
    /// In-process master: the result is sent on the channel.
    Channel(oneshot::Sender<Result<()>>),
}

impl Detach {
    fn report(self, result: Result<()>) -> Result<()> {
        match self {
            Self::Stdio => {
                let mut out = std::io::stdout().lock();
                match &result {
                    Ok(()) => {
                        let _ = out.flush();
                        drop(out);
                        redirect_stdout_to_null();
                    }
                    Err(e) => {
                        let line = serde_json::json!({ "error": e.to_string() });
                        let _ = writeln!(out, "{line}").and_then(|()| out.flush());
                    }
                }
                result
            }
            Self::Channel(tx) => match tx.send(result) {
                Err(Err(e)) => Err(e),
                _ => Ok(()),
            },
        }
    }
}

fn redirect_stdout_to_null() {
    match std::fs::OpenOptions::new().write(true).open("/dev/null") {
        Ok(null) => {
            if let Err(e) = nix::unistd::dup2_stdout(&null) {
                tracing::warn!(error = %e, "cannot detach stdout");
            }
        }
        Err(e) => tracing::warn!(error = %e, "cannot open /dev/null"),
    }
}

/// Runs the master for container `id` until the container has stopped
/// and been cleaned up.
///
/// # Errors
///
/// Returns the creation error (after reporting it through `detach`, and
/// after removing everything created so far including the record).
pub async fn run(runtime: RuntimeConfig, id: String, detach: Detach) -> Result<()> {
    let sync = InstanceStore::open(&runtime.runtime_dir).and_then(|store| StateSync::load(store, &id));
    let mut sync = match sync {
        Ok(sync) => sync,
        Err(e) => return detach.report(Err(e)),
    };

    let mut setup = Setup::default();
    match create(&runtime, &mut sync, &mut setup).await {
        Ok(container) => {
            tracing::info!(id = %id, pid = container.pid.as_raw(), "container created, detaching");
            detach.report(Ok(()))?;
            container.serve(sync).await
        }
        Err(e) => {
            tracing::warn!(id = %id, error = %e, "create failed, rolling back");
            setup.rollback(sync).await;
            detach.report(Err(e))
        }
    }
}

/// Resources acquired during creation, released if creation fails.
#[derive(Debug, Default)]
struct Setup {
    pid: Option<Pid>,
    exit: Option<oneshot::Receiver<WaitStatus>>,
    cgroup: Option<CgroupManager>,
    sockets: Vec<PathBuf>,
    pid_file: Option<PathBuf>,
}

impl Setup {
    async fn rollback(self, sync: StateSync) {
        if let Some(pid) = self.pid {
            let _ = kill(pid, Signal::SIGKILL);
            match self.exit {
                Some(exit) => {
                    let _ = exit.await;
                }
                None => {
                    let _ = waitpid(pid, None);
                }
            }
        }
        remove_files(&self.sockets);
        if let Some(path) = &self.pid_file {
            remove_files(std::slice::from_ref(path));
        }
        if let Some(cgroup) = &self.cgroup {
            if let Err(e) = cgroup.destroy() {
                tracing::warn!(error = %e, "cgroup removal failed");
            }
        }
        if let Err(e) = sync.remove() {
            tracing::warn!(error = %e, "record removal failed");
        }
    }
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "cannot remove file");
            }
        }
    }
}

/// Waits for the container process in a blocking task.
fn monitor(pid: Pid) -> oneshot::Receiver<WaitStatus> {
    let (tx, rx) = oneshot::channel();
    let _ = tokio::task::spawn_blocking(move || {
        loop {
            match waitpid(pid, None) {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    tracing::debug!(pid = pid.as_raw(), ?status, "container process exited");
                    let _ = tx.send(status);
                    return;
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    tracing::warn!(pid = pid.as_raw(), error = %e, "waitpid failed");
                    return;
                }
            }
        }
    });
    rx
}

fn own_pid() -> Result<i32> {
    i32::try_from(std::process::id()).map_err(|_| OciboxError::Process {
        message: "process id out of range".into(),
    })
}

/// Brings the container to `Created` and runs prestart hooks.
async fn create(runtime: &RuntimeConfig, sync: &mut StateSync, setup: &mut Setup) -> Result<Container> {
    sync.set_master(own_pid()?)?;
    let config = sync.config().clone();
    let id = config.state.id.clone();
    let spec = &config.spec;

    let cgroups_path = spec.linux.as_ref().and_then(|l| l.cgroups_path.as_deref());
    let resources = spec.resources().filter(|r| !r.is_empty());
    let cgroup_path = CgroupManager::resolve(&runtime.cgroup_root, &id, cgroups_path);
    match CgroupManager::create(cgroup_path) {
        Ok(cgroup) => {
            let cgroup = setup.cgroup.insert(cgroup);
            if let Some(resources) = resources {
                cgroup.apply(resources)?;
            }
        }
        Err(e) if resources.is_none() && cgroups_path.is_none() => {
            tracing::warn!(id = %id, error = %e, "no cgroup for container, pause and resume unavailable");
        }
        Err(e) => return Err(e),
    }
    if let Some(cgroup) = &setup.cgroup {
        sync.set_cgroup(cgroup.path().to_path_buf())?;
    }

    let console = spec.process.as_ref().and_then(|p| p.console_size);
    let (parent_stdio, child_stdio) = process::setup_stdio(config.terminal(), console)?;
    let log = Arc::new(LogWriter::open(&config.log_path, config.log_format)?);

    let (pid, mut pipe) = process::spawn(&config, child_stdio)?;
    setup.pid = Some(pid);
    setup.exit = Some(monitor(pid));
    sync.set_pid(pid.as_raw())?;

    if let Some(cgroup) = &setup.cgroup {
        cgroup.add_process(pid.as_raw())?;
    }
    if namespace::creates(spec.namespaces(), NamespaceType::User) {
        if let Some(linux) = &spec.linux {
            namespace::user::write_id_mappings(pid.as_raw(), &linux.uid_mappings, &linux.gid_mappings)?;
        }
    }
    if let Some(path) = &config.pid_file {
        std::fs::write(path, pid.as_raw().to_string()).map_err(|e| OciboxError::io(path, e))?;
        setup.pid_file = Some(path.clone());
    }

    pipe.wait_ready().await?;

    let dir = sync.store().instance_dir(&id);
    let attach_path = dir.join(ATTACH_SOCKET);
    let control_path = dir.join(CONTROL_SOCKET);
    remove_files(&[attach_path.clone(), control_path.clone()]);
    let attach = StdUnixListener::bind(&attach_path).map_err(|e| OciboxError::ipc("attach socket", e))?;
    setup.sockets.push(attach_path.clone());
    let control = UnixListener::bind(&control_path).map_err(|e| OciboxError::ipc("control socket", e))?;
    setup.sockets.push(control_path.clone());

    sync.transition(Status::Created, |state| {
        state.pid = Some(pid.as_raw());
        state.attach_socket = Some(attach_path);
        state.control_socket = Some(control_path);
    })
    .await?;

    let hooks = spec.hooks.clone().unwrap_or_default();
    hooks::run_hooks(HookPoint::Prestart, &hooks.prestart, sync.state()).await?;

    let pty = parent_stdio.pty().cloned();
    Ok(Container {
        pid,
        pipe,
        stdio: Some(parent_stdio),
        pty,
        attach: Some(attach),
        control,
        log,
        mux: None,
        exit: setup.exit.take(),
        cgroup: setup.cgroup.take(),
        sockets: std::mem::take(&mut setup.sockets),
        pid_file: setup.pid_file.take(),
        hooks,
        fatal: None,
        escalation: None,
    })
}

/// A created container served by the control loop.
#[derive(Debug)]
struct Container {
    pid: Pid,
    pipe: SyncPipe,
    stdio: Option<ParentStdio>,
    pty: Option<Arc<PtyMaster>>,
    attach: Option<StdUnixListener>,
    control: UnixListener,
    log: Arc<LogWriter>,
    mux: Option<Multiplexer>,
    exit: Option<oneshot::Receiver<WaitStatus>>,
    cgroup: Option<CgroupManager>,
    sockets: Vec<PathBuf>,
    pid_file: Option<PathBuf>,
    hooks: Hooks,
    /// Exec failure reported by the container process, if any.
    fatal: Option<String>,
    /// Signal and grace period of a pending kill escalation.
    escalation: Option<(Signal, Duration)>,
}

fn require(sync: &StateSync, status: Status, operation: &'static str) -> Result<()> {
    let current = sync.state().status;
    if current == status {
        Ok(())
    } else {
        Err(OciboxError::InvalidTransition {
            id: sync.state().id.clone(),
            status: current.to_string(),
            operation,
        })
    }
}

impl Container {
    /// Serves control messages until the container exits, then cleans up.
    async fn serve(mut self, mut sync: StateSync) -> Result<()> {
        let Some(mut exit) = self.exit.take() else {
            return Err(OciboxError::Process {
                message: "container monitor missing".into(),
            });
        };
        let status = loop {
            tokio::select! {
                status = &mut exit => break status.ok(),
                accepted = self.control.accept() => match accepted {
                    Ok((stream, _)) => self.handle(stream, &mut sync).await,
                    Err(e) => tracing::warn!(error = %e, "control accept failed"),
                },
            }
        };
        self.cleanup(sync, status).await;
        Ok(())
    }

    /// Answers one control connection.
    async fn handle(&mut self, mut stream: UnixStream, sync: &mut StateSync) {
        let message: Control = match tokio::time::timeout(CONTROL_READ_TIMEOUT, read_frame(&mut stream)).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "bad control request");
                let _ = write_frame(&mut stream, &ControlReply::failed(e.to_string())).await;
                return;
            }
            Err(_) => {
                tracing::warn!("control client sent nothing");
                return;
            }
        };
        tracing::info!(id = %sync.state().id, message = message.name(), "control message");

        let result = self.dispatch(message, sync).await;
        let reply = match &result {
            Ok(()) => ControlReply::ok(),
            Err(e) => {
                tracing::warn!(message = message.name(), error = %e, "control request failed");
                ControlReply::failed(e.to_string())
            }
        };
        if let Err(e) = write_frame(&mut stream, &reply).await {
            tracing::warn!(error = %e, "cannot answer control request");
        }

        if message == Control::Start && result.is_ok() {
            hooks::run_hooks_best_effort(HookPoint::Poststart, &self.hooks.poststart, sync.state()).await;
        }
    }

    async fn dispatch(&mut self, message: Control, sync: &mut StateSync) -> Result<()> {
        match message {
            Control::Start => self.start(sync).await,
            Control::Pause => {
                require(sync, Status::Running, "pause")?;
                self.set_frozen("pause", true).await?;
                sync.transition(Status::Paused, |_| {}).await
            }
            Control::Resume => {
                require(sync, Status::Paused, "resume")?;
                self.set_frozen("resume", false).await?;
                sync.transition(Status::Running, |_| {}).await
            }
            Control::ConsoleResize { width, height } => match &self.pty {
                Some(pty) => terminal::resize(pty.as_fd(), width, height),
                None => Ok(()),
            },
            Control::ReopenLog => self.log.reopen(),
            Control::Escalate { signal, grace_ms } => {
                let signal = Signal::try_from(signal).map_err(|e| OciboxError::Rejected {
                    message: format!("invalid signal {signal}: {e}"),
                })?;
                self.escalation = Some((signal, Duration::from_millis(grace_ms)));
                Ok(())
            }
        }
    }

    fn cgroup(&self, operation: &str) -> Result<&CgroupManager> {
        self.cgroup.as_ref().ok_or_else(|| OciboxError::Cgroup {
            path: PathBuf::new(),
            message: format!("container has no cgroup, cannot {operation}"),
        })
    }

    /// Drives the freezer off the async workers; it polls until settled.
    async fn set_frozen(&self, operation: &str, frozen: bool) -> Result<()> {
        let cgroup = self.cgroup(operation)?.clone();
        tokio::task::spawn_blocking(move || if frozen { cgroup.freeze() } else { cgroup.thaw() })
            .await
            .map_err(|e| OciboxError::Process {
                message: format!("freezer task failed: {e}"),
            })?
    }

    /// Activates streaming, releases the container process and commits
    /// `Running` once it has executed.
    async fn start(&mut self, sync: &mut StateSync) -> Result<()> {
        require(sync, Status::Created, "start")?;
        let (Some(listener), Some(stdio)) = (self.attach.take(), self.stdio.take()) else {
            return Err(OciboxError::InvalidTransition {
                id: sync.state().id.clone(),
                status: sync.state().status.to_string(),
                operation: "start",
            });
        };
        self.mux = Some(Multiplexer::activate(listener, stdio, Arc::clone(&self.log))?);

        self.pipe.release().await?;
        if let Err(e) = self.pipe.wait_exec().await {
            self.fatal = Some(e.to_string());
            return Err(e);
        }
        sync.transition(Status::Running, |_| {}).await
    }

    /// Commits `Stopped`, runs poststop hooks and removes every artifact
    /// except the record.
    async fn cleanup(mut self, mut sync: StateSync, status: Option<WaitStatus>) {
        if let Some(mux) = self.mux.take() {
            mux.finish(STREAM_GRACE).await;
        }
        drop(self.stdio.take());
        drop(self.attach.take());

        let (code, desc) = status.and_then(describe_exit).unzip();
        let desc = match (status, self.escalation) {
            (Some(WaitStatus::Signaled(_, Signal::SIGKILL, _)), Some((signal, grace))) => {
                Some(describe_escalation(signal, grace))
            }
            _ => desc,
        };
        let desc = self.fatal.take().or(desc);
        tracing::info!(id = %sync.state().id, pid = self.pid.as_raw(), exit_code = ?code, "container stopped");
        if let Err(e) = sync
            .transition(Status::Stopped, |state| {
                state.exit_code = code;
                state.exit_desc = desc;
            })
            .await
        {
            tracing::warn!(error = %e, "cannot commit stopped state");
        }

        hooks::run_hooks_best_effort(HookPoint::Poststop, &self.hooks.poststop, sync.state()).await;

        if let Some(cgroup) = &self.cgroup {
            if let Err(e) = cgroup.destroy() {
                tracing::warn!(error = %e, "cgroup removal failed");
            }
        }
        if let Some(path) = &self.pid_file {
            remove_files(std::slice::from_ref(path));
        }
        // The control socket goes last: its absence marks the master as done.
        remove_files(&self.sockets);
    }
}
