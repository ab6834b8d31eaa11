//! Engine operations: the CLI-facing container lifecycle API.
//!
//! Every operation reads the instance record, checks the status guard and
//! then either talks to the container's master over its control socket
//! or acts on the container directly (signals, exec, cgroup updates).
//! Record writes belong to the master alone, except for creating the
//! record and deleting it.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use ocibox_common::config::RuntimeConfig;
use ocibox_common::constants::DEFAULT_LOG_FILE;
use ocibox_common::error::{OciboxError, Result};
use ocibox_common::spec::{LinuxResources, Spec};
use ocibox_common::types::{ContainerId, Control, LogFormat, State, Status};
use ocibox_core::cgroup::CgroupManager;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

use crate::config::{EngineConfig, EngineKind};
use crate::control;
use crate::exec;
use crate::instance::{Instance, InstanceStore, ListFilter};
use crate::master::{self, Detach};

/// Interval between record polls while waiting for a status.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Upper bound on waiting for the master to finish cleanup.
const MASTER_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// How the master of a new container is started.
#[derive(Debug, Clone)]
pub enum Launcher {
    /// Re-execute `program master <id>` as a detached process.
    Exec {
        /// Path of the `ocibox` binary.
        program: PathBuf,
    },
    /// Run the master as a task on the current tokio runtime.
    Task,
}

/// Parameters of `create`.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Bundle directory containing `config.json`.
    pub bundle: PathBuf,
    /// Log file; defaults to `container.log` in the instance directory.
    pub log_path: Option<PathBuf>,
    /// Log format; defaults to the runtime's default format.
    pub log_format: Option<LogFormat>,
    /// File receiving the container PID.
    pub pid_file: Option<PathBuf>,
    /// Park a placeholder process instead of executing `process.args`.
    pub empty_process: bool,
    /// Socket receiving every state transition instead of stdout.
    pub sync_socket: Option<PathBuf>,
}

/// Where `update` reads its resource document from.
#[derive(Debug, Clone)]
pub enum ResourceSource {
    /// A JSON file.
    File(PathBuf),
    /// Standard input.
    Stdin,
}

/// One line printed by a re-executed master before it detaches.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MasterLine {
    Failed { error: String },
    State(Box<State>),
}

/// The container lifecycle engine.
#[derive(Debug, Clone)]
pub struct Engine {
    config: RuntimeConfig,
    store: InstanceStore,
    launcher: Launcher,
}

fn invalid(state: &State, operation: &'static str) -> OciboxError {
    OciboxError::InvalidTransition {
        id: state.id.clone(),
        status: state.status.to_string(),
        operation,
    }
}

fn signal_pid(pid: i32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(OciboxError::PermissionDenied {
            message: format!("cannot send {signal} to {pid}: {e}"),
        }),
    }
}

fn pid_alive(pid: i32) -> bool {
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

impl Engine {
    /// Opens the engine over a runtime directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance store cannot be created.
    pub fn new(config: RuntimeConfig, launcher: Launcher) -> Result<Self> {
        let store = InstanceStore::open(&config.runtime_dir)?;
        Ok(Self {
            config,
            store,
            launcher,
        })
    }

    /// The instance store.
    #[must_use]
    pub const fn store(&self) -> &InstanceStore {
        &self.store
    }

    /// The runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn control_socket(&self, state: &State) -> Result<PathBuf> {
        state.control_socket.clone().ok_or_else(|| OciboxError::NotFound {
            kind: "control socket",
            id: state.id.clone(),
        })
    }

    /// Creates a container and returns its state once it is `Created`.
    ///
    /// # Errors
    ///
    /// Returns [`OciboxError::AlreadyExists`] for a taken ID, a
    /// configuration error for a bad bundle (no record is written), or the
    /// master's creation error (the record is removed again).
    pub async fn create(&self, id: &ContainerId, opts: CreateOptions) -> Result<State> {
        if self.store.exists(id.as_str()) {
            return Err(OciboxError::AlreadyExists { id: id.to_string() });
        }
        let bundle = opts
            .bundle
            .canonicalize()
            .map_err(|e| OciboxError::config(format!("bundle {}: {e}", opts.bundle.display())))?;
        let spec = Spec::load(&bundle, opts.empty_process)?;
        let state = State::new(id, bundle.clone(), spec.annotations.clone());

        let config = EngineConfig {
            log_path: opts
                .log_path
                .unwrap_or_else(|| self.store.instance_dir(id.as_str()).join(DEFAULT_LOG_FILE)),
            log_format: opts.log_format.unwrap_or(self.config.default_log_format),
            pid_file: opts.pid_file,
            bundle,
            spec,
            state,
            sync_socket: opts.sync_socket,
            empty_process: opts.empty_process,
            cgroup: None,
        };
        self.store.add(&Instance::new(EngineKind::Oci, &config)?)?;
        tracing::info!(id = %id, bundle = %config.bundle.display(), "container record written");

        if let Err(e) = self.launch(id).await {
            if self.state(id.as_str()).is_ok_and(|s| s.status == Status::Creating) {
                let _ = self.store.delete(id.as_str());
            }
            return Err(e);
        }
        let state = self.state(id.as_str())?;
        if state.status == Status::Creating {
            return Err(OciboxError::Process {
                message: format!("master for {id} detached before the container was created"),
            });
        }
        Ok(state)
    }

    async fn launch(&self, id: &ContainerId) -> Result<()> {
        match &self.launcher {
            Launcher::Task => {
                let (tx, rx) = oneshot::channel();
                let _ = tokio::spawn(master::run(self.config.clone(), id.to_string(), Detach::Channel(tx)));
                rx.await.map_err(|_| OciboxError::Process {
                    message: "master exited before detaching".into(),
                })?
            }
            Launcher::Exec { program } => self.launch_process(program, id).await,
        }
    }

    /// Starts `program master <id>` in a new session and relays its
    /// output until it detaches.
    async fn launch_process(&self, program: &Path, id: &ContainerId) -> Result<()> {
        let master_log = self.store.instance_dir(id.as_str()).join("master.log");
        let stderr = std::fs::File::create(&master_log).map_err(|e| OciboxError::io(&master_log, e))?;

        let mut cmd = tokio::process::Command::new(program);
        let _ = cmd
            .arg("--runtime-dir")
            .arg(&self.config.runtime_dir)
            .arg("--cgroup-root")
            .arg(&self.config.cgroup_root)
            .arg("master")
            .arg(id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr);
        // SAFETY: setsid is async-signal-safe.
        unsafe {
            let _ = cmd.pre_exec(|| {
                let _ = nix::unistd::setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| OciboxError::Process {
            message: format!("cannot launch master {}: {e}", program.display()),
        })?;
        tracing::debug!(id = %id, master = child.id(), "master launched");

        let Some(stdout) = child.stdout.take() else {
            return Err(OciboxError::Process {
                message: "master stdout unavailable".into(),
            });
        };
        let mut lines = BufReader::new(stdout).lines();
        let mut failure = None;
        while let Some(line) = lines.next_line().await.map_err(|e| OciboxError::ipc("master output", e))? {
            match serde_json::from_str::<MasterLine>(&line) {
                Ok(MasterLine::Failed { error }) => failure = Some(error),
                Ok(MasterLine::State(state)) => {
                    tracing::debug!(id = %state.id, status = %state.status, "master reported state");
                }
                Err(e) => tracing::warn!(error = %e, line = %line, "unrecognised master output"),
            }
        }
        match failure {
            Some(message) => Err(OciboxError::Process { message }),
            None => Ok(()),
        }
    }

    /// Current state of a container.
    ///
    /// # Errors
    ///
    /// Returns [`OciboxError::NotFound`] for an unknown ID.
    pub fn state(&self, id: &str) -> Result<State> {
        self.store.get(id)?.state()
    }

    /// Releases a `Created` container.
    ///
    /// # Errors
    ///
    /// Returns [`OciboxError::InvalidTransition`] unless the container is
    /// `Created`, or the master's rejection.
    pub async fn start(&self, id: &str) -> Result<()> {
        let state = self.state(id)?;
        if state.status != Status::Created {
            return Err(invalid(&state, "start"));
        }
        control::send(&self.control_socket(&state)?, Control::Start).await?;
        tracing::info!(id, "container started");
        Ok(())
    }

    /// Sends `signal` to the container process. With a grace period, waits
    /// for the container to stop and sends `SIGKILL` when it does not.
    ///
    /// # Errors
    ///
    /// Returns [`OciboxError::InvalidTransition`] unless the container is
    /// `Created` or `Running`, or an error if the signal cannot be sent.
    pub async fn kill(&self, id: &str, signal: Signal, grace: Option<Duration>) -> Result<()> {
        let state = self.state(id)?;
        if !matches!(state.status, Status::Created | Status::Running) {
            return Err(invalid(&state, "kill"));
        }
        let pid = state.pid.ok_or_else(|| invalid(&state, "kill"))?;
        tracing::info!(id, pid, signal = %signal, "signalling container");
        signal_pid(pid, signal)?;

        if let Some(grace) = grace {
            if tokio::time::timeout(grace, self.wait(id, Status::Stopped)).await.is_err() {
                tracing::warn!(id, pid, grace_secs = grace.as_secs_f64(), "grace period elapsed, sending SIGKILL");
                self.announce_escalation(&state, signal, grace).await;
                signal_pid(pid, Signal::SIGKILL)?;
                let _ = self.wait_bounded(id, Status::Stopped, self.config.kill_timeout).await?;
            }
        }
        Ok(())
    }

    /// Tells the master why the `SIGKILL` that follows was sent, so the
    /// stop description can name it. The kill proceeds either way.
    async fn announce_escalation(&self, state: &State, signal: Signal, grace: Duration) {
        let message = Control::Escalate {
            signal: signal as i32,
            grace_ms: u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
        };
        let sent = match self.control_socket(state) {
            Ok(socket) => control::send(&socket, message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::debug!(id = %state.id, error = %e, "master did not take the escalation notice");
        }
    }

    /// Deletes a `Stopped` or `Created` container and every artifact it
    /// left behind. A `Created` container is killed first.
    ///
    /// # Errors
    ///
    /// Returns [`OciboxError::InvalidTransition`] for any other status.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let instance = self.store.get(id)?;
        let config = instance.engine_config()?;
        let state = &config.state;
        match state.status {
            Status::Stopped => {}
            Status::Created => {
                if let Some(pid) = state.pid {
                    signal_pid(pid, Signal::SIGKILL)?;
                }
                let _ = self.wait_bounded(id, Status::Stopped, self.config.kill_timeout).await?;
            }
            Status::Creating if !instance.ppid.is_some_and(pid_alive) => {
                tracing::warn!(id, "removing record left by a dead master");
            }
            _ => return Err(invalid(state, "delete")),
        }

        if let Some(socket) = &state.control_socket {
            self.wait_master_done(socket).await;
        }
        if let Some(cgroup) = &config.cgroup {
            if cgroup.exists() {
                if let Err(e) = CgroupManager::open(cgroup.clone()).destroy() {
                    tracing::warn!(id, error = %e, "leftover cgroup removal failed");
                }
            }
        }
        self.store.delete(id)?;
        tracing::info!(id, "container deleted");
        Ok(())
    }

    /// Waits until the master has removed its control socket.
    async fn wait_master_done(&self, control_socket: &Path) {
        let deadline = tokio::time::Instant::now() + MASTER_EXIT_TIMEOUT;
        while control_socket.exists() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Polls the record until the container reaches `status`.
    ///
    /// # Errors
    ///
    /// Returns [`OciboxError::NotFound`] if the record disappears.
    pub async fn wait(&self, id: &str, status: Status) -> Result<State> {
        loop {
            let state = self.state(id)?;
            if state.status == status {
                return Ok(state);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_bounded(&self, id: &str, status: Status, limit: Duration) -> Result<State> {
        tokio::time::timeout(limit, self.wait(id, status))
            .await
            .map_err(|_| OciboxError::Process {
                message: format!("container {id} did not reach {status} within {}s", limit.as_secs()),
            })?
    }

    /// Connects to the container's attach socket.
    ///
    /// # Errors
    ///
    /// Returns an IPC error if the master is not accepting attach clients.
    pub async fn connect_attach(&self, id: &str) -> Result<UnixStream> {
        let state = self.state(id)?;
        if matches!(state.status, Status::Creating | Status::Stopped) {
            return Err(invalid(&state, "attach"));
        }
        let socket = state.attach_socket.ok_or_else(|| OciboxError::NotFound {
            kind: "attach socket",
            id: id.to_string(),
        })?;
        UnixStream::connect(&socket)
            .await
            .map_err(|e| OciboxError::ipc(format!("attach socket {}", socket.display()), e))
    }

    /// Attaches the caller's stdio to the container until its output ends.
    ///
    /// # Errors
    ///
    /// Returns an IPC error if the attach socket is unreachable.
    pub async fn attach(&self, id: &str, forward_stdin: bool) -> Result<()> {
        let stream = self.connect_attach(id).await?;
        relay(stream, forward_stdin).await
    }

    /// Runs a command inside a `Running` container and returns its exit
    /// code.
    ///
    /// # Errors
    ///
    /// Returns [`OciboxError::InvalidTransition`] unless the container is
    /// `Running`, or the spawn error.
    pub async fn exec(&self, id: &str, args: Vec<String>) -> Result<i32> {
        let config = self.store.get(id)?.engine_config()?;
        if config.state.status != Status::Running {
            return Err(invalid(&config.state, "exec"));
        }
        let pid = config.state.pid.ok_or_else(|| invalid(&config.state, "exec"))?;
        tokio::task::spawn_blocking(move || exec::run(&config, pid, &args))
            .await
            .map_err(|e| OciboxError::Process {
                message: format!("exec task failed: {e}"),
            })?
    }

    /// Applies new resource limits to the container cgroup.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unreadable document, or a cgroup
    /// error if the container has no cgroup.
    pub async fn update(&self, id: &str, source: ResourceSource) -> Result<()> {
        let config = self.store.get(id)?.engine_config()?;
        if matches!(config.state.status, Status::Creating | Status::Stopped) {
            return Err(invalid(&config.state, "update"));
        }
        let raw = match &source {
            ResourceSource::File(path) => std::fs::read(path).map_err(|e| OciboxError::io(path, e))?,
            ResourceSource::Stdin => tokio::task::spawn_blocking(|| {
                let mut buf = Vec::new();
                std::io::stdin().read_to_end(&mut buf).map(|_| buf)
            })
            .await
            .map_err(|e| OciboxError::Process {
                message: format!("stdin task failed: {e}"),
            })?
            .map_err(|e| OciboxError::io("<stdin>", e))?,
        };
        let resources: LinuxResources = serde_json::from_slice(&raw)
            .map_err(|e| OciboxError::config(format!("invalid resources document: {e}")))?;
        let cgroup = config.cgroup.ok_or_else(|| OciboxError::Cgroup {
            path: PathBuf::new(),
            message: format!("container {id} has no cgroup"),
        })?;
        CgroupManager::open(cgroup).update(&resources)?;
        tracing::info!(id, "resources updated");
        Ok(())
    }

    /// Freezes a `Running` container.
    ///
    /// # Errors
    ///
    /// Returns [`OciboxError::InvalidTransition`] unless `Running`.
    pub async fn pause(&self, id: &str) -> Result<()> {
        self.send_when(id, &[Status::Running], "pause", Control::Pause).await
    }

    /// Thaws a `Paused` container.
    ///
    /// # Errors
    ///
    /// Returns [`OciboxError::InvalidTransition`] unless `Paused`.
    pub async fn resume(&self, id: &str) -> Result<()> {
        self.send_when(id, &[Status::Paused], "resume", Control::Resume).await
    }

    /// Changes the container terminal's geometry.
    ///
    /// # Errors
    ///
    /// Returns an error if the master is unreachable.
    pub async fn resize(&self, id: &str, width: u16, height: u16) -> Result<()> {
        self.send_when(
            id,
            &[Status::Created, Status::Running, Status::Paused],
            "resize",
            Control::ConsoleResize { width, height },
        )
        .await
    }

    /// Makes the master reopen the container log file.
    ///
    /// # Errors
    ///
    /// Returns an error if the master is unreachable or cannot reopen.
    pub async fn reopen_log(&self, id: &str) -> Result<()> {
        self.send_when(
            id,
            &[Status::Created, Status::Running, Status::Paused],
            "reopen log of",
            Control::ReopenLog,
        )
        .await
    }

    async fn send_when(&self, id: &str, allowed: &[Status], operation: &'static str, message: Control) -> Result<()> {
        let state = self.state(id)?;
        if !allowed.contains(&state.status) {
            return Err(invalid(&state, operation));
        }
        control::send(&self.control_socket(&state)?, message).await
    }

    /// Lists container records.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Instance>> {
        self.store.list(filter)
    }

    /// Creates, attaches to, starts and deletes a container, returning its
    /// exit code. On failure after the record exists, the container is
    /// killed and deleted before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first error of the sequence.
    pub async fn run(&self, id: &ContainerId, mut opts: CreateOptions, forward_stdin: bool) -> Result<i32> {
        let socket = self.config.runtime_dir.join(format!("{id}-run.sock"));
        let _ = std::fs::remove_file(&socket);
        let listener = UnixListener::bind(&socket).map_err(|e| OciboxError::ipc("run sync socket", e))?;
        let (tx, mut states) = mpsc::channel(16);
        let collector = tokio::spawn(collect_states(listener, tx));
        opts.sync_socket = Some(socket.clone());

        let result = self.run_inner(id, opts, &mut states, forward_stdin).await;
        collector.abort();
        let _ = std::fs::remove_file(&socket);

        if result.is_err() && self.store.exists(id.as_str()) {
            tracing::warn!(id = %id, "run failed, removing container");
            let _ = self.kill(id.as_str(), Signal::SIGKILL, None).await;
            let _ = self.wait_bounded(id.as_str(), Status::Stopped, self.config.kill_timeout).await;
            if let Err(e) = self.delete(id.as_str()).await {
                tracing::warn!(id = %id, error = %e, "cleanup after failed run incomplete");
            }
        }
        result
    }

    async fn run_inner(
        &self,
        id: &ContainerId,
        opts: CreateOptions,
        states: &mut mpsc::Receiver<State>,
        forward_stdin: bool,
    ) -> Result<i32> {
        let _ = self.create(id, opts).await?;
        let stream = self.connect_attach(id.as_str()).await?;
        let streaming = tokio::spawn(relay(stream, forward_stdin));
        self.start(id.as_str()).await?;

        let stopped = loop {
            match states.recv().await {
                Some(state) if state.status == Status::Stopped => break state,
                Some(state) => tracing::debug!(id = %id, status = %state.status, "run observed state"),
                None => {
                    return Err(OciboxError::Process {
                        message: "sync socket closed before the container stopped".into(),
                    });
                }
            }
        };
        if let Ok(Err(e)) = streaming.await {
            tracing::warn!(id = %id, error = %e, "attach stream failed");
        }
        self.delete(id.as_str()).await?;
        Ok(stopped.exit_code.unwrap_or(255))
    }
}

/// Accepts sync socket connections and forwards every state they carry.
async fn collect_states(listener: UnixListener, tx: mpsc::Sender<State>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<State>(&line) {
                Ok(state) => {
                    if tx.send(state).await.is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "malformed state on sync socket"),
            }
        }
    }
}

/// Copies attach output to stdout until it ends, and optionally stdin to
/// the container.
async fn relay(stream: UnixStream, forward_stdin: bool) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let input = forward_stdin.then(|| {
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = vec![0u8; 8 * 1024];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if writer.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    });

    let mut stdout = tokio::io::stdout();
    let copied = tokio::io::copy(&mut reader, &mut stdout).await;
    let _ = stdout.flush().await;
    if let Some(input) = input {
        input.abort();
    }
    let _ = copied.map_err(|e| OciboxError::ipc("attach stream", e))?;
    Ok(())
}
