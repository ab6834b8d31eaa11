//! State synchronizer.
//!
//! Every lifecycle transition goes through [`StateSync::transition`]: the
//! new state is written to the instance record first and announced
//! afterwards, either on the sync socket or as a JSON line on stdout.

use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use ocibox_common::error::{OciboxError, Result};
use ocibox_common::types::{State, Status};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::config::EngineConfig;
use crate::instance::{Instance, InstanceStore};

/// Owner of one container's record and live state.
#[derive(Debug)]
pub struct StateSync {
    store: InstanceStore,
    instance: Instance,
    config: EngineConfig,
}

impl StateSync {
    /// Loads the record of `id` and decodes its engine configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or malformed.
    pub fn load(store: InstanceStore, id: &str) -> Result<Self> {
        let instance = store.get(id)?;
        let config = instance.engine_config()?;
        Ok(Self {
            store,
            instance,
            config,
        })
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &State {
        &self.config.state
    }

    /// Current engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Store the record lives in.
    #[must_use]
    pub const fn store(&self) -> &InstanceStore {
        &self.store
    }

    /// Records the master PID without announcing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn set_master(&mut self, ppid: i32) -> Result<()> {
        self.instance.ppid = Some(ppid);
        self.persist()
    }

    /// Records the container PID without announcing anything.
    ///
    /// The container is still `Creating` at this point.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn set_pid(&mut self, pid: i32) -> Result<()> {
        self.config.state.pid = Some(pid);
        self.persist()
    }

    /// Records the cgroup directory without announcing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn set_cgroup(&mut self, path: PathBuf) -> Result<()> {
        self.config.cgroup = Some(path);
        self.persist()
    }

    /// Moves to `status`, persists the record, then announces the state.
    ///
    /// `update` may fill in fields belonging to the transition (sockets,
    /// exit information); timestamps are set here.
    ///
    /// # Errors
    ///
    /// Returns [`OciboxError::InvalidTransition`] for a transition the state
    /// machine does not allow (nothing is written in that case), or the
    /// persistence or announcement error.
    pub async fn transition(&mut self, status: Status, update: impl FnOnce(&mut State)) -> Result<()> {
        let current = self.config.state.status;
        if !current.can_transition_to(status) {
            return Err(OciboxError::InvalidTransition {
                id: self.config.state.id.clone(),
                status: current.to_string(),
                operation: transition_name(current, status),
            });
        }

        let state = &mut self.config.state;
        state.status = status;
        let now = Some(Utc::now());
        match status {
            Status::Created => state.created_at = now,
            Status::Running if state.started_at.is_none() => state.started_at = now,
            Status::Stopped => state.finished_at = now,
            _ => {}
        }
        update(state);

        self.persist()?;
        tracing::info!(id = %self.config.state.id, status = %status, "state committed");
        self.announce().await
    }

    /// Writes the record.
    fn persist(&mut self) -> Result<()> {
        self.instance.set_engine_config(&self.config)?;
        self.store.update(&self.instance)
    }

    /// Pushes the current state to the sync socket, or prints it.
    async fn announce(&self) -> Result<()> {
        let mut json = serde_json::to_vec(&self.config.state)?;
        json.push(b'\n');
        match &self.config.sync_socket {
            Some(path) => {
                let ctx = || format!("sync socket {}", path.display());
                let mut stream = UnixStream::connect(path)
                    .await
                    .map_err(|e| OciboxError::ipc(ctx(), e))?;
                stream.write_all(&json).await.map_err(|e| OciboxError::ipc(ctx(), e))?;
                stream.shutdown().await.map_err(|e| OciboxError::ipc(ctx(), e))?;
            }
            None => {
                let mut out = std::io::stdout().lock();
                out.write_all(&json)
                    .and_then(|()| out.flush())
                    .map_err(|e| OciboxError::ipc("stdout", e))?;
            }
        }
        Ok(())
    }

    /// Deletes the record, for a container that never reached `Created`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be removed.
    pub fn remove(self) -> Result<()> {
        self.store.delete(&self.config.state.id)
    }
}

/// Operation name reported when a transition is refused.
const fn transition_name(from: Status, to: Status) -> &'static str {
    match (from, to) {
        (_, Status::Creating | Status::Created) => "create",
        (Status::Paused, Status::Running) => "resume",
        (_, Status::Running) => "start",
        (_, Status::Paused) => "pause",
        (_, Status::Stopped) => "stop",
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ocibox_common::spec::Spec;
    use ocibox_common::types::{ContainerId, LogFormat};
    use tokio::io::AsyncBufReadExt;

    use super::*;
    use crate::config::EngineKind;

    fn setup(sync_socket: Option<PathBuf>) -> (tempfile::TempDir, StateSync) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = InstanceStore::open(dir.path()).expect("store");
        let id = ContainerId::parse("sync-test").expect("id");
        let config = EngineConfig {
            bundle: PathBuf::from("/b"),
            log_path: dir.path().join("log"),
            log_format: LogFormat::Basic,
            pid_file: None,
            spec: Spec::default(),
            state: State::new(&id, PathBuf::from("/b"), BTreeMap::new()),
            sync_socket,
            empty_process: false,
            cgroup: None,
        };
        store
            .add(&Instance::new(EngineKind::Oci, &config).expect("instance"))
            .expect("add");
        let sync = StateSync::load(store, "sync-test").expect("load");
        (dir, sync)
    }

    #[tokio::test]
    async fn state_is_persisted_before_it_is_announced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sock = dir.path().join("sync.sock");
        let listener = tokio::net::UnixListener::bind(&sock).expect("bind");
        let (_store_dir, mut sync) = setup(Some(sock));
        let store = sync.store().clone();

        let reader = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut line = String::new();
            let _ = tokio::io::BufReader::new(stream)
                .read_line(&mut line)
                .await
                .expect("read");
            let announced: State = serde_json::from_str(&line).expect("state json");
            let persisted = store.get("sync-test").expect("get").state().expect("state");
            (announced, persisted)
        });

        sync.transition(Status::Created, |s| s.pid = Some(7)).await.expect("transition");
        let (announced, persisted) = reader.await.expect("join");
        assert_eq!(announced.status, Status::Created);
        assert_eq!(persisted, announced);
        assert!(announced.created_at.is_some());
    }

    #[tokio::test]
    async fn invalid_transition_writes_nothing() {
        let (_dir, mut sync) = setup(None);
        let err = sync
            .transition(Status::Running, |_| {})
            .await
            .expect_err("creating -> running is invalid");
        assert!(matches!(err, OciboxError::InvalidTransition { .. }));
        let on_disk = sync.store().get("sync-test").expect("get").state().expect("state");
        assert_eq!(on_disk.status, Status::Creating);
    }

    #[tokio::test]
    async fn unreachable_sync_socket_is_ipc_error_after_persisting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_store_dir, mut sync) = setup(Some(dir.path().join("missing.sock")));
        let err = sync.transition(Status::Stopped, |_| {}).await.expect_err("no listener");
        assert!(matches!(err, OciboxError::Ipc { .. }));
        let on_disk = sync.store().get("sync-test").expect("get").state().expect("state");
        assert_eq!(on_disk.status, Status::Stopped);
    }

    #[test]
    fn set_pid_keeps_creating() {
        let (_dir, mut sync) = setup(None);
        sync.set_pid(1234).expect("set pid");
        let instance = sync.store().get("sync-test").expect("get");
        assert_eq!(instance.pid, Some(1234));
        assert_eq!(instance.state().expect("state").status, Status::Creating);
    }
}
