//! Instance store: one on-disk record per container.
//!
//! Records live at `<runtime_dir>/instances/<id>/instance.json`. The
//! instance directory also holds the attach and control sockets and the
//! default log file, so deleting the directory removes every artifact of
//! the container.

use std::io::Write;
use std::path::{Path, PathBuf};

use ocibox_common::constants::{INSTANCE_FILE, INSTANCES_DIR};
use ocibox_common::error::{OciboxError, Result};
use ocibox_common::types::{ContainerId, State, Status};
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, EngineKind};

/// Persistent record of one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Container identifier.
    pub id: String,
    /// Owning user name.
    pub user: String,
    /// PID of the container process, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// PID of the master process driving the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppid: Option<i32>,
    /// Bundle the container was created from.
    pub image: PathBuf,
    /// Engine driving the container.
    pub engine: EngineKind,
    /// Serialized [`EngineConfig`].
    pub config: serde_json::Value,
}

impl Instance {
    /// Builds a record for a freshly configured container.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn new(engine: EngineKind, config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            id: config.state.id.clone(),
            user: current_user(),
            pid: config.state.pid,
            ppid: None,
            image: config.bundle.clone(),
            engine,
            config: serde_json::to_value(config)?,
        })
    }

    /// Decodes the engine configuration blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob does not match [`EngineConfig`].
    pub fn engine_config(&self) -> Result<EngineConfig> {
        Ok(serde_json::from_value(self.config.clone())?)
    }

    /// Replaces the engine configuration blob and mirrors its PID.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn set_engine_config(&mut self, config: &EngineConfig) -> Result<()> {
        self.pid = config.state.pid;
        self.config = serde_json::to_value(config)?;
        Ok(())
    }

    /// Current container state held in the configuration blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed.
    pub fn state(&self) -> Result<State> {
        Ok(self.engine_config()?.state)
    }
}

/// Name of the calling user, falling back to the numeric UID.
fn current_user() -> String {
    let uid = nix::unistd::getuid();
    nix::unistd::User::from_uid(uid)
        .ok()
        .flatten()
        .map_or_else(|| uid.to_string(), |u| u.name)
}

/// Filters applied by [`InstanceStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only records owned by this user.
    pub user: Option<String>,
    /// Shell-style glob (`*`, `?`) matched against the container ID.
    pub pattern: Option<String>,
    /// Only records in this status.
    pub status: Option<Status>,
}

/// Converts a shell glob into an anchored regular expression.
fn glob_to_regex(glob: &str) -> Result<regex::Regex> {
    let pattern = regex::escape(glob).replace(r"\*", ".*").replace(r"\?", ".");
    regex::Regex::new(&format!("^{pattern}$"))
        .map_err(|e| OciboxError::config(format!("invalid pattern {glob:?}: {e}")))
}

/// Directory-backed store of instance records.
#[derive(Debug, Clone)]
pub struct InstanceStore {
    dir: PathBuf,
}

impl InstanceStore {
    /// Opens the store under a runtime directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(runtime_dir: &Path) -> Result<Self> {
        let dir = runtime_dir.join(INSTANCES_DIR);
        std::fs::create_dir_all(&dir).map_err(|e| OciboxError::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Directory holding everything belonging to one container.
    #[must_use]
    pub fn instance_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.instance_dir(id).join(INSTANCE_FILE)
    }

    /// Returns whether a record exists for `id`.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.record_path(id).exists()
    }

    /// Adds a new record.
    ///
    /// The record file is created exclusively, so of two concurrent
    /// creations with the same ID exactly one succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`OciboxError::AlreadyExists`] if a record with the same ID
    /// exists, or an I/O error.
    pub fn add(&self, instance: &Instance) -> Result<()> {
        let dir = self.instance_dir(&instance.id);
        std::fs::create_dir_all(&dir).map_err(|e| OciboxError::io(&dir, e))?;
        let path = self.record_path(&instance.id);
        let mut file = match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(OciboxError::AlreadyExists {
                    id: instance.id.clone(),
                });
            }
            Err(e) => return Err(OciboxError::io(path, e)),
        };
        let json = serde_json::to_vec_pretty(instance)?;
        file.write_all(&json).map_err(|e| OciboxError::io(&path, e))?;
        tracing::debug!(id = %instance.id, "instance record added");
        Ok(())
    }

    /// Reads a record.
    ///
    /// # Errors
    ///
    /// Returns [`OciboxError::NotFound`] if no record exists.
    pub fn get(&self, id: &str) -> Result<Instance> {
        let path = self.record_path(id);
        let content = match std::fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OciboxError::NotFound {
                    kind: "container",
                    id: id.to_string(),
                });
            }
            Err(e) => return Err(OciboxError::io(path, e)),
        };
        Ok(serde_json::from_slice(&content)?)
    }

    /// Rewrites an existing record atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not exist or cannot be written.
    pub fn update(&self, instance: &Instance) -> Result<()> {
        let path = self.record_path(&instance.id);
        if !path.exists() {
            return Err(OciboxError::NotFound {
                kind: "container",
                id: instance.id.clone(),
            });
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(instance)?;
        std::fs::write(&tmp, json).map_err(|e| OciboxError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| OciboxError::io(&path, e))?;
        Ok(())
    }

    /// Removes a record together with its instance directory.
    ///
    /// # Errors
    ///
    /// Returns [`OciboxError::NotFound`] if no record exists.
    pub fn delete(&self, id: &str) -> Result<()> {
        let dir = self.instance_dir(id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!(id, "instance record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(OciboxError::NotFound {
                kind: "container",
                id: id.to_string(),
            }),
            Err(e) => Err(OciboxError::io(dir, e)),
        }
    }

    /// Lists records matching a filter, sorted by ID.
    ///
    /// Directories without a readable record (for example one being
    /// created or deleted concurrently) are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be read or the
    /// pattern is invalid.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Instance>> {
        let pattern = filter.pattern.as_deref().map(glob_to_regex).transpose()?;
        let entries = std::fs::read_dir(&self.dir).map_err(|e| OciboxError::io(&self.dir, e))?;

        let mut out = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if ContainerId::parse(name.as_str()).is_err() {
                continue;
            }
            if pattern.as_ref().is_some_and(|re| !re.is_match(&name)) {
                continue;
            }
            let Ok(instance) = self.get(&name) else {
                continue;
            };
            if filter.user.as_ref().is_some_and(|u| *u != instance.user) {
                continue;
            }
            if let Some(status) = filter.status {
                if instance.state().map(|s| s.status).ok() != Some(status) {
                    continue;
                }
            }
            out.push(instance);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ocibox_common::spec::Spec;
    use ocibox_common::types::LogFormat;

    use super::*;

    fn config(id: &str) -> EngineConfig {
        let cid = ContainerId::parse(id).expect("id");
        EngineConfig {
            bundle: PathBuf::from("/bundles/app"),
            log_path: PathBuf::from("/tmp/app.log"),
            log_format: LogFormat::Basic,
            pid_file: None,
            spec: Spec::default(),
            state: State::new(&cid, PathBuf::from("/bundles/app"), BTreeMap::new()),
            sync_socket: None,
            empty_process: false,
            cgroup: None,
        }
    }

    fn store() -> (tempfile::TempDir, InstanceStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = InstanceStore::open(dir.path()).expect("open");
        (dir, store)
    }

    #[test]
    fn add_then_get_roundtrip() {
        let (_dir, store) = store();
        let instance = Instance::new(EngineKind::Oci, &config("a")).expect("instance");
        store.add(&instance).expect("add");
        let loaded = store.get("a").expect("get");
        assert_eq!(loaded, instance);
        assert_eq!(loaded.engine_config().expect("config"), config("a"));
    }

    #[test]
    fn duplicate_add_fails_and_keeps_original() {
        let (_dir, store) = store();
        let mut first = Instance::new(EngineKind::Oci, &config("dup")).expect("instance");
        first.pid = Some(42);
        store.add(&first).expect("first add");

        let second = Instance::new(EngineKind::Oci, &config("dup")).expect("instance");
        let err = store.add(&second).expect_err("second add must fail");
        assert!(matches!(err, OciboxError::AlreadyExists { .. }));
        assert_eq!(store.get("dup").expect("get").pid, Some(42));
    }

    #[test]
    fn update_replaces_state() {
        let (_dir, store) = store();
        let mut cfg = config("u");
        let mut instance = Instance::new(EngineKind::Oci, &cfg).expect("instance");
        store.add(&instance).expect("add");

        cfg.state.status = Status::Created;
        cfg.state.pid = Some(99);
        instance.set_engine_config(&cfg).expect("set");
        store.update(&instance).expect("update");

        let loaded = store.get("u").expect("get");
        assert_eq!(loaded.pid, Some(99));
        assert_eq!(loaded.state().expect("state").status, Status::Created);
    }

    #[test]
    fn delete_removes_directory() {
        let (_dir, store) = store();
        let instance = Instance::new(EngineKind::Oci, &config("gone")).expect("instance");
        store.add(&instance).expect("add");
        std::fs::write(store.instance_dir("gone").join("attach.sock"), b"").expect("fake socket");
        store.delete("gone").expect("delete");
        assert!(!store.instance_dir("gone").exists());
        assert!(matches!(store.get("gone"), Err(OciboxError::NotFound { .. })));
        assert!(store.delete("gone").is_err());
    }

    #[test]
    fn list_filters_by_glob_and_user() {
        let (_dir, store) = store();
        for id in ["web-1", "web-2", "db-1"] {
            store
                .add(&Instance::new(EngineKind::Oci, &config(id)).expect("instance"))
                .expect("add");
        }
        let all = store.list(&ListFilter::default()).expect("list");
        let ids: Vec<_> = all.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["db-1", "web-1", "web-2"]);

        let web = store
            .list(&ListFilter {
                pattern: Some("web-?".into()),
                ..ListFilter::default()
            })
            .expect("list");
        assert_eq!(web.len(), 2);

        let nobody = store
            .list(&ListFilter {
                user: Some("no-such-user".into()),
                ..ListFilter::default()
            })
            .expect("list");
        assert!(nobody.is_empty());

        let creating = store
            .list(&ListFilter {
                status: Some(Status::Creating),
                ..ListFilter::default()
            })
            .expect("list");
        assert_eq!(creating.len(), 3);
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let re = glob_to_regex("a.b*").expect("regex");
        assert!(re.is_match("a.bcd"));
        assert!(!re.is_match("axbcd"));
    }
}
