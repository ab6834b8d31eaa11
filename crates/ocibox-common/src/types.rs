//! Domain primitive types used across the ocibox workspace.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_CONTAINER_ID_LEN, OCI_VERSION};
use crate::error::{OciboxError, Result};

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container ID after validating its characters.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty, too long, starts with a dot, or
    /// contains characters other than ASCII alphanumerics, `_`, `-` and `.`.
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if id.is_empty() || id.len() > MAX_CONTAINER_ID_LEN || id.starts_with('.') || !valid_chars {
            return Err(OciboxError::config(format!("invalid container id: {id:?}")));
        }
        Ok(Self(id))
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a container.
///
/// Valid paths run `Creating → Created → Running ⇄ Paused → Stopped`;
/// every non-terminal status may also fall straight to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Instance record written, namespaces and mounts not finished.
    Creating,
    /// Container process parked at the start checkpoint.
    Created,
    /// Container process released and executing.
    Running,
    /// Cgroup frozen.
    Paused,
    /// Terminal status.
    Stopped,
}

impl Status {
    /// Returns whether moving from `self` to `next` is a valid transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Creating, Self::Created | Self::Stopped)
                | (Self::Created, Self::Running | Self::Stopped)
                | (Self::Running, Self::Paused | Self::Stopped)
                | (Self::Paused, Self::Running | Self::Stopped)
        )
    }

    /// Returns the lowercase name used in state documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = OciboxError;

    fn from_str(s: &str) -> Result<Self> {
        [Self::Creating, Self::Created, Self::Running, Self::Paused, Self::Stopped]
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| OciboxError::config(format!("unknown status: {s}")))
    }
}

/// OCI runtime state of one container, extended with the runtime's
/// socket paths, exit information and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    /// OCI specification version.
    pub oci_version: String,
    /// Container identifier.
    pub id: String,
    /// Current lifecycle status.
    pub status: Status,
    /// PID of the container process, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Absolute path of the bundle directory.
    pub bundle: PathBuf,
    /// Annotations copied from the bundle specification.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Exit code once stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Human-readable exit description once stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_desc: Option<String>,
    /// Time the container reached `Created`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Time the container reached `Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Time the container reached `Stopped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Path of the attach socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach_socket: Option<PathBuf>,
    /// Path of the control socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_socket: Option<PathBuf>,
}

impl State {
    /// Creates the initial `Creating` state for a container.
    #[must_use]
    pub fn new(id: &ContainerId, bundle: PathBuf, annotations: BTreeMap<String, String>) -> Self {
        Self {
            oci_version: OCI_VERSION.to_string(),
            id: id.to_string(),
            status: Status::Creating,
            pid: None,
            bundle,
            annotations,
            exit_code: None,
            exit_desc: None,
            created_at: None,
            started_at: None,
            finished_at: None,
            attach_socket: None,
            control_socket: None,
        }
    }
}

/// A command sent to the master over the control socket.
///
/// Exactly one message is sent per connection; the master answers with a
/// [`ControlReply`] and closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Control {
    /// Release the container process (`Created → Running`).
    Start,
    /// Freeze the container cgroup.
    Pause,
    /// Thaw the container cgroup.
    Resume,
    /// Change the pseudo-terminal geometry.
    ConsoleResize {
        /// Columns.
        width: u16,
        /// Rows.
        height: u16,
    },
    /// Close and reopen the log file.
    ReopenLog,
    /// The runtime is about to `SIGKILL` the container because `signal`
    /// went unanswered for the grace period.
    Escalate {
        /// Number of the signal that was ignored.
        signal: i32,
        /// Grace period in milliseconds.
        grace_ms: u64,
    },
}

impl Control {
    /// Returns the message name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::ConsoleResize { .. } => "console-resize",
            Self::ReopenLog => "reopen-log",
            Self::Escalate { .. } => "escalate",
        }
    }
}

/// Answer to a [`Control`] message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    /// Error text when the request failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlReply {
    /// A successful reply.
    #[must_use]
    pub const fn ok() -> Self {
        Self { error: None }
    }

    /// A failed reply carrying the error text.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
        }
    }
}

/// On-disk format of the container log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `<timestamp> <stream> <line>`.
    #[default]
    Basic,
    /// CRI format: `<timestamp> <stream> <F|P> <line>`.
    Kubernetes,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = OciboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "basic" => Ok(Self::Basic),
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            "json" => Ok(Self::Json),
            other => Err(OciboxError::config(format!("unknown log format: {other}"))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Kubernetes => write!(f, "kubernetes"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> State {
        let id = ContainerId::parse("web-1").expect("valid id");
        let mut annotations = BTreeMap::new();
        let _ = annotations.insert("org.example.tier".to_string(), "frontend".to_string());
        let mut state = State::new(&id, PathBuf::from("/srv/bundles/web"), annotations);
        state.status = Status::Stopped;
        state.pid = Some(4242);
        state.exit_code = Some(137);
        state.exit_desc = Some("killed by signal SIGKILL".into());
        state.created_at = Some(Utc::now());
        state.started_at = Some(Utc::now());
        state.finished_at = Some(Utc::now());
        state.attach_socket = Some(PathBuf::from("/run/ocibox/instances/web-1/attach.sock"));
        state.control_socket = Some(PathBuf::from("/run/ocibox/instances/web-1/control.sock"));
        state
    }

    #[test]
    fn state_json_roundtrip_is_identical() {
        let state = sample_state();
        let json = serde_json::to_string(&state).expect("encode");
        let decoded: State = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded, state);
    }

    #[test]
    fn state_uses_oci_field_names() {
        let json = serde_json::to_value(sample_state()).expect("encode");
        assert_eq!(json["ociVersion"], OCI_VERSION);
        assert_eq!(json["status"], "stopped");
        assert_eq!(json["exitCode"], 137);
        assert!(json.get("attachSocket").is_some());
    }

    #[test]
    fn fresh_state_omits_unset_fields() {
        let id = ContainerId::parse("c").expect("valid id");
        let json = serde_json::to_value(State::new(&id, "/b".into(), BTreeMap::new())).expect("encode");
        assert_eq!(json["status"], "creating");
        assert!(json.get("pid").is_none());
        assert!(json.get("exitCode").is_none());
    }

    #[test]
    fn lifecycle_transitions() {
        use Status::{Created, Creating, Paused, Running, Stopped};
        assert!(Creating.can_transition_to(Created));
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(!Created.can_transition_to(Creating));
        assert!(!Running.can_transition_to(Created));
        assert!(!Creating.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Running".parse::<Status>().expect("running"), Status::Running);
        assert_eq!("paused".parse::<Status>().expect("paused"), Status::Paused);
        assert!("exited".parse::<Status>().is_err());
    }

    #[test]
    fn container_id_validation() {
        assert!(ContainerId::parse("abc_DEF-1.2").is_ok());
        assert!(ContainerId::parse("").is_err());
        assert!(ContainerId::parse(".hidden").is_err());
        assert!(ContainerId::parse("a/b").is_err());
        assert!(ContainerId::parse("x".repeat(MAX_CONTAINER_ID_LEN + 1)).is_err());
    }

    #[test]
    fn generated_ids_are_unique_and_valid() {
        let a = ContainerId::generate();
        let b = ContainerId::generate();
        assert_ne!(a, b);
        assert!(ContainerId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn control_messages_are_tagged() {
        let json = serde_json::to_string(&Control::ConsoleResize { width: 80, height: 24 }).expect("encode");
        assert_eq!(json, r#"{"type":"console_resize","width":80,"height":24}"#);
        let decoded: Control = serde_json::from_str(r#"{"type":"reopen_log"}"#).expect("decode");
        assert_eq!(decoded, Control::ReopenLog);
        let decoded: Control =
            serde_json::from_str(r#"{"type":"escalate","signal":15,"grace_ms":2000}"#).expect("decode");
        assert_eq!(
            decoded,
            Control::Escalate {
                signal: 15,
                grace_ms: 2000
            }
        );
        assert_eq!(decoded.name(), "escalate");
    }

    #[test]
    fn control_reply_omits_error_on_success() {
        assert_eq!(serde_json::to_string(&ControlReply::ok()).expect("encode"), "{}");
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!("kubernetes".parse::<LogFormat>().expect("parse"), LogFormat::Kubernetes);
        assert_eq!("json".parse::<LogFormat>().expect("parse"), LogFormat::Json);
        assert!("syslog".parse::<LogFormat>().is_err());
    }
}
