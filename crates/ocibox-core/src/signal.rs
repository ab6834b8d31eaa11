//! Signal name parsing and exit status descriptions.

use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use ocibox_common::error::{OciboxError, Result};

/// Parses a signal given by name (`TERM`, `SIGTERM`, `term`) or number (`15`).
///
/// # Errors
///
/// Returns a configuration error for unknown names or numbers.
pub fn parse_signal(value: &str) -> Result<Signal> {
    let value = value.trim();
    if let Ok(num) = value.parse::<i32>() {
        return Signal::try_from(num).map_err(|_| OciboxError::config(format!("unknown signal: {value}")));
    }
    let upper = value.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| OciboxError::config(format!("unknown signal: {value}")))
}

/// Exit code and description of a terminated process.
///
/// Processes killed by a signal report `128 + signo`, as shells do.
/// Returns `None` for statuses that are not terminal.
#[must_use]
pub fn describe_exit(status: WaitStatus) -> Option<(i32, String)> {
    match status {
        WaitStatus::Exited(_, code) => Some((code, format!("exited with status {code}"))),
        WaitStatus::Signaled(_, sig, _) => {
            Some((128 + sig as i32, format!("killed by signal {}", sig.as_str())))
        }
        _ => None,
    }
}

/// Description of a process killed by `SIGKILL` after `signal` went
/// unanswered for `grace`.
#[must_use]
pub fn describe_escalation(signal: Signal, grace: Duration) -> String {
    let grace = if grace.subsec_millis() == 0 {
        format!("{}s", grace.as_secs())
    } else {
        format!("{}ms", grace.as_millis())
    };
    format!("killed by signal SIGKILL after {grace} grace period for {}", signal.as_str())
}

#[cfg(test)]
mod tests {
    use nix::unistd::Pid;

    use super::*;

    #[test]
    fn parses_names_and_numbers() {
        assert_eq!(parse_signal("TERM").expect("TERM"), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGKILL").expect("SIGKILL"), Signal::SIGKILL);
        assert_eq!(parse_signal("hup").expect("hup"), Signal::SIGHUP);
        assert_eq!(parse_signal("9").expect("9"), Signal::SIGKILL);
        assert!(parse_signal("NOPE").is_err());
        assert!(parse_signal("999").is_err());
    }

    #[test]
    fn describes_exit_and_signal() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            describe_exit(WaitStatus::Exited(pid, 3)),
            Some((3, "exited with status 3".to_string()))
        );
        assert_eq!(
            describe_exit(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some((137, "killed by signal SIGKILL".to_string()))
        );
        assert_eq!(describe_exit(WaitStatus::StillAlive), None);
    }

    #[test]
    fn escalation_names_grace_and_first_signal() {
        assert_eq!(
            describe_escalation(Signal::SIGTERM, Duration::from_secs(2)),
            "killed by signal SIGKILL after 2s grace period for SIGTERM"
        );
        assert_eq!(
            describe_escalation(Signal::SIGINT, Duration::from_millis(1500)),
            "killed by signal SIGKILL after 1500ms grace period for SIGINT"
        );
    }
}
