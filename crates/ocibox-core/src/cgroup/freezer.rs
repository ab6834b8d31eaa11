//! Cgroup v2 freezer (`cgroup.freeze` / `cgroup.events`).

use std::path::Path;
use std::time::{Duration, Instant};

use ocibox_common::error::{OciboxError, Result};

use super::write_control;

/// How long to wait for the kernel to report the requested state.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Requests a freeze or thaw and waits until `cgroup.events` reflects it.
///
/// When `cgroup.events` is absent the request is taken as settled. A request
/// that does not settle is withdrawn by writing the previous value back, so
/// the group is left as it was found.
///
/// This polls with a blocking sleep; async callers run it on a blocking
/// thread.
///
/// # Errors
///
/// Returns an error if the request cannot be written or the state does not
/// settle within the timeout.
pub fn set_frozen(cgroup_path: &Path, frozen: bool) -> Result<()> {
    write_control(cgroup_path, "cgroup.freeze", freeze_value(frozen))?;

    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        match is_frozen(cgroup_path)? {
            None => break,
            Some(state) if state == frozen => break,
            Some(_) if Instant::now() >= deadline => {
                if let Err(e) = write_control(cgroup_path, "cgroup.freeze", freeze_value(!frozen)) {
                    tracing::warn!(path = %cgroup_path.display(), error = %e, "cannot withdraw freezer request");
                }
                return Err(OciboxError::Cgroup {
                    path: cgroup_path.to_path_buf(),
                    message: format!(
                        "timed out waiting for cgroup to {}",
                        if frozen { "freeze" } else { "thaw" }
                    ),
                });
            }
            Some(_) => std::thread::sleep(POLL_INTERVAL),
        }
    }
    tracing::info!(path = %cgroup_path.display(), frozen, "cgroup freezer state changed");
    Ok(())
}

const fn freeze_value(frozen: bool) -> &'static str {
    if frozen { "1" } else { "0" }
}

/// Reads the `frozen` key of `cgroup.events`, or `None` if the file is absent.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn is_frozen(cgroup_path: &Path) -> Result<Option<bool>> {
    let events = cgroup_path.join("cgroup.events");
    let content = match std::fs::read_to_string(&events) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(OciboxError::io(events, e)),
    };
    Ok(content
        .lines()
        .find_map(|line| line.strip_prefix("frozen "))
        .map(|v| v.trim() == "1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_without_events_file_settles() {
        let dir = tempfile::tempdir().expect("tempdir");
        set_frozen(dir.path(), true).expect("freeze");
        let value = std::fs::read_to_string(dir.path().join("cgroup.freeze")).expect("read");
        assert_eq!(value, "1");
        assert_eq!(is_frozen(dir.path()).expect("read events"), None);
    }

    #[test]
    fn events_file_is_parsed() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cgroup.events"), "populated 1\nfrozen 0\n").expect("write");
        assert_eq!(is_frozen(dir.path()).expect("read"), Some(false));
        set_frozen(dir.path(), false).expect("thaw settles immediately");
    }

    #[test]
    fn unsettled_freeze_times_out_and_thaws_again() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cgroup.events"), "populated 1\nfrozen 0\n").expect("write");
        let err = set_frozen(dir.path(), true).expect_err("never settles");
        assert!(err.to_string().contains("timed out waiting for cgroup to freeze"));
        let value = std::fs::read_to_string(dir.path().join("cgroup.freeze")).expect("read");
        assert_eq!(value, "0");
    }

    #[test]
    fn unsettled_thaw_refreezes() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cgroup.events"), "populated 1\nfrozen 1\n").expect("write");
        let err = set_frozen(dir.path(), false).expect_err("never settles");
        assert!(err.to_string().contains("thaw"));
        let value = std::fs::read_to_string(dir.path().join("cgroup.freeze")).expect("read");
        assert_eq!(value, "1");
    }
}
