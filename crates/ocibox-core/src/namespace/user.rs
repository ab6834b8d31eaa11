//! User namespace ID mappings.
//!
//! Maps container UIDs/GIDs to host UIDs/GIDs for a child that was cloned
//! into a new user namespace.

use std::fmt::Write as _;

use ocibox_common::error::{OciboxError, Result};
use ocibox_common::spec::IdMapping;

/// Renders mappings in the `/proc/<pid>/uid_map` line format.
#[must_use]
pub fn format_mappings(mappings: &[IdMapping]) -> String {
    mappings.iter().fold(String::new(), |mut out, m| {
        let _ = writeln!(out, "{} {} {}", m.container_id, m.host_id, m.size);
        out
    })
}

/// Writes UID/GID mappings for a process in a new user namespace.
///
/// Unprivileged callers must deny `setgroups` before writing `gid_map`.
///
/// # Errors
///
/// Returns an error if writing to `/proc/<pid>/uid_map`,
/// `/proc/<pid>/gid_map`, or `/proc/<pid>/setgroups` fails.
pub fn write_id_mappings(pid: i32, uid_mappings: &[IdMapping], gid_mappings: &[IdMapping]) -> Result<()> {
    if !uid_mappings.is_empty() {
        let path = format!("/proc/{pid}/uid_map");
        std::fs::write(&path, format_mappings(uid_mappings)).map_err(|e| OciboxError::io(path, e))?;
    }

    if !gid_mappings.is_empty() {
        if !nix::unistd::geteuid().is_root() {
            let setgroups = format!("/proc/{pid}/setgroups");
            std::fs::write(&setgroups, "deny").map_err(|e| OciboxError::io(setgroups, e))?;
        }
        let path = format!("/proc/{pid}/gid_map");
        std::fs::write(&path, format_mappings(gid_mappings)).map_err(|e| OciboxError::io(path, e))?;
    }

    tracing::debug!(pid, uids = uid_mappings.len(), gids = gid_mappings.len(), "wrote ID mappings");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mappings_render_one_line_each() {
        let maps = [
            IdMapping {
                container_id: 0,
                host_id: 1000,
                size: 1,
            },
            IdMapping {
                container_id: 1,
                host_id: 100_000,
                size: 65_536,
            },
        ];
        assert_eq!(format_mappings(&maps), "0 1000 1\n1 100000 65536\n");
    }
}
