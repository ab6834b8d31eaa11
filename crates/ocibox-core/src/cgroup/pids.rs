//! Process count control via cgroups v2 (`pids.max`).

use std::path::Path;

use ocibox_common::error::Result;
use ocibox_common::spec::PidsResources;

use super::write_control;

/// Applies the pids section of a resource document.
///
/// # Errors
///
/// Returns an error if writing to `pids.max` fails.
pub fn apply(cgroup_path: &Path, pids: &PidsResources) -> Result<()> {
    let value = if pids.limit > 0 {
        pids.limit.to_string()
    } else {
        "max".to_string()
    };
    write_control(cgroup_path, "pids.max", &value)?;
    tracing::debug!(limit = pids.limit, "pids max set");
    Ok(())
}
