//! Memory resource control via cgroups v2.
//!
//! Manages `memory.max`, `memory.low` and `memory.swap.max`.

use std::path::Path;

use ocibox_common::error::{OciboxError, Result};
use ocibox_common::spec::MemoryResources;

use super::{limit_value, write_control};

/// Applies the memory section of a resource document.
///
/// `swap` follows the OCI meaning (memory plus swap), so the value written
/// to `memory.swap.max` is `swap - limit`.
///
/// # Errors
///
/// Returns an error if the swap limit is below the memory limit or a write
/// fails.
pub fn apply(cgroup_path: &Path, mem: &MemoryResources) -> Result<()> {
    if let Some(limit) = mem.limit {
        write_control(cgroup_path, "memory.max", &limit_value(limit))?;
        tracing::debug!(limit, "memory max set");
    }
    if let Some(low) = mem.reservation {
        write_control(cgroup_path, "memory.low", &limit_value(low))?;
    }
    if let Some(swap) = mem.swap {
        let value = match mem.limit {
            _ if swap < 0 => "max".to_string(),
            Some(limit) if limit >= 0 => {
                if swap < limit {
                    return Err(OciboxError::Cgroup {
                        path: cgroup_path.to_path_buf(),
                        message: format!("memory+swap limit {swap} is below memory limit {limit}"),
                    });
                }
                (swap - limit).to_string()
            }
            _ => swap.to_string(),
        };
        write_control(cgroup_path, "memory.swap.max", &value)?;
    }
    Ok(())
}
