//! CPU resource control via cgroups v2.
//!
//! Manages `cpu.weight`, `cpu.max`, `cpuset.cpus` and `cpuset.mems`.

use std::path::Path;

use ocibox_common::spec::CpuResources;
use ocibox_common::error::Result;

use super::write_control;

/// Default `cpu.max` period in microseconds.
const DEFAULT_PERIOD_US: u64 = 100_000;

/// Converts cgroup v1 shares (2..=262144) to a v2 weight (1..=10000).
#[must_use]
pub const fn shares_to_weight(shares: u64) -> u64 {
    if shares == 0 {
        return 0;
    }
    1 + (shares.saturating_sub(2) * 9999) / 262_142
}

/// Applies the CPU section of a resource document.
///
/// # Errors
///
/// Returns an error if writing to a control file fails.
pub fn apply(cgroup_path: &Path, cpu: &CpuResources) -> Result<()> {
    if let Some(shares) = cpu.shares {
        let weight = shares_to_weight(shares);
        if weight > 0 {
            write_control(cgroup_path, "cpu.weight", &weight.to_string())?;
            tracing::debug!(shares, weight, "CPU weight set");
        }
    }

    if cpu.quota.is_some() || cpu.period.is_some() {
        let period = cpu.period.unwrap_or(DEFAULT_PERIOD_US);
        let quota = match cpu.quota {
            Some(q) if q > 0 => q.to_string(),
            _ => "max".to_string(),
        };
        write_control(cgroup_path, "cpu.max", &format!("{quota} {period}"))?;
        tracing::debug!(quota = %quota, period, "CPU max quota set");
    }

    if let Some(cpus) = &cpu.cpus {
        write_control(cgroup_path, "cpuset.cpus", cpus)?;
    }
    if let Some(mems) = &cpu.mems {
        write_control(cgroup_path, "cpuset.mems", mems)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_conversion_bounds() {
        assert_eq!(shares_to_weight(2), 1);
        assert_eq!(shares_to_weight(262_144), 10_000);
        assert_eq!(shares_to_weight(0), 0);
    }

    #[test]
    fn quota_without_limit_writes_max() {
        let dir = tempfile::tempdir().expect("tempdir");
        apply(
            dir.path(),
            &CpuResources {
                quota: Some(-1),
                period: Some(50_000),
                ..CpuResources::default()
            },
        )
        .expect("apply");
        let value = std::fs::read_to_string(dir.path().join("cpu.max")).expect("read");
        assert_eq!(value, "max 50000");
    }
}
