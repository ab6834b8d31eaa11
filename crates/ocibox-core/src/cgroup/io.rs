//! I/O resource control via cgroups v2.
//!
//! Manages `io.weight`.

use std::path::Path;

use ocibox_common::error::Result;
use ocibox_common::spec::BlockIoResources;

use super::write_control;

/// Converts a blkio weight (10..=1000) to an `io.weight` (1..=10000).
#[must_use]
pub const fn blkio_to_io_weight(weight: u16) -> u64 {
    let weight = weight as u64;
    if weight == 0 {
        return 0;
    }
    1 + (weight.saturating_sub(10) * 9999) / 990
}

/// Applies the block I/O section of a resource document.
///
/// # Errors
///
/// Returns an error if writing to `io.weight` fails.
pub fn apply(cgroup_path: &Path, blkio: &BlockIoResources) -> Result<()> {
    if let Some(weight) = blkio.weight {
        let io_weight = blkio_to_io_weight(weight);
        if io_weight > 0 {
            write_control(cgroup_path, "io.weight", &format!("default {io_weight}"))?;
            tracing::debug!(weight, io_weight, "I/O weight set");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_conversion_bounds() {
        assert_eq!(blkio_to_io_weight(10), 1);
        assert_eq!(blkio_to_io_weight(1000), 10_000);
    }
}
