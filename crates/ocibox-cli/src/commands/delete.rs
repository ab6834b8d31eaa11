//! `ocibox delete`: Remove a stopped or created container.

use std::process::ExitCode;

use ocibox_runtime::engine::Engine;

use super::IdArgs;

/// Executes the `delete` command.
///
/// # Errors
///
/// Returns an error if the container is running or paused.
pub async fn execute(engine: &Engine, args: &IdArgs) -> anyhow::Result<ExitCode> {
    engine.delete(&args.id).await?;
    Ok(ExitCode::SUCCESS)
}
