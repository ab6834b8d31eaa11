//! `ocibox pause` / `ocibox resume`: Freeze and thaw a container.

use std::process::ExitCode;

use ocibox_runtime::engine::Engine;

use super::IdArgs;

/// Executes the `pause` command.
///
/// # Errors
///
/// Returns an error unless the container is `Running`.
pub async fn pause(engine: &Engine, args: &IdArgs) -> anyhow::Result<ExitCode> {
    engine.pause(&args.id).await?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `resume` command.
///
/// # Errors
///
/// Returns an error unless the container is `Paused`.
pub async fn resume(engine: &Engine, args: &IdArgs) -> anyhow::Result<ExitCode> {
    engine.resume(&args.id).await?;
    Ok(ExitCode::SUCCESS)
}
