//! `ocibox start`: Release a created container's process.

use std::process::ExitCode;

use ocibox_runtime::engine::Engine;

use super::IdArgs;

/// Executes the `start` command.
///
/// # Errors
///
/// Returns an error if the container is not `Created` or its process fails
/// to execute.
pub async fn execute(engine: &Engine, args: &IdArgs) -> anyhow::Result<ExitCode> {
    engine.start(&args.id).await?;
    Ok(ExitCode::SUCCESS)
}
