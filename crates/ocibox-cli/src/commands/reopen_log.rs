//! `ocibox reopen-log`: Reopen the container log after rotation.

use std::process::ExitCode;

use ocibox_runtime::engine::Engine;

use super::IdArgs;

/// Executes the `reopen-log` command.
///
/// # Errors
///
/// Returns an error if the master cannot reopen the file.
pub async fn execute(engine: &Engine, args: &IdArgs) -> anyhow::Result<ExitCode> {
    engine.reopen_log(&args.id).await?;
    Ok(ExitCode::SUCCESS)
}
