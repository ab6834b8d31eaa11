//! `ocibox state`: Print a container's state.

use std::process::ExitCode;

use ocibox_runtime::engine::Engine;

use super::IdArgs;
use crate::output;

/// Executes the `state` command.
///
/// # Errors
///
/// Returns an error if the container does not exist.
pub fn execute(engine: &Engine, args: &IdArgs) -> anyhow::Result<ExitCode> {
    output::print_json(&engine.state(&args.id)?)?;
    Ok(ExitCode::SUCCESS)
}
