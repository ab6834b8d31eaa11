//! `ocibox exec`: Execute a command inside a running container.

use std::process::ExitCode;

use clap::Args;
use ocibox_runtime::engine::Engine;

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Container ID.
    pub id: String,

    /// Command to execute.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `exec` command.
///
/// Joins the container's namespaces and cgroup, runs the command with the
/// caller's stdio and exits with its status.
///
/// # Errors
///
/// Returns an error if the container is not running or the command cannot
/// be spawned.
pub async fn execute(engine: &Engine, args: ExecArgs) -> anyhow::Result<ExitCode> {
    let code = engine.exec(&args.id, args.command).await?;
    Ok(super::exit_code(code))
}
