//! `ocibox run`: Create, start and attach to a container in one step.

use std::process::ExitCode;

use clap::Args;
use ocibox_common::types::ContainerId;
use ocibox_runtime::engine::Engine;

use super::create::BundleArgs;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Container ID (generated when omitted).
    pub id: Option<String>,

    /// Bundle and log options.
    #[command(flatten)]
    pub bundle: BundleArgs,

    /// Do not forward stdin to the container.
    #[arg(long)]
    pub no_stdin: bool,
}

/// Executes the `run` command and exits with the container's status.
///
/// The container is deleted afterwards, whether it succeeded or not.
///
/// # Errors
///
/// Returns the first failure of create, start or delete.
pub async fn execute(engine: &Engine, args: RunArgs) -> anyhow::Result<ExitCode> {
    let id = match args.id {
        Some(id) => ContainerId::parse(id)?,
        None => ContainerId::generate(),
    };
    tracing::debug!(id = %id, "running container");
    let code = engine.run(&id, args.bundle.options(), !args.no_stdin).await?;
    Ok(super::exit_code(code))
}
