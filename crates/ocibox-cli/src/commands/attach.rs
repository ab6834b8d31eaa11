//! `ocibox attach`: Stream a container's stdio.

use std::io::IsTerminal;
use std::process::ExitCode;

use clap::Args;
use ocibox_core::terminal;
use ocibox_runtime::engine::Engine;

/// Arguments for the `attach` command.
#[derive(Args, Debug)]
pub struct AttachArgs {
    /// Container ID.
    pub id: String,

    /// Do not forward stdin to the container.
    #[arg(long)]
    pub no_stdin: bool,
}

/// Executes the `attach` command until the container's output ends.
///
/// When stdin is a terminal its size is passed on to the container first.
///
/// # Errors
///
/// Returns an error if the attach socket is unreachable.
pub async fn execute(engine: &Engine, args: &AttachArgs) -> anyhow::Result<ExitCode> {
    let stdin = std::io::stdin();
    if !args.no_stdin && stdin.is_terminal() {
        match terminal::size(&stdin) {
            Ok((width, height)) => {
                if let Err(e) = engine.resize(&args.id, width, height).await {
                    tracing::debug!(error = %e, "cannot pass terminal size to container");
                }
            }
            Err(e) => tracing::debug!(error = %e, "cannot read terminal size"),
        }
    }
    engine.attach(&args.id, !args.no_stdin).await?;
    Ok(ExitCode::SUCCESS)
}
