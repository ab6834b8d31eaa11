//! `ocibox resize`: Change a container terminal's size.

use std::process::ExitCode;

use clap::Args;
use ocibox_common::error::Result;
use ocibox_core::terminal;
use ocibox_runtime::engine::Engine;

/// Arguments for the `resize` command.
#[derive(Args, Debug)]
pub struct ResizeArgs {
    /// Container ID.
    pub id: String,

    /// Columns; defaults to the width of the calling terminal.
    #[arg(long)]
    pub width: Option<u16>,

    /// Rows; defaults to the height of the calling terminal.
    #[arg(long)]
    pub height: Option<u16>,
}

impl ResizeArgs {
    /// Fills unset dimensions from `local`, which is only consulted when
    /// one is missing.
    fn geometry(&self, local: impl FnOnce() -> Result<(u16, u16)>) -> Result<(u16, u16)> {
        match (self.width, self.height) {
            (Some(width), Some(height)) => Ok((width, height)),
            (width, height) => {
                let (cols, rows) = local()?;
                Ok((width.unwrap_or(cols), height.unwrap_or(rows)))
            }
        }
    }
}

/// Executes the `resize` command. Containers without a terminal accept
/// and ignore it.
///
/// # Errors
///
/// Returns an error if a dimension is missing and stdin is not a terminal,
/// or if the master is unreachable.
pub async fn execute(engine: &Engine, args: &ResizeArgs) -> anyhow::Result<ExitCode> {
    let (width, height) = args.geometry(|| terminal::size(std::io::stdin()))?;
    engine.resize(&args.id, width, height).await?;
    Ok(ExitCode::SUCCESS)
}
