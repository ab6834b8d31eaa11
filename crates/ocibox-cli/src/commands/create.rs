//! `ocibox create`: Create a container and park it before its process runs.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use ocibox_common::types::{ContainerId, LogFormat};
use ocibox_runtime::engine::{CreateOptions, Engine};

use crate::output;

/// Bundle options shared by `create` and `run`.
#[derive(Args, Debug)]
pub struct BundleArgs {
    /// Bundle directory containing `config.json`.
    #[arg(short, long, default_value = ".")]
    pub bundle: PathBuf,

    /// Container log file (defaults to the instance directory).
    #[arg(long)]
    pub log_path: Option<PathBuf>,

    /// Container log format, overriding the global default.
    #[arg(long = "container-log-format")]
    pub container_log_format: Option<LogFormat>,

    /// File receiving the container PID.
    #[arg(long)]
    pub pid_file: Option<PathBuf>,
}

impl BundleArgs {
    /// Engine options for these arguments.
    #[must_use]
    pub fn options(self) -> CreateOptions {
        CreateOptions {
            bundle: self.bundle,
            log_path: self.log_path,
            log_format: self.container_log_format,
            pid_file: self.pid_file,
            ..CreateOptions::default()
        }
    }
}

/// Arguments for the `create` command.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Container ID.
    pub id: String,

    /// Bundle and log options.
    #[command(flatten)]
    pub bundle: BundleArgs,

    /// Park a placeholder process instead of running `process.args`.
    #[arg(long)]
    pub empty_process: bool,

    /// Unix socket receiving every state change instead of stdout.
    #[arg(long)]
    pub sync_socket: Option<PathBuf>,
}

/// Executes the `create` command and prints the created state.
///
/// # Errors
///
/// Returns an error if the ID is invalid or taken, the bundle is invalid,
/// or the master fails to create the container.
pub async fn execute(engine: &Engine, args: CreateArgs) -> anyhow::Result<ExitCode> {
    let id = ContainerId::parse(args.id)?;
    let opts = CreateOptions {
        empty_process: args.empty_process,
        sync_socket: args.sync_socket,
        ..args.bundle.options()
    };
    let state = engine.create(&id, opts).await?;
    output::print_json(&state)?;
    Ok(ExitCode::SUCCESS)
}
