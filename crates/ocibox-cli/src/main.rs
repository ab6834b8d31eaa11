//! # ocibox
//!
//! Daemon-less OCI container runtime. Every container is supervised by its
//! own detached master process; this binary is both the user-facing CLI
//! and that master.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

mod commands;
mod output;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use crate::commands::{Cli, Command};

fn init_tracing(cli: &Cli) {
    // The master has no terminal; its stderr is the instance's master.log.
    let default = if matches!(cli.command, Command::Master(_)) {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli);
    commands::execute(cli).await
}
