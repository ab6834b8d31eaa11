//! `ocibox kill`: Signal a container's process.

use std::process::ExitCode;
use std::time::Duration;

use clap::Args;
use nix::sys::signal::Signal;
use ocibox_core::signal::parse_signal;
use ocibox_runtime::engine::Engine;

/// Arguments for the `kill` command.
#[derive(Args, Debug)]
pub struct KillArgs {
    /// Container ID.
    pub id: String,

    /// Signal name (`TERM`, `SIGTERM`) or number.
    #[arg(default_value = "TERM", value_parser = parse_signal)]
    pub signal: Signal,

    /// Seconds to wait for the container to stop before sending SIGKILL.
    #[arg(short, long)]
    pub timeout: Option<u64>,
}

/// Executes the `kill` command.
///
/// # Errors
///
/// Returns an error if the container is neither `Created` nor `Running`, or
/// the signal cannot be delivered.
pub async fn execute(engine: &Engine, args: KillArgs) -> anyhow::Result<ExitCode> {
    engine
        .kill(&args.id, args.signal, args.timeout.map(Duration::from_secs))
        .await?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::commands::{Cli, Command};

    use super::*;

    #[test]
    fn signal_defaults_to_term() {
        let cli = Cli::try_parse_from(["ocibox", "kill", "web-1"]).expect("parse");
        let Command::Kill(args) = cli.command else {
            panic!("expected kill");
        };
        assert_eq!(args.signal, Signal::SIGTERM);
        assert_eq!(args.timeout, None);
    }

    #[test]
    fn signal_by_number_with_timeout() {
        let cli = Cli::try_parse_from(["ocibox", "kill", "web-1", "9", "--timeout", "2"]).expect("parse");
        let Command::Kill(args) = cli.command else {
            panic!("expected kill");
        };
        assert_eq!(args.signal, Signal::SIGKILL);
        assert_eq!(args.timeout, Some(2));
    }

    #[test]
    fn unknown_signal_is_rejected() {
        assert!(Cli::try_parse_from(["ocibox", "kill", "web-1", "NOPE"]).is_err());
    }
}
