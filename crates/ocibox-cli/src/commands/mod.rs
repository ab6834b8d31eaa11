//! CLI command definitions and dispatch.

pub mod attach;
pub mod create;
pub mod delete;
pub mod exec;
pub mod kill;
pub mod list;
pub mod master;
pub mod pause;
pub mod reopen_log;
pub mod resize;
pub mod run;
pub mod start;
pub mod state;
pub mod update;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use ocibox_common::config::RuntimeConfig;
use ocibox_common::types::LogFormat;
use ocibox_runtime::engine::{Engine, Launcher};

/// ocibox: daemon-less OCI container runtime.
#[derive(Parser, Debug)]
#[command(name = "ocibox", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding instance records and sockets.
    #[arg(long, global = true, env = "OCIBOX_RUNTIME_DIR")]
    pub runtime_dir: Option<PathBuf>,

    /// Mount point of the cgroup v2 hierarchy.
    #[arg(long, global = true, env = "OCIBOX_CGROUP_ROOT")]
    pub cgroup_root: Option<PathBuf>,

    /// Default container log format (basic, kubernetes, json).
    #[arg(long, global = true, env = "OCIBOX_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Emit diagnostics as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a container from a bundle and park it before its process runs.
    Create(create::CreateArgs),
    /// Release a created container's process.
    Start(IdArgs),
    /// Print a container's state as JSON.
    State(IdArgs),
    /// Send a signal to a container's process.
    Kill(kill::KillArgs),
    /// Delete a stopped or created container.
    Delete(IdArgs),
    /// Attach to a container's stdio.
    Attach(attach::AttachArgs),
    /// Run a command inside a running container.
    Exec(exec::ExecArgs),
    /// Change a container's resource limits.
    Update(update::UpdateArgs),
    /// Freeze every process of a container.
    Pause(IdArgs),
    /// Thaw a paused container.
    Resume(IdArgs),
    /// List containers.
    #[command(alias = "ps")]
    List(list::ListArgs),
    /// Create, start and attach to a container, deleting it on exit.
    Run(run::RunArgs),
    /// Resize a container's terminal.
    Resize(resize::ResizeArgs),
    /// Reopen a container's log file after rotation.
    ReopenLog(IdArgs),
    /// Supervise a container (started by `create`).
    #[command(hide = true)]
    Master(IdArgs),
}

/// A single container ID argument.
#[derive(Args, Debug)]
pub struct IdArgs {
    /// Container ID.
    pub id: String,
}

impl Cli {
    /// Runtime configuration from global flags and their environment
    /// fallbacks.
    #[must_use]
    pub fn runtime_config(&self) -> RuntimeConfig {
        let mut config = self
            .runtime_dir
            .clone()
            .map_or_else(RuntimeConfig::default, RuntimeConfig::with_runtime_dir);
        if let Some(root) = &self.cgroup_root {
            config = config.cgroup_root(root);
        }
        if let Some(format) = self.log_format {
            config.default_log_format = format;
        }
        config
    }
}

/// Opens an engine whose masters are re-executions of this binary.
fn engine(config: RuntimeConfig) -> anyhow::Result<Engine> {
    let program = std::env::current_exe()?;
    Ok(Engine::new(config, Launcher::Exec { program })?)
}

/// Maps a container exit code onto a process exit status.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(u8::MAX)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(exit_status(code))
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let engine = engine(cli.runtime_config())?;
    match cli.command {
        Command::Create(args) => create::execute(&engine, args).await,
        Command::Start(args) => start::execute(&engine, &args).await,
        Command::State(args) => state::execute(&engine, &args),
        Command::Kill(args) => kill::execute(&engine, args).await,
        Command::Delete(args) => delete::execute(&engine, &args).await,
        Command::Attach(args) => attach::execute(&engine, &args).await,
        Command::Exec(args) => exec::execute(&engine, args).await,
        Command::Update(args) => update::execute(&engine, args).await,
        Command::Pause(args) => pause::pause(&engine, &args).await,
        Command::Resume(args) => pause::resume(&engine, &args).await,
        Command::List(args) => list::execute(&engine, args),
        Command::Run(args) => run::execute(&engine, args).await,
        Command::Resize(args) => resize::execute(&engine, &args).await,
        Command::ReopenLog(args) => reopen_log::execute(&engine, &args).await,
        Command::Master(args) => master::execute(engine.config().clone(), &args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_build_runtime_config() {
        let cli = Cli::try_parse_from([
            "ocibox",
            "--runtime-dir",
            "/tmp/rt",
            "--cgroup-root",
            "/tmp/cg",
            "--log-format",
            "json",
            "state",
            "web-1",
        ])
        .expect("parse");
        let config = cli.runtime_config();
        assert_eq!(config.runtime_dir, PathBuf::from("/tmp/rt"));
        assert_eq!(config.cgroup_root, PathBuf::from("/tmp/cg"));
        assert_eq!(config.default_log_format, LogFormat::Json);
        assert!(matches!(cli.command, Command::State(IdArgs { ref id }) if id == "web-1"));
    }

    #[test]
    fn exit_codes_saturate() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(137), 137);
        assert_eq!(exit_status(-1), 255);
        assert_eq!(exit_status(300), 255);
    }

    #[test]
    fn master_is_hidden_but_parses() {
        let cli = Cli::try_parse_from(["ocibox", "master", "web-1"]).expect("parse");
        assert!(matches!(cli.command, Command::Master(_)));
    }
}
