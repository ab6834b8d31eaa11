//! `ocibox list`: List container records.

use std::process::ExitCode;

use clap::{Args, ValueEnum};
use ocibox_common::types::Status;
use ocibox_runtime::engine::Engine;
use ocibox_runtime::instance::ListFilter;

use crate::output::{self, Row};

/// Output format of `list`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    /// Aligned columns.
    #[default]
    Table,
    /// A JSON array of states.
    Json,
}

/// Arguments for the `list` command.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Shell-style pattern matched against container IDs.
    pub pattern: Option<String>,

    /// Only containers in this status.
    #[arg(long)]
    pub status: Option<Status>,

    /// Only containers owned by this user.
    #[arg(long)]
    pub user: Option<String>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t)]
    pub format: ListFormat,

    /// Print container IDs only.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Executes the `list` command.
///
/// # Errors
///
/// Returns an error if the pattern is invalid or the store is unreadable.
pub fn execute(engine: &Engine, args: ListArgs) -> anyhow::Result<ExitCode> {
    let filter = ListFilter {
        user: args.user,
        pattern: args.pattern,
        status: args.status,
    };
    let instances = engine.list(&filter)?;

    if args.quiet {
        let ids: String = instances.iter().map(|i| format!("{}\n", i.id)).collect();
        output::print_text(&ids)?;
        return Ok(ExitCode::SUCCESS);
    }
    match args.format {
        ListFormat::Json => {
            let states: Vec<_> = instances.iter().filter_map(|i| i.state().ok()).collect();
            output::print_json(&states)?;
        }
        ListFormat::Table => {
            let rows: Vec<Row> = instances.iter().map(Row::from_instance).collect();
            output::print_text(&output::render_table(&rows))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::commands::{Cli, Command};

    use super::*;

    #[test]
    fn parses_filters() {
        let cli = Cli::try_parse_from(["ocibox", "ps", "web-*", "--status", "running", "-f", "json"]).expect("parse");
        let Command::List(args) = cli.command else {
            panic!("expected list");
        };
        assert_eq!(args.pattern.as_deref(), Some("web-*"));
        assert_eq!(args.status, Some(Status::Running));
        assert_eq!(args.format, ListFormat::Json);
        assert!(!args.quiet);
    }
}
