//! `ocibox update`: Apply new resource limits.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use ocibox_runtime::engine::{Engine, ResourceSource};

/// Arguments for the `update` command.
#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Container ID.
    pub id: String,

    /// JSON resources document; `-` reads it from stdin.
    #[arg(short, long, default_value = "-")]
    pub resources: PathBuf,
}

impl UpdateArgs {
    fn source(self) -> ResourceSource {
        if self.resources.as_os_str() == "-" {
            ResourceSource::Stdin
        } else {
            ResourceSource::File(self.resources)
        }
    }
}

/// Executes the `update` command.
///
/// # Errors
///
/// Returns an error if the document is invalid or the cgroup rejects it.
pub async fn execute(engine: &Engine, args: UpdateArgs) -> anyhow::Result<ExitCode> {
    let id = args.id.clone();
    engine.update(&id, args.source()).await?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dash_reads_stdin() {
        let args = UpdateArgs {
            id: "web-1".into(),
            resources: PathBuf::from("-"),
        };
        assert!(matches!(args.source(), ResourceSource::Stdin));

        let args = UpdateArgs {
            id: "web-1".into(),
            resources: PathBuf::from("limits.json"),
        };
        assert!(matches!(args.source(), ResourceSource::File(p) if p == PathBuf::from("limits.json")));
    }
}
