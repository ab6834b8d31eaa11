//! `ocibox master`: Supervise one container for its whole life.
//!
//! Launched by `create` in a new session with stdout piped back. Stdout is
//! closed once the container is `Created` (or carries the error when it
//! is not); the process then stays until the container has stopped and been
//! cleaned up.

use std::process::ExitCode;

use ocibox_common::config::RuntimeConfig;
use ocibox_runtime::master::{self, Detach};

use super::IdArgs;

/// Executes the hidden `master` command.
///
/// # Errors
///
/// Returns the creation error after it has been reported on stdout.
pub async fn execute(config: RuntimeConfig, args: &IdArgs) -> anyhow::Result<ExitCode> {
    master::run(config, args.id.clone(), Detach::Stdio).await?;
    Ok(ExitCode::SUCCESS)
}
