//! OCI lifecycle hook execution.
//!
//! Each hook runs as an external process with its own arguments and
//! environment; the current container state is written to its stdin.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use ocibox_common::error::{OciboxError, Result};
use ocibox_common::spec::Hook;
use ocibox_common::types::State;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Lifecycle point a hook belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// After `Created` is committed, before the process is released.
    Prestart,
    /// After `Running` is committed.
    Poststart,
    /// After `Stopped` is committed.
    Poststop,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prestart => write!(f, "prestart"),
            Self::Poststart => write!(f, "poststart"),
            Self::Poststop => write!(f, "poststop"),
        }
    }
}

/// Runs hooks one after another, stopping at the first failure.
///
/// # Errors
///
/// Returns the first [`OciboxError::Hook`] or [`OciboxError::HookTimeout`].
pub async fn run_hooks(point: HookPoint, hooks: &[Hook], state: &State) -> Result<()> {
    if hooks.is_empty() {
        return Ok(());
    }
    let input = serde_json::to_vec(state)?;
    for hook in hooks {
        run_hook(point, hook, &input).await?;
    }
    Ok(())
}

/// Runs hooks and logs failures instead of returning them.
pub async fn run_hooks_best_effort(point: HookPoint, hooks: &[Hook], state: &State) {
    if let Err(e) = run_hooks(point, hooks, state).await {
        tracing::warn!(id = %state.id, point = %point, error = %e, "hook failed");
    }
}

/// Runs a single hook with `input` on stdin.
///
/// The hook process is killed when its timeout elapses.
///
/// # Errors
///
/// Returns [`OciboxError::HookTimeout`] on timeout, or
/// [`OciboxError::Hook`] if the hook cannot be spawned or exits non-zero.
pub async fn run_hook(point: HookPoint, hook: &Hook, input: &[u8]) -> Result<()> {
    let name = format!("{point} {}", hook.path.display());
    let failed = |message: String| OciboxError::Hook {
        hook: name.clone(),
        message,
    };

    let mut cmd = Command::new(&hook.path);
    if let Some((arg0, rest)) = hook.args.split_first() {
        let _ = cmd.arg0(arg0).args(rest);
    }
    let _ = cmd
        .env_clear()
        .envs(hook.env.iter().filter_map(|kv| kv.split_once('=')))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| failed(format!("spawn failed: {e}")))?;
    tracing::debug!(hook = %name, pid = child.id(), "hook started");

    let run = async {
        if let Some(mut stdin) = child.stdin.take() {
            // A hook that ignores its input may exit before reading it.
            if let Err(e) = stdin.write_all(input).await {
                tracing::debug!(hook = %name, error = %e, "hook did not consume state");
            }
        }
        child.wait_with_output().await
    };

    let output = match hook.timeout {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), run)
            .await
            .map_err(|_| OciboxError::HookTimeout {
                hook: name.clone(),
                timeout_secs: secs,
            })?,
        None => run.await,
    }
    .map_err(|e| failed(format!("wait failed: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(failed(format!("{}: {}", output.status, stderr.trim())));
    }
    tracing::debug!(hook = %name, "hook finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Instant;

    use ocibox_common::types::ContainerId;

    use super::*;

    fn sh(script: &str, timeout: Option<u64>) -> Hook {
        Hook {
            path: PathBuf::from("/bin/sh"),
            args: vec!["sh".into(), "-c".into(), script.into()],
            env: vec!["HOOK_VAR=set".into()],
            timeout,
        }
    }

    fn state() -> State {
        let id = ContainerId::parse("hooked").expect("id");
        State::new(&id, PathBuf::from("/bundle"), BTreeMap::new())
    }

    #[tokio::test]
    async fn hook_receives_state_and_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out");
        let script = format!("cat > {0}; echo \"$HOOK_VAR\" >> {0}", out.display());
        run_hooks(HookPoint::Prestart, &[sh(&script, None)], &state())
            .await
            .expect("hook succeeds");
        let written = std::fs::read_to_string(&out).expect("read");
        assert!(written.contains(r#""id":"hooked""#));
        assert!(written.ends_with("set\n"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_hook_error() {
        let err = run_hooks(HookPoint::Poststart, &[sh("echo boom >&2; exit 3", None)], &state())
            .await
            .expect_err("must fail");
        assert!(matches!(err, OciboxError::Hook { .. }));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn timeout_is_distinct_error() {
        let started = Instant::now();
        let err = run_hooks(HookPoint::Prestart, &[sh("sleep 30", Some(1))], &state())
            .await
            .expect_err("must time out");
        assert!(matches!(err, OciboxError::HookTimeout { timeout_secs: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn first_failure_stops_the_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("second-ran");
        let hooks = [sh("exit 1", None), sh(&format!("touch {}", marker.display()), None)];
        assert!(run_hooks(HookPoint::Prestart, &hooks, &state()).await.is_err());
        assert!(!marker.exists());
    }
}
