//! Master/container start handshake.
//!
//! The container process signals [`READY`] once its environment is set up
//! and then blocks until the master sends [`START`]. The sync descriptor is
//! close-on-exec, so end-of-file after `START` means `execve` succeeded.
//! Any failure in the child is reported as a frame of
//! `[FAILURE, stage, errno (i32, little endian)]` before it exits.

use std::fmt;
use std::os::unix::net::UnixStream as StdUnixStream;

use ocibox_common::error::{OciboxError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Child to master: setup finished, waiting for the start byte.
pub const READY: u8 = 0x01;
/// Master to child: proceed to exec.
pub const START: u8 = 0x02;
/// Child to master: a setup step failed; stage and errno follow.
pub const FAILURE: u8 = 0xFF;

/// Length of a failure frame.
pub const FAILURE_FRAME_LEN: usize = 6;

/// Setup step the container process was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChildStage {
    /// Joining existing namespaces.
    Namespaces = 1,
    /// Wiring standard streams or the terminal.
    Stdio = 2,
    /// Changing root into the bundle rootfs.
    Rootfs = 3,
    /// Changing to the working directory.
    Cwd = 4,
    /// Setting the hostname.
    Hostname = 5,
    /// Switching user and groups.
    Identity = 6,
    /// Executing the process.
    Exec = 7,
    /// Talking to the master.
    Sync = 8,
}

impl ChildStage {
    const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Namespaces,
            2 => Self::Stdio,
            3 => Self::Rootfs,
            4 => Self::Cwd,
            5 => Self::Hostname,
            6 => Self::Identity,
            7 => Self::Exec,
            8 => Self::Sync,
            _ => return None,
        })
    }
}

impl fmt::Display for ChildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Namespaces => "joining namespaces",
            Self::Stdio => "setting up stdio",
            Self::Rootfs => "changing root",
            Self::Cwd => "changing directory",
            Self::Hostname => "setting hostname",
            Self::Identity => "switching user",
            Self::Exec => "executing process",
            Self::Sync => "synchronising with runtime",
        };
        f.write_str(name)
    }
}

/// Encodes a failure frame. Used by the container process, which may not
/// allocate, so the frame is a fixed-size array.
#[must_use]
pub fn failure_frame(stage: ChildStage, errno: i32) -> [u8; FAILURE_FRAME_LEN] {
    let e = errno.to_le_bytes();
    [FAILURE, stage as u8, e[0], e[1], e[2], e[3]]
}

fn decode_failure(frame: &[u8]) -> OciboxError {
    let stage = frame.get(1).copied().and_then(ChildStage::from_u8);
    let errno = frame
        .get(2..FAILURE_FRAME_LEN)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map_or(0, i32::from_le_bytes);
    let cause = std::io::Error::from_raw_os_error(errno);
    OciboxError::Process {
        message: match stage {
            Some(stage) => format!("{stage}: {cause}"),
            None => format!("container setup failed: {cause}"),
        },
    }
}

/// Master side of the sync channel.
#[derive(Debug)]
pub struct SyncPipe {
    stream: UnixStream,
}

impl SyncPipe {
    /// Wraps the master end of the socket pair.
    ///
    /// # Errors
    ///
    /// Returns an IPC error if the socket cannot be registered with the
    /// runtime.
    pub fn new(stream: StdUnixStream) -> Result<Self> {
        stream
            .set_nonblocking(true)
            .map_err(|e| OciboxError::ipc("sync pipe", e))?;
        let stream = UnixStream::from_std(stream).map_err(|e| OciboxError::ipc("sync pipe", e))?;
        Ok(Self { stream })
    }

    /// Reads one message from the child, returning `None` on end-of-file.
    async fn read_message(&mut self) -> Result<Option<u8>> {
        let mut first = [0u8; 1];
        let n = self
            .stream
            .read(&mut first)
            .await
            .map_err(|e| OciboxError::ipc("sync pipe", e))?;
        if n == 0 {
            return Ok(None);
        }
        if first[0] == FAILURE {
            let mut frame = [0u8; FAILURE_FRAME_LEN];
            frame[0] = FAILURE;
            // A truncated frame still reports the failure, with errno 0.
            let mut filled = 1;
            while filled < FAILURE_FRAME_LEN {
                match self.stream.read(&mut frame[filled..]).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => filled += n,
                }
            }
            return Err(decode_failure(&frame[..filled]));
        }
        Ok(Some(first[0]))
    }

    /// Waits until the container process reports it is ready.
    ///
    /// # Errors
    ///
    /// Returns a process error if the child failed or exited before
    /// becoming ready.
    pub async fn wait_ready(&mut self) -> Result<()> {
        match self.read_message().await? {
            Some(READY) => {
                tracing::debug!("container process ready");
                Ok(())
            }
            Some(other) => Err(OciboxError::Process {
                message: format!("unexpected sync byte {other:#04x}"),
            }),
            None => Err(OciboxError::Process {
                message: "container process exited during setup".into(),
            }),
        }
    }

    /// Releases the container process.
    ///
    /// # Errors
    ///
    /// Returns an IPC error if the start byte cannot be written.
    pub async fn release(&mut self) -> Result<()> {
        self.stream
            .write_all(&[START])
            .await
            .map_err(|e| OciboxError::ipc("sync pipe", e))
    }

    /// Waits for the outcome of the exec that follows the start byte.
    ///
    /// # Errors
    ///
    /// Returns the child's reported failure.
    pub async fn wait_exec(&mut self) -> Result<()> {
        match self.read_message().await? {
            None => {
                tracing::debug!("container process executed");
                Ok(())
            }
            Some(other) => Err(OciboxError::Process {
                message: format!("unexpected sync byte {other:#04x}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn ready_start_then_eof_is_success() {
        let (parent, mut child) = StdUnixStream::pair().expect("pair");
        let mut pipe = SyncPipe::new(parent).expect("pipe");

        let worker = std::thread::spawn(move || {
            use std::io::Read;
            child.write_all(&[READY]).expect("ready");
            let mut b = [0u8; 1];
            child.read_exact(&mut b).expect("start");
            assert_eq!(b[0], START);
        });

        pipe.wait_ready().await.expect("ready");
        pipe.release().await.expect("release");
        pipe.wait_exec().await.expect("exec");
        worker.join().expect("join");
    }

    #[tokio::test]
    async fn failure_frame_becomes_process_error() {
        let (parent, mut child) = StdUnixStream::pair().expect("pair");
        let mut pipe = SyncPipe::new(parent).expect("pipe");
        child
            .write_all(&failure_frame(ChildStage::Exec, libc::ENOENT))
            .expect("write");
        drop(child);

        let err = pipe.wait_ready().await.expect_err("failure");
        let msg = err.to_string();
        assert!(msg.contains("executing process"), "{msg}");
        assert!(msg.contains("No such file"), "{msg}");
    }

    #[tokio::test]
    async fn early_eof_is_not_ready() {
        let (parent, child) = StdUnixStream::pair().expect("pair");
        let mut pipe = SyncPipe::new(parent).expect("pipe");
        drop(child);
        assert!(matches!(
            pipe.wait_ready().await,
            Err(OciboxError::Process { .. })
        ));
    }
}
