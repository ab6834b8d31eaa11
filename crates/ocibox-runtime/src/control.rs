//! Control socket framing.
//!
//! Each frame is a big-endian `u32` length followed by that many bytes of
//! JSON. A connection carries exactly one [`Control`] request and one
//! [`ControlReply`].

use std::path::Path;

use ocibox_common::constants::MAX_CONTROL_FRAME;
use ocibox_common::error::{OciboxError, Result};
use ocibox_common::types::{Control, ControlReply};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

/// Writes one length-prefixed JSON frame.
///
/// # Errors
///
/// Returns an IPC error if the frame is too large or cannot be written.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|&n| n as usize <= MAX_CONTROL_FRAME)
        .ok_or_else(|| {
            OciboxError::ipc(
                "control frame",
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"),
            )
        })?;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| OciboxError::ipc("control frame", e))?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| OciboxError::ipc("control frame", e))?;
    writer.flush().await.map_err(|e| OciboxError::ipc("control frame", e))
}

/// Reads one length-prefixed JSON frame.
///
/// # Errors
///
/// Returns an IPC error for short reads or oversized frames, and a
/// serialization error for malformed JSON.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    let _ = reader
        .read_exact(&mut len)
        .await
        .map_err(|e| OciboxError::ipc("control frame", e))?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_CONTROL_FRAME {
        return Err(OciboxError::ipc(
            "control frame",
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("frame of {len} bytes")),
        ));
    }
    let mut body = vec![0u8; len];
    let _ = reader
        .read_exact(&mut body)
        .await
        .map_err(|e| OciboxError::ipc("control frame", e))?;
    Ok(serde_json::from_slice(&body)?)
}

/// Sends a control message to the master listening on `socket`.
///
/// # Errors
///
/// Returns an IPC error if the master is unreachable, or
/// [`OciboxError::Rejected`] carrying the master's error text.
pub async fn send(socket: &Path, message: Control) -> Result<()> {
    let ctx = || format!("control socket {}", socket.display());
    let mut stream = UnixStream::connect(socket)
        .await
        .map_err(|e| OciboxError::ipc(ctx(), e))?;
    tracing::debug!(message = message.name(), socket = %socket.display(), "sending control message");
    write_frame(&mut stream, &message).await?;
    let reply: ControlReply = read_frame(&mut stream).await?;
    match reply.error {
        Some(message) => Err(OciboxError::Rejected { message }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_and_reply_over_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("control.sock");
        let listener = tokio::net::UnixListener::bind(&path).expect("bind");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let msg: Control = read_frame(&mut stream).await.expect("read");
            let reply = match msg {
                Control::Pause => ControlReply::ok(),
                other => ControlReply::failed(format!("{} not allowed", other.name())),
            };
            write_frame(&mut stream, &reply).await.expect("reply");
        });

        send(&path, Control::Pause).await.expect("accepted");
        server.await.expect("join");
    }

    #[tokio::test]
    async fn error_reply_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("control.sock");
        let listener = tokio::net::UnixListener::bind(&path).expect("bind");
        let _server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let _: Control = read_frame(&mut stream).await.expect("read");
            write_frame(&mut stream, &ControlReply::failed("container is not created"))
                .await
                .expect("reply");
        });

        let err = send(&path, Control::Start).await.expect_err("rejected");
        assert!(matches!(err, OciboxError::Rejected { ref message } if message == "container is not created"));
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.expect("write");
        let res: Result<Control> = read_frame(&mut b).await;
        assert!(matches!(res, Err(OciboxError::Ipc { .. })));
    }

    #[tokio::test]
    async fn missing_master_is_ipc_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = send(&dir.path().join("gone.sock"), Control::Resume)
            .await
            .expect_err("no listener");
        assert!(matches!(err, OciboxError::Ipc { .. }));
    }
}
