//! Stream multiplexer.
//!
//! Container output is fanned out to every attached client and to the log
//! writer; input from any attached client is fanned in to the container's
//! stdin. With a pseudo-terminal, the last output line is kept so that a
//! client attaching mid-line is replayed that line before live data.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use ocibox_common::constants::TERMINAL_LINE_MAX;
use ocibox_common::error::{OciboxError, Result};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::logs::{LogWriter, StreamKind};

/// Per-client queue depth before output backpressure applies.
const CLIENT_QUEUE: usize = 64;
const READ_CHUNK: usize = 8 * 1024;

// =============================================================================
// Pseudo-terminal master
// =============================================================================

/// Non-blocking pseudo-terminal master usable from async tasks.
///
/// Reads return end-of-file once the slave side is closed everywhere
/// (the kernel reports `EIO` in that case).
#[derive(Debug)]
pub struct PtyMaster {
    inner: AsyncFd<OwnedFd>,
}

impl PtyMaster {
    /// Wraps a pseudo-terminal master descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be switched to
    /// non-blocking mode or registered with the reactor.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        use nix::fcntl::{FcntlArg, OFlag, fcntl};

        let flags = fcntl(&fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let _ = fcntl(
            &fd,
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )
        .map_err(io::Error::from)?;
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }

    /// Reads available output.
    ///
    /// # Errors
    ///
    /// Returns any read error other than `EIO`.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|fd| nix::unistd::read(fd.get_ref(), buf).map_err(io::Error::from)) {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
    }

    /// Writes all of `data` to the terminal.
    ///
    /// # Errors
    ///
    /// Returns the underlying write error.
    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|fd| nix::unistd::write(fd.get_ref(), data).map_err(io::Error::from)) {
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
        Ok(())
    }
}

impl AsFd for PtyMaster {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.get_ref().as_fd()
    }
}

// =============================================================================
// Container-side endpoints
// =============================================================================

/// Source of container output.
#[derive(Debug)]
pub enum OutputSource {
    /// Read end of a stdout or stderr pipe.
    Pipe(pipe::Receiver),
    /// Shared pseudo-terminal master.
    Pty(Arc<PtyMaster>),
}

impl OutputSource {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Pipe(rx) => rx.read(buf).await,
            Self::Pty(pty) => pty.read(buf).await,
        }
    }
}

/// Destination of client input.
#[derive(Debug)]
pub enum InputSink {
    /// Write end of the stdin pipe.
    Pipe(pipe::Sender),
    /// Shared pseudo-terminal master.
    Pty(Arc<PtyMaster>),
}

impl InputSink {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Pipe(tx) => tx.write_all(data).await,
            Self::Pty(pty) => pty.write_all(data).await,
        }
    }
}

/// Master-side ends of the container's standard streams.
#[derive(Debug)]
pub enum ParentStdio {
    /// Separate pipes per stream.
    Pipes {
        /// Write end of stdin.
        stdin: OwnedFd,
        /// Read end of stdout.
        stdout: OwnedFd,
        /// Read end of stderr.
        stderr: OwnedFd,
    },
    /// Pseudo-terminal master carrying all three streams.
    Pty(Arc<PtyMaster>),
}

impl ParentStdio {
    /// The pseudo-terminal master, if any.
    #[must_use]
    pub const fn pty(&self) -> Option<&Arc<PtyMaster>> {
        match self {
            Self::Pty(pty) => Some(pty),
            Self::Pipes { .. } => None,
        }
    }

    fn split(self) -> io::Result<(InputSink, Vec<(StreamKind, OutputSource)>)> {
        match self {
            Self::Pipes {
                stdin,
                stdout,
                stderr,
            } => Ok((
                InputSink::Pipe(pipe::Sender::from_owned_fd(stdin)?),
                vec![
                    (StreamKind::Stdout, OutputSource::Pipe(pipe::Receiver::from_owned_fd(stdout)?)),
                    (StreamKind::Stderr, OutputSource::Pipe(pipe::Receiver::from_owned_fd(stderr)?)),
                ],
            )),
            Self::Pty(pty) => Ok((
                InputSink::Pty(Arc::clone(&pty)),
                vec![(StreamKind::Stdout, OutputSource::Pty(pty))],
            )),
        }
    }
}

// =============================================================================
// Terminal replay buffer
// =============================================================================

/// The most recent output line, bounded to [`TERMINAL_LINE_MAX`] bytes.
#[derive(Debug, Default)]
pub struct LineBuffer {
    line: Vec<u8>,
}

impl LineBuffer {
    /// Records output; a byte following a newline starts a new line.
    pub fn record(&mut self, data: &[u8]) {
        for &b in data {
            if self.line.last() == Some(&b'\n') {
                self.line.clear();
            }
            self.line.push(b);
        }
        if self.line.len() > TERMINAL_LINE_MAX {
            let excess = self.line.len() - TERMINAL_LINE_MAX;
            let _ = self.line.drain(..excess);
        }
    }

    /// The buffered line, if any output has been seen.
    #[must_use]
    pub fn snapshot(&self) -> Option<Bytes> {
        (!self.line.is_empty()).then(|| Bytes::copy_from_slice(&self.line))
    }
}

// =============================================================================
// Fan-out set
// =============================================================================

#[derive(Debug, Default)]
struct FanOutInner {
    next_id: u64,
    clients: Vec<(u64, mpsc::Sender<Bytes>)>,
    replay: Option<LineBuffer>,
    closed: bool,
}

/// Synchronized set of output subscribers.
#[derive(Debug, Default)]
pub struct FanOut {
    inner: Mutex<FanOutInner>,
}

impl FanOut {
    /// Creates a fan-out set, with a replay line buffer when `terminal`.
    #[must_use]
    pub fn new(terminal: bool) -> Self {
        Self {
            inner: Mutex::new(FanOutInner {
                replay: terminal.then(LineBuffer::default),
                ..FanOutInner::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FanOutInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a subscriber.
    ///
    /// The replay line, if any, is queued before any live data. Subscribing
    /// after [`FanOut::close`] yields a receiver that ends immediately
    /// after the replay.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Bytes>) {
        let mut inner = self.lock();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        if let Some(line) = inner.replay.as_ref().and_then(LineBuffer::snapshot) {
            let _ = tx.try_send(line);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        if !inner.closed {
            inner.clients.push((id, tx));
        }
        (id, rx)
    }

    /// Removes a subscriber.
    pub fn unsubscribe(&self, id: u64) {
        self.lock().clients.retain(|(cid, _)| *cid != id);
    }

    /// Number of live subscribers.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.lock().clients.len()
    }

    /// Queues a chunk for every subscriber without waiting.
    ///
    /// A subscriber whose queue is full has stopped reading; it is dropped
    /// along with those that disconnected, so one slow client never holds
    /// up the others or the container's output.
    pub fn broadcast(&self, data: &Bytes) {
        let mut inner = self.lock();
        if let Some(replay) = inner.replay.as_mut() {
            replay.record(data);
        }
        let before = inner.clients.len();
        inner.clients.retain(|(id, tx)| match tx.try_send(data.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(client = id, "attach client fell behind, disconnecting");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        let dropped = before - inner.clients.len();
        if dropped > 0 {
            tracing::debug!(count = dropped, "dropped attach clients");
        }
    }

    /// Drops every subscriber so their receivers end.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.clients.clear();
    }
}

// =============================================================================
// Attach clients and pumps
// =============================================================================

/// Serves one attach connection until either side goes away.
fn serve_client(stream: UnixStream, fanout: &Arc<FanOut>, input: &Arc<tokio::sync::Mutex<InputSink>>) {
    let (id, mut rx) = fanout.subscribe();
    let (mut reader, mut writer) = stream.into_split();
    tracing::debug!(client = id, "attach client connected");

    let out_fanout = Arc::clone(fanout);
    let _ = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if writer.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
        out_fanout.unsubscribe(id);
        tracing::debug!(client = id, "attach client output closed");
    });

    let input = Arc::clone(input);
    let _ = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Err(e) = input.lock().await.write_all(&buf[..n]).await {
                        tracing::debug!(client = id, error = %e, "container stdin closed");
                        break;
                    }
                }
            }
        }
    });
}

/// Copies one output source to the log and to every attached client.
async fn pump_output(mut source: OutputSource, kind: StreamKind, fanout: Arc<FanOut>, log: Arc<LogWriter>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(stream = %kind, error = %e, "output read failed");
                break;
            }
        };
        if let Err(e) = log.write(kind, &buf[..n]) {
            tracing::warn!(stream = %kind, error = %e, "log write failed");
        }
        fanout.broadcast(&Bytes::copy_from_slice(&buf[..n]));
    }
    if let Err(e) = log.flush(kind) {
        tracing::warn!(stream = %kind, error = %e, "log flush failed");
    }
    tracing::debug!(stream = %kind, "output stream ended");
}

/// Running multiplexer tasks.
#[derive(Debug)]
pub struct Multiplexer {
    fanout: Arc<FanOut>,
    pumps: Vec<JoinHandle<()>>,
    acceptor: JoinHandle<()>,
}

impl Multiplexer {
    /// Starts streaming.
    ///
    /// Connections already queued on `listener` are subscribed before any
    /// output is read, so clients that attached ahead of `start` see the
    /// complete output. New connections are accepted for as long as the
    /// multiplexer runs.
    ///
    /// # Errors
    ///
    /// Returns an IPC error if the listener or stdio descriptors cannot be
    /// registered with the runtime.
    pub fn activate(
        listener: std::os::unix::net::UnixListener,
        stdio: ParentStdio,
        log: Arc<LogWriter>,
    ) -> Result<Self> {
        let terminal = stdio.pty().is_some();
        let (input, outputs) = stdio.split().map_err(|e| OciboxError::ipc("container stdio", e))?;
        let input = Arc::new(tokio::sync::Mutex::new(input));
        let fanout = Arc::new(FanOut::new(terminal));

        listener
            .set_nonblocking(true)
            .map_err(|e| OciboxError::ipc("attach socket", e))?;
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream
                        .set_nonblocking(true)
                        .map_err(|e| OciboxError::ipc("attach socket", e))?;
                    let stream = UnixStream::from_std(stream).map_err(|e| OciboxError::ipc("attach socket", e))?;
                    serve_client(stream, &fanout, &input);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(OciboxError::ipc("attach socket", e)),
            }
        }
        tracing::debug!(clients = fanout.len(), "attach clients queued before start");

        let listener = tokio::net::UnixListener::from_std(listener).map_err(|e| OciboxError::ipc("attach socket", e))?;
        let accept_fanout = Arc::clone(&fanout);
        let acceptor = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => serve_client(stream, &accept_fanout, &input),
                    Err(e) => {
                        tracing::warn!(error = %e, "attach accept failed");
                        break;
                    }
                }
            }
        });

        let pumps = outputs
            .into_iter()
            .map(|(kind, source)| tokio::spawn(pump_output(source, kind, Arc::clone(&fanout), Arc::clone(&log))))
            .collect();

        Ok(Self {
            fanout,
            pumps,
            acceptor,
        })
    }

    /// Waits for the output streams to end, then disconnects every client.
    ///
    /// Output may stay open past the container's exit when descendants
    /// inherited it, so the wait is bounded by `grace`.
    pub async fn finish(self, grace: Duration) {
        let pumps = join_all(self.pumps);
        if tokio::time::timeout(grace, pumps).await.is_err() {
            tracing::warn!("output streams still open after container exit");
        }
        self.acceptor.abort();
        self.fanout.close();
    }
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_keeps_last_line() {
        let mut buf = LineBuffer::default();
        assert!(buf.snapshot().is_none());
        buf.record(b"first\r\nsec");
        assert_eq!(buf.snapshot().as_deref(), Some(&b"sec"[..]));
        buf.record(b"ond\r\n");
        assert_eq!(buf.snapshot().as_deref(), Some(&b"second\r\n"[..]));
        buf.record(b"x");
        assert_eq!(buf.snapshot().as_deref(), Some(&b"x"[..]));
    }

    #[test]
    fn line_buffer_is_bounded() {
        let mut buf = LineBuffer::default();
        buf.record(&vec![b'a'; TERMINAL_LINE_MAX * 2]);
        assert_eq!(buf.snapshot().map(|b| b.len()), Some(TERMINAL_LINE_MAX));
    }

    #[tokio::test]
    async fn every_subscriber_sees_identical_chunks() {
        let fanout = FanOut::new(false);
        let mut receivers: Vec<_> = (0..3).map(|_| fanout.subscribe().1).collect();
        for chunk in ["a", "b", "c"] {
            fanout.broadcast(&Bytes::from(chunk));
        }
        fanout.close();
        for rx in &mut receivers {
            let mut got = Vec::new();
            while let Some(chunk) = rx.recv().await {
                got.extend_from_slice(&chunk);
            }
            assert_eq!(got, b"abc");
        }
    }

    #[tokio::test]
    async fn late_terminal_subscriber_gets_replay_first() {
        let fanout = FanOut::new(true);
        fanout.broadcast(&Bytes::from_static(b"prompt$ "));
        let (_, mut rx) = fanout.subscribe();
        fanout.broadcast(&Bytes::from_static(b"ls\r\n"));
        assert_eq!(rx.recv().await.as_deref(), Some(&b"prompt$ "[..]));
        assert_eq!(rx.recv().await.as_deref(), Some(&b"ls\r\n"[..]));
    }

    #[tokio::test]
    async fn dropped_subscriber_is_removed() {
        let fanout = FanOut::new(false);
        let (_, rx) = fanout.subscribe();
        let (_, _keep) = fanout.subscribe();
        drop(rx);
        fanout.broadcast(&Bytes::from_static(b"x"));
        assert_eq!(fanout.len(), 1);
    }

    #[tokio::test]
    async fn stalled_subscriber_is_dropped_without_blocking_others() {
        let fanout = FanOut::new(false);
        let (_, mut stalled) = fanout.subscribe();
        let (_, mut reader) = fanout.subscribe();

        for i in 0..CLIENT_QUEUE * 2 {
            fanout.broadcast(&Bytes::from(i.to_string()));
            let got = reader.recv().await.expect("live chunk");
            assert_eq!(got, Bytes::from(i.to_string()));
        }
        assert_eq!(fanout.len(), 1);

        let mut queued = 0;
        while stalled.recv().await.is_some() {
            queued += 1;
        }
        assert_eq!(queued, CLIENT_QUEUE);
    }

    #[tokio::test]
    async fn pty_master_reports_eof_after_slave_closes() {
        let pty = ocibox_core::terminal::open(None).expect("openpty");
        let master = PtyMaster::new(pty.master).expect("master");
        nix::unistd::write(&pty.slave, b"hi\n").expect("write slave");
        drop(pty.slave);

        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = master.read(&mut buf).await.expect("read");
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hi\r\n");
    }
}
