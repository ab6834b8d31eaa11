//! Container log writer.
//!
//! Output chunks are split into lines and written in one of three formats:
//!
//! - `basic`: `<timestamp> <stream> <line>`
//! - `kubernetes`: `<timestamp> <stream> <F|P> <line>` (CRI)
//! - `json`: `{"time":..,"stream":..,"log":..}`
//!
//! Incomplete trailing data is held back until its newline arrives, the
//! stream ends, or it grows past [`MAX_PARTIAL`].

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use ocibox_common::error::{OciboxError, Result};
use ocibox_common::types::LogFormat;

/// Largest partial line held back before it is written as a partial entry.
pub const MAX_PARTIAL: usize = 16 * 1024;

/// Origin of a chunk of container output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard output, or the terminal.
    Stdout,
    /// Standard error.
    Stderr,
}

impl StreamKind {
    const fn index(self) -> usize {
        match self {
            Self::Stdout => 0,
            Self::Stderr => 1,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Debug)]
struct Sink {
    file: File,
    pending: [Vec<u8>; 2],
}

/// Writes container output to the log file.
///
/// Shared between the stdout and stderr pumps; the file handle can be
/// swapped by [`LogWriter::reopen`] while they run.
#[derive(Debug)]
pub struct LogWriter {
    path: PathBuf,
    format: LogFormat,
    sink: Mutex<Sink>,
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| OciboxError::io(parent, e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| OciboxError::io(path, e))
}

impl LogWriter {
    /// Opens (or creates) the log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or its directory cannot be created.
    pub fn open(path: &Path, format: LogFormat) -> Result<Self> {
        let file = open_append(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            format,
            sink: Mutex::new(Sink {
                file,
                pending: [Vec::new(), Vec::new()],
            }),
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a chunk of output from `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log file cannot be written.
    pub fn write(&self, stream: StreamKind, data: &[u8]) -> Result<()> {
        let mut sink = self.lock();
        let mut out = Vec::new();
        {
            let pending = &mut sink.pending[stream.index()];
            pending.extend_from_slice(data);
            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                self.format_line(&mut out, stream, &line[..pos], false);
            }
            if pending.len() > MAX_PARTIAL {
                let partial = std::mem::take(pending);
                self.format_line(&mut out, stream, &partial, true);
            }
        }
        self.emit(&mut sink, &out)
    }

    /// Writes out any held-back partial line of `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log file cannot be written.
    pub fn flush(&self, stream: StreamKind) -> Result<()> {
        let mut sink = self.lock();
        let partial = std::mem::take(&mut sink.pending[stream.index()]);
        if partial.is_empty() {
            return Ok(());
        }
        let mut out = Vec::new();
        self.format_line(&mut out, stream, &partial, true);
        self.emit(&mut sink, &out)
    }

    /// Closes and reopens the log file, for external rotation.
    ///
    /// Held-back partial lines are kept and land in the new file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be reopened; the old handle is
    /// kept in that case.
    pub fn reopen(&self) -> Result<()> {
        let file = open_append(&self.path)?;
        self.lock().file = file;
        tracing::info!(path = %self.path.display(), "log file reopened");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Sink> {
        self.sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, sink: &mut Sink, out: &[u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        sink.file.write_all(out).map_err(|e| OciboxError::io(&self.path, e))
    }

    fn format_line(&self, out: &mut Vec<u8>, stream: StreamKind, line: &[u8], partial: bool) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let time = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let text = String::from_utf8_lossy(line);
        let _ = match self.format {
            LogFormat::Basic => writeln!(out, "{time} {stream} {text}"),
            LogFormat::Kubernetes => {
                let tag = if partial { 'P' } else { 'F' };
                writeln!(out, "{time} {stream} {tag} {text}")
            }
            LogFormat::Json => {
                let entry = serde_json::json!({
                    "time": time,
                    "stream": stream.to_string(),
                    "log": text,
                });
                writeln!(out, "{entry}")
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .expect("read log")
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn basic_format_splits_lines_across_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.log");
        let log = LogWriter::open(&path, LogFormat::Basic).expect("open");
        log.write(StreamKind::Stdout, b"hel").expect("write");
        log.write(StreamKind::Stdout, b"lo\nwor").expect("write");
        log.write(StreamKind::Stderr, b"oops\n").expect("write");
        log.flush(StreamKind::Stdout).expect("flush");

        let got = lines(&path);
        assert_eq!(got.len(), 3);
        assert!(got[0].ends_with(" stdout hello"));
        assert!(got[1].ends_with(" stderr oops"));
        assert!(got[2].ends_with(" stdout wor"));
    }

    #[test]
    fn kubernetes_format_tags_partial_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("k.log");
        let log = LogWriter::open(&path, LogFormat::Kubernetes).expect("open");
        log.write(StreamKind::Stdout, b"full\r\nhalf").expect("write");
        log.flush(StreamKind::Stdout).expect("flush");

        let got = lines(&path);
        assert!(got[0].ends_with(" stdout F full"));
        assert!(got[1].ends_with(" stdout P half"));
    }

    #[test]
    fn json_format_is_one_object_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("j.log");
        let log = LogWriter::open(&path, LogFormat::Json).expect("open");
        log.write(StreamKind::Stderr, b"a \"quoted\" line\n").expect("write");

        let got = lines(&path);
        let entry: serde_json::Value = serde_json::from_str(&got[0]).expect("json");
        assert_eq!(entry["stream"], "stderr");
        assert_eq!(entry["log"], "a \"quoted\" line");
        assert!(entry["time"].as_str().is_some_and(|t| t.ends_with('Z')));
    }

    #[test]
    fn reopen_follows_rotation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("r.log");
        let rotated = dir.path().join("r.log.1");
        let log = LogWriter::open(&path, LogFormat::Basic).expect("open");
        log.write(StreamKind::Stdout, b"before\n").expect("write");
        std::fs::rename(&path, &rotated).expect("rotate");
        log.reopen().expect("reopen");
        log.write(StreamKind::Stdout, b"after\n").expect("write");

        assert!(lines(&rotated)[0].ends_with("before"));
        assert!(lines(&path)[0].ends_with("after"));
    }

    #[test]
    fn oversized_partial_is_flushed_early() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.log");
        let log = LogWriter::open(&path, LogFormat::Kubernetes).expect("open");
        log.write(StreamKind::Stdout, &vec![b'x'; MAX_PARTIAL + 1]).expect("write");
        assert_eq!(lines(&path).len(), 1);
        assert!(lines(&path)[0].contains(" stdout P "));
    }
}
