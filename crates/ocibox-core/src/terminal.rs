//! Pseudo-terminal allocation and resizing.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::pty::{Winsize, openpty};
use ocibox_common::error::{OciboxError, Result};
use ocibox_common::spec::ConsoleSize;

/// A pseudo-terminal pair. The master side stays with the runtime, the
/// slave side becomes the container's controlling terminal.
#[derive(Debug)]
pub struct Pty {
    /// Master side.
    pub master: OwnedFd,
    /// Slave side.
    pub slave: OwnedFd,
}

const fn winsize(width: u16, height: u16) -> Winsize {
    Winsize {
        ws_row: height,
        ws_col: width,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Allocates a pseudo-terminal, optionally with an initial geometry.
///
/// Both descriptors are close-on-exec; the container process duplicates
/// the slave onto its standard streams.
///
/// # Errors
///
/// Returns an error if no pseudo-terminal can be allocated.
pub fn open(size: Option<ConsoleSize>) -> Result<Pty> {
    let ws = size.map(|s| winsize(s.width, s.height));
    let pty = openpty(ws.as_ref(), None).map_err(|e| OciboxError::Process {
        message: format!("openpty failed: {e}"),
    })?;
    for fd in [&pty.master, &pty.slave] {
        let _ = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| OciboxError::Process {
            message: format!("fcntl on pty failed: {e}"),
        })?;
    }
    tracing::debug!(master = pty.master.as_raw_fd(), "pseudo-terminal allocated");
    Ok(Pty {
        master: pty.master,
        slave: pty.slave,
    })
}

/// Applies a new geometry to a terminal.
///
/// # Errors
///
/// Returns an error if the `TIOCSWINSZ` ioctl fails.
#[allow(unsafe_code)]
pub fn resize(fd: BorrowedFd<'_>, width: u16, height: u16) -> Result<()> {
    let ws = winsize(width, height);
    // SAFETY: fd is a valid open descriptor for the lifetime of the borrow
    // and ws is a properly initialised winsize that outlives the call.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &raw const ws) };
    if rc < 0 {
        return Err(OciboxError::Process {
            message: format!("TIOCSWINSZ failed: {}", std::io::Error::last_os_error()),
        });
    }
    tracing::debug!(width, height, "terminal resized");
    Ok(())
}

/// Reads the current geometry of a terminal as `(width, height)`.
///
/// # Errors
///
/// Returns an error if the `TIOCGWINSZ` ioctl fails.
#[allow(unsafe_code)]
pub fn size(fd: impl AsFd) -> Result<(u16, u16)> {
    let mut ws = winsize(0, 0);
    // SAFETY: fd is valid for the duration of the call and ws is a writable
    // winsize owned by this frame.
    let rc = unsafe { libc::ioctl(fd.as_fd().as_raw_fd(), libc::TIOCGWINSZ, &raw mut ws) };
    if rc < 0 {
        return Err(OciboxError::Process {
            message: format!("TIOCGWINSZ failed: {}", std::io::Error::last_os_error()),
        });
    }
    Ok((ws.ws_col, ws.ws_row))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_is_visible_on_both_sides() {
        let pty = open(Some(ConsoleSize {
            height: 24,
            width: 80,
        }))
        .expect("openpty");
        assert_eq!(size(&pty.slave).expect("size"), (80, 24));
        resize(pty.master.as_fd(), 132, 43).expect("resize");
        assert_eq!(size(&pty.slave).expect("size"), (132, 43));
    }
}
