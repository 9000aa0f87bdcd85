//! # Remote Streams
//!
//! A connected BBS is reached through one of three transports. All of them are
//! driven through the [`DuplexStream`] trait so the auto-login engine and the
//! bridge pump never care which one they hold:
//!
//! - [`SocketStream`] - a plain TCP socket (telnet, and rlogin after its handshake)
//! - [`SshStream`] - an interactive shell channel on an SSH-2 session
//!
//! [`RemoteStream`] is the closed set of variants a connector can hand back.
//!
//! Reads report expected conditions as values rather than errors:
//! [`ReadOutcome::WouldBlock`] when nothing is available yet and
//! [`ReadOutcome::Closed`] when the far end hung up. `Err` is reserved for real
//! transport failures.

mod socket;
mod ssh;

pub use socket::SocketStream;
pub use ssh::SshStream;

use crate::poller::deadline_after;
use std::io::{self, Write};
use std::os::fd::BorrowedFd;
use std::thread::sleep;
use std::time::{Duration, Instant};

/// How long a read in blocking mode waits before reporting `WouldBlock`, so
/// deadline-driven callers get a chance to look at the clock.
pub const BLOCKING_READ_SLICE: Duration = Duration::from_millis(250);

/// Longest a single write may stall on a full socket buffer.
const WRITE_STALL_LIMIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were placed at the front of the buffer.
    Data(usize),
    /// Nothing to read right now.
    WouldBlock,
    /// The remote end closed the connection.
    Closed,
}

/// A connected, pollable duplex byte channel to a remote host.
pub trait DuplexStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    /// Write the whole payload, retrying while the transport is momentarily full.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Blocking reads wait at most [`BLOCKING_READ_SLICE`]; non-blocking reads
    /// return immediately.
    fn set_blocking(&mut self, blocking: bool) -> io::Result<()>;

    /// Release the connection. Reads and writes afterwards fail with `NotConnected`.
    fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// Descriptor to wait on for incoming data.
    fn poll_fd(&self) -> BorrowedFd<'_>;

    /// True when data may already be buffered above the descriptor, so a
    /// readiness wait could miss it.
    fn has_pending(&self) -> bool {
        false
    }
}

/// The stream a protocol connector produces.
pub enum RemoteStream {
    Telnet(SocketStream),
    Ssh(SshStream),
    Rlogin(SocketStream),
}

impl RemoteStream {
    pub fn protocol_name(&self) -> &'static str {
        match self {
            RemoteStream::Telnet(_) => "telnet",
            RemoteStream::Ssh(_) => "ssh",
            RemoteStream::Rlogin(_) => "rlogin",
        }
    }

    fn inner(&self) -> &dyn DuplexStream {
        match self {
            RemoteStream::Telnet(s) | RemoteStream::Rlogin(s) => s,
            RemoteStream::Ssh(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn DuplexStream {
        match self {
            RemoteStream::Telnet(s) | RemoteStream::Rlogin(s) => s,
            RemoteStream::Ssh(s) => s,
        }
    }
}

impl DuplexStream for RemoteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        self.inner_mut().read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner_mut().write_all(data)
    }

    fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        self.inner_mut().set_blocking(blocking)
    }

    fn close(&mut self) {
        self.inner_mut().close()
    }

    fn is_closed(&self) -> bool {
        self.inner().is_closed()
    }

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.inner().poll_fd()
    }

    fn has_pending(&self) -> bool {
        self.inner().has_pending()
    }
}

/// Map a raw read result onto [`ReadOutcome`].
pub(crate) fn classify_read(result: io::Result<usize>) -> io::Result<ReadOutcome> {
    match result {
        Ok(0) => Ok(ReadOutcome::Closed),
        Ok(n) => Ok(ReadOutcome::Data(n)),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(ReadOutcome::WouldBlock)
        }
        Err(e) => Err(e),
    }
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream already closed")
}

/// `write_all` that tolerates a non-blocking or timed-out writer by retrying
/// until the payload is out or the stall limit passes.
///
/// Never flushes: on an SSH channel `flush` discards inbound data libssh2 has
/// queued but nobody has read yet. Sockets and channels send on `write`.
pub(crate) fn write_fully<W: Write + ?Sized>(writer: &mut W, mut data: &[u8]) -> io::Result<()> {
    let deadline = deadline_after(WRITE_STALL_LIMIT);
    while !data.is_empty() {
        match writer.write(data) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "write stalled"));
                }
                sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
