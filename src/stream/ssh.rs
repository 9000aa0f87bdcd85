use super::{classify_read, closed_error, write_fully, DuplexStream, ReadOutcome, BLOCKING_READ_SLICE};
use log::debug;
use ssh2::{Channel, Session};
use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};

/// An interactive shell channel on an authenticated SSH session.
///
/// Readiness is taken from the session's TCP socket. libssh2 may decrypt more
/// than one read's worth of data at a time, so a read that fills the caller's
/// buffer marks the stream as possibly holding more ([`DuplexStream::has_pending`]).
pub struct SshStream {
    session: Session,
    channel: Channel,
    tcp: TcpStream,
    pending: bool,
    closed: bool,
}

impl SshStream {
    pub fn new(session: Session, channel: Channel, tcp: TcpStream) -> Self {
        Self {
            session,
            channel,
            tcp,
            pending: false,
            closed: false,
        }
    }
}

impl DuplexStream for SshStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        if self.closed {
            return Err(closed_error());
        }
        let outcome = classify_read(self.channel.read(buf));
        self.pending = matches!(outcome, Ok(ReadOutcome::Data(n)) if n == buf.len());
        outcome
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(closed_error());
        }
        // No Channel::flush here: it drops inbound data not yet read.
        write_fully(&mut self.channel, data)
    }

    fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        self.session.set_blocking(blocking);
        if blocking {
            self.session
                .set_timeout(BLOCKING_READ_SLICE.as_millis() as u32);
        } else {
            self.session.set_timeout(0);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending = false;
        // Give the close handshake a bounded chance in blocking mode.
        self.session.set_blocking(true);
        self.session.set_timeout(1000);
        if let Err(e) = self.channel.close() {
            debug!("SSH channel close: {}", e);
        }
        if let Err(e) = self.session.disconnect(None, "session ended", None) {
            debug!("SSH disconnect: {}", e);
        }
        let _ = self.tcp.shutdown(Shutdown::Both);
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.tcp.as_fd()
    }

    fn has_pending(&self) -> bool {
        self.pending
    }
}
