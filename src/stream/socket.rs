use super::{classify_read, closed_error, write_fully, DuplexStream, ReadOutcome, BLOCKING_READ_SLICE};
use log::debug;
use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};

/// A raw TCP connection carried byte-for-byte (telnet, rlogin).
#[derive(Debug)]
pub struct SocketStream {
    sock: TcpStream,
    closed: bool,
}

impl SocketStream {
    pub fn new(sock: TcpStream) -> Self {
        Self {
            sock,
            closed: false,
        }
    }

    pub fn socket(&self) -> &TcpStream {
        &self.sock
    }
}

impl DuplexStream for SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        if self.closed {
            return Err(closed_error());
        }
        classify_read(self.sock.read(buf))
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(closed_error());
        }
        write_fully(&mut self.sock, data)
    }

    fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        self.sock.set_nonblocking(!blocking)?;
        if blocking {
            self.sock.set_read_timeout(Some(BLOCKING_READ_SLICE))
        } else {
            self.sock.set_read_timeout(None)
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.sock.shutdown(Shutdown::Both) {
            debug!("Socket shutdown: {}", e);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    fn pair() -> (SocketStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (SocketStream::new(client), server)
    }

    #[test]
    fn nonblocking_read_without_data_would_block() {
        let (mut stream, _server) = pair();
        stream.set_blocking(false).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).unwrap(), ReadOutcome::WouldBlock);
    }

    #[test]
    fn blocking_read_gives_up_after_slice() {
        let (mut stream, _server) = pair();
        stream.set_blocking(true).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).unwrap(), ReadOutcome::WouldBlock);
    }

    #[test]
    fn peer_close_reads_as_closed() {
        let (mut stream, mut server) = pair();
        server.write_all(b"bye").unwrap();
        drop(server);
        stream.set_blocking(true).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).unwrap(), ReadOutcome::Data(3));
        assert_eq!(stream.read(&mut buf).unwrap(), ReadOutcome::Closed);
    }

    #[test]
    fn io_after_close_is_refused() {
        let (mut stream, _server) = pair();
        stream.close();
        stream.close();
        assert!(stream.is_closed());
        assert!(stream.write_all(b"x").is_err());
        let mut buf = [0u8; 4];
        assert!(stream.read(&mut buf).is_err());
    }
}
