//! Test utilities & fixtures.
//! A scripted serial line backed by a Unix socket pair, an in-memory remote
//! stream, and near-zero modem timings so hangups finish instantly.
#![allow(dead_code)]

use modemgate::modem::{Modem, ModemTimings, SerialLine};
use modemgate::poller;
use modemgate::shutdown::ShutdownFlag;
use modemgate::stream::{DuplexStream, ReadOutcome};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Modem timings that keep every test fast.
pub fn fast_timings() -> ModemTimings {
    ModemTimings {
        command_delay: Duration::ZERO,
        dtr_drop: Duration::ZERO,
        dtr_settle: Duration::ZERO,
        guard: Duration::ZERO,
        escape_wait: Duration::ZERO,
        hangup_timeout: Duration::from_millis(20),
        poll_interval: Duration::from_millis(2),
    }
}

/// Control-line state shared between a [`ScriptedLine`] and its test.
#[derive(Clone, Default)]
pub struct LineSignals {
    pub dtr: Arc<Mutex<Vec<bool>>>,
    pub carrier: Arc<Mutex<Option<bool>>>,
}

impl LineSignals {
    pub fn dtr_changes(&self) -> Vec<bool> {
        self.dtr.lock().unwrap().clone()
    }

    pub fn drop_carrier(&self) {
        *self.carrier.lock().unwrap() = Some(false);
    }
}

/// Modem side of a socket pair; the test drives the other end as the caller.
pub struct ScriptedLine {
    sock: UnixStream,
    signals: LineSignals,
    local: bool,
    fail_writes: bool,
}

impl ScriptedLine {
    pub fn pair() -> (ScriptedLine, Caller, LineSignals) {
        let (modem_end, caller_end) = UnixStream::pair().unwrap();
        modem_end
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        caller_end
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let signals = LineSignals::default();
        *signals.carrier.lock().unwrap() = Some(true);
        (
            ScriptedLine {
                sock: modem_end,
                signals: signals.clone(),
                local: false,
                fail_writes: false,
            },
            Caller {
                sock: caller_end,
                seen: Vec::new(),
            },
            signals,
        )
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Every write to the line fails with `BrokenPipe`; reads still work.
    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }
}

impl Read for ScriptedLine {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.read(buf)
    }
}

impl Write for ScriptedLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.sock.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sock.flush()
    }
}

impl SerialLine for ScriptedLine {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(usize::from(poller::is_readable(self.sock.as_fd())?))
    }

    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.signals.dtr.lock().unwrap().push(level);
        Ok(())
    }

    fn carrier_detect(&mut self) -> Option<bool> {
        *self.signals.carrier.lock().unwrap()
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }
}

/// The caller's end of a [`ScriptedLine`]. Everything read is kept in `seen`.
pub struct Caller {
    sock: UnixStream,
    pub seen: Vec<u8>,
}

impl Caller {
    pub fn send(&mut self, data: &[u8]) {
        self.sock.write_all(data).unwrap();
    }

    /// Read until `needle` has been seen or `timeout` passes.
    pub fn expect(&mut self, needle: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.seen_text().contains(needle) {
                return true;
            }
            self.pump_once();
        }
        self.seen_text().contains(needle)
    }

    /// Read until `needle` has been seen `count` times or `timeout` passes.
    pub fn expect_count(&mut self, needle: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.seen_text().matches(needle).count() >= count {
                return true;
            }
            self.pump_once();
        }
        self.seen_text().matches(needle).count() >= count
    }

    /// Collect whatever arrives within `window`.
    pub fn drain(&mut self, window: Duration) -> String {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            self.pump_once();
        }
        self.seen_text()
    }

    pub fn seen_text(&self) -> String {
        String::from_utf8_lossy(&self.seen).into_owned()
    }

    fn pump_once(&mut self) {
        let mut buf = [0u8; 512];
        match self.sock.read(&mut buf) {
            Ok(n) => self.seen.extend_from_slice(&buf[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) => {}
            Err(e) => panic!("caller read failed: {e}"),
        }
    }
}

pub fn scripted_modem() -> (Modem<ScriptedLine>, Caller, LineSignals) {
    let (line, caller, signals) = ScriptedLine::pair();
    let modem = Modem::new(line, fast_timings(), ShutdownFlag::new());
    (modem, caller, signals)
}

/// In-memory remote stream fed from a queue of chunks.
///
/// An empty queue reads as `WouldBlock` (or `Closed` once `eof` is set). Its
/// poll descriptor is one end of a socket pair that never becomes readable.
pub struct FakeStream {
    pub incoming: VecDeque<Vec<u8>>,
    pub written: Vec<u8>,
    pub eof: bool,
    pub blocking: Vec<bool>,
    pub fail_writes: bool,
    closed: bool,
    idle_fd: UnixStream,
    _idle_peer: UnixStream,
}

impl FakeStream {
    pub fn new() -> Self {
        let (idle_fd, idle_peer) = UnixStream::pair().unwrap();
        Self {
            incoming: VecDeque::new(),
            written: Vec::new(),
            eof: false,
            blocking: Vec::new(),
            fail_writes: false,
            closed: false,
            idle_fd,
            _idle_peer: idle_peer,
        }
    }

    pub fn with_chunks(chunks: &[&[u8]]) -> Self {
        let mut stream = Self::new();
        stream.incoming = chunks.iter().map(|c| c.to_vec()).collect();
        stream
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written).into_owned()
    }
}

impl DuplexStream for FakeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        if self.closed {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        match self.incoming.pop_front() {
            Some(mut chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.incoming.push_front(chunk.split_off(n));
                }
                Ok(ReadOutcome::Data(n))
            }
            None if self.eof => Ok(ReadOutcome::Closed),
            None => Ok(ReadOutcome::WouldBlock),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if self.fail_writes {
            return Err(io::Error::from(io::ErrorKind::ConnectionReset));
        }
        self.written.extend_from_slice(data);
        Ok(())
    }

    fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        self.blocking.push(blocking);
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.idle_fd.as_fd()
    }

    fn has_pending(&self) -> bool {
        !self.closed && (!self.incoming.is_empty() || self.eof)
    }
}
