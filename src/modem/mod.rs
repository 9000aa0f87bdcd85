//! # Modem Control Channel
//!
//! Drives a Hayes-compatible modem over a [`SerialLine`]: sends the AT init
//! sequence, waits for an incoming call's `CONNECT` banner, talks to the caller
//! with plain-text prompts, and forces a hangup with a DTR drop followed by the
//! `+++` / `ATH` escape.
//!
//! Every wait here is a short sleep/poll cycle so the shutdown flag is seen
//! promptly. The channel never closes the line; it only reads, writes and
//! toggles control signals.
//!
//! ```rust,no_run
//! # #[cfg(feature = "serial")]
//! # fn demo() -> modemgate::error::Result<()> {
//! use modemgate::config::Config;
//! use modemgate::modem::{HardwareLine, Modem};
//! use modemgate::shutdown::ShutdownFlag;
//!
//! let config = Config::default();
//! let line = HardwareLine::open(&config.modem.port, config.modem.baud_rate, true)?;
//! let mut modem = Modem::new(line, config.modem.timings(), ShutdownFlag::new());
//! modem.initialize(&config.modem.init_sequence);
//! let banner = modem.wait_for_connect()?;
//! println!("caller connected: {banner}");
//! modem.force_hangup();
//! # Ok(())
//! # }
//! ```

mod line;

#[cfg(feature = "serial")]
pub use line::HardwareLine;
pub use line::{LocalLine, SerialLine};

use crate::error::{GatewayError, Result};
use crate::logutil::escape_bytes;
use crate::poller::deadline_after;
use crate::shutdown::ShutdownFlag;
use log::{debug, error, info, warn};
use std::io;
use std::thread::sleep;
use std::time::{Duration, Instant};

/// Pauses used while talking to the modem. Defaults follow what common
/// Hayes-compatible hardware needs; tests shrink them to zero.
#[derive(Debug, Clone)]
pub struct ModemTimings {
    pub command_delay: Duration,
    pub dtr_drop: Duration,
    pub dtr_settle: Duration,
    pub guard: Duration,
    pub escape_wait: Duration,
    pub hangup_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ModemTimings {
    fn default() -> Self {
        Self {
            command_delay: Duration::from_secs(1),
            dtr_drop: Duration::from_secs(1),
            dtr_settle: Duration::from_millis(500),
            guard: Duration::from_millis(500),
            escape_wait: Duration::from_secs(1),
            hangup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Longest wait for the rest of a CONNECT line once the keyword has arrived.
const BANNER_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemState {
    Uninitialized,
    Initializing,
    WaitingForCall,
    Connected,
}

pub struct Modem<L: SerialLine> {
    line: L,
    timings: ModemTimings,
    shutdown: ShutdownFlag,
    state: ModemState,
    debug: bool,
    hangups: usize,
}

impl<L: SerialLine> Modem<L> {
    pub fn new(line: L, timings: ModemTimings, shutdown: ShutdownFlag) -> Self {
        Self {
            line,
            timings,
            shutdown,
            state: ModemState::Uninitialized,
            debug: false,
            hangups: 0,
        }
    }

    /// Log every byte written to and read from the modem.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn state(&self) -> ModemState {
        self.state
    }

    /// Number of hangup sequences issued over this channel's lifetime.
    pub fn hangup_count(&self) -> usize {
        self.hangups
    }

    pub fn shutdown(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn line(&self) -> &L {
        &self.line
    }

    pub fn line_mut(&mut self) -> &mut L {
        &mut self.line
    }

    pub fn into_line(self) -> L {
        self.line
    }

    /// Send each AT command followed by CR, pausing between commands so the
    /// modem can process them. Write errors are logged, not returned.
    pub fn initialize(&mut self, init_sequence: &[String]) {
        self.state = ModemState::Initializing;
        info!("Initializing modem...");
        for cmd in init_sequence {
            let bytes = format!("{cmd}\r");
            if self.debug {
                debug!("Sending init command: {}", escape_bytes(bytes.as_bytes()));
            }
            if let Err(e) = self.write_flush(bytes.as_bytes()) {
                error!("Failed to send init command {}: {}", cmd, e);
            }
            sleep(self.timings.command_delay);
        }
        self.state = ModemState::WaitingForCall;
    }

    /// Block (cooperatively) until the modem reports `CONNECT`, returning the
    /// banner line in its original case. Input buffered after the banner is
    /// drained so it does not reach the menu.
    pub fn wait_for_connect(&mut self) -> Result<String> {
        self.state = ModemState::WaitingForCall;
        info!("Waiting for incoming call...");
        let mut raw = String::new();
        loop {
            if self.shutdown.is_triggered() {
                return Err(GatewayError::Cancelled);
            }
            let waiting = self.line.bytes_to_read()?;
            if waiting == 0 {
                sleep(self.timings.poll_interval);
                continue;
            }
            let mut buf = vec![0u8; waiting];
            let n = read_some(&mut self.line, &mut buf)?;
            if n == 0 {
                sleep(self.timings.poll_interval);
                continue;
            }
            if self.debug {
                debug!("Read bytes during connect wait: {}", escape_bytes(&buf[..n]));
            }
            let text = String::from_utf8_lossy(&buf[..n]);
            info!("Modem says: {}", text.trim());
            raw.push_str(&text);
            if let Some(start) = raw.to_ascii_uppercase().find("CONNECT") {
                self.finish_banner(&mut raw, start);
                let banner = connect_line(&raw);
                info!("CONNECT detected: {}", banner);
                self.flush_input();
                self.state = ModemState::Connected;
                return Ok(banner);
            }
        }
    }

    /// Keep reading until the CONNECT line is terminated, so the speed and
    /// protocol suffix are not cut off.
    fn finish_banner(&mut self, raw: &mut String, start: usize) {
        let deadline = deadline_after(BANNER_SETTLE);
        while !raw[start..].contains(['\r', '\n']) && Instant::now() < deadline {
            match self.line.bytes_to_read() {
                Ok(0) => sleep(self.timings.poll_interval),
                Ok(waiting) => {
                    let mut buf = vec![0u8; waiting];
                    match read_some(&mut self.line, &mut buf) {
                        Ok(n) => raw.push_str(&String::from_utf8_lossy(&buf[..n])),
                        Err(_) => break,
                    }
                }
                Err(_) => break,
            }
        }
    }

    /// Drop DTR, escape to command mode and send `ATH`, then wait a bounded
    /// time for `OK` or `NO CARRIER`. Never fails; safe to call repeatedly.
    pub fn force_hangup(&mut self) {
        self.hangups += 1;
        info!("Forcing hangup: DTR drop + escape + ATH");
        if let Err(e) = self.hangup_sequence() {
            error!("Hangup sequence failed: {}", e);
        }
        if self.state != ModemState::Uninitialized {
            self.state = ModemState::WaitingForCall;
        }
    }

    fn hangup_sequence(&mut self) -> io::Result<()> {
        if self.line.is_local() {
            debug!("Local line, no modem to hang up");
            return Ok(());
        }
        self.line.set_dtr(false)?;
        sleep(self.timings.dtr_drop);
        self.line.set_dtr(true)?;
        sleep(self.timings.dtr_settle);

        sleep(self.timings.guard);
        self.write_flush(b"+++")?;
        sleep(self.timings.escape_wait);
        self.write_flush(b"ATH\r")?;

        let deadline = deadline_after(self.timings.hangup_timeout);
        let mut response = String::new();
        while Instant::now() < deadline {
            let waiting = self.line.bytes_to_read()?;
            if waiting > 0 {
                let mut buf = vec![0u8; waiting];
                let n = read_some(&mut self.line, &mut buf)?;
                response.push_str(&String::from_utf8_lossy(&buf[..n]));
                let upper = response.to_ascii_uppercase();
                if upper.contains("OK") || upper.contains("NO CARRIER") {
                    info!("Hangup response: {:?}", response.trim());
                    return Ok(());
                }
            } else {
                sleep(self.timings.poll_interval);
            }
        }
        warn!("Hangup timeout, last response: {:?}", response.trim());
        Ok(())
    }

    /// Discard any input already buffered on the line without blocking.
    pub fn flush_input(&mut self) {
        if self.debug {
            debug!("Flushing modem input buffer");
        }
        if let Err(e) = self.line.clear_input() {
            warn!("Failed to clear modem input buffer: {}", e);
        }
        let mut scratch = [0u8; 256];
        loop {
            match self.line.bytes_to_read() {
                Ok(0) | Err(_) => break,
                Ok(_) => match read_some(&mut self.line, &mut scratch) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if self.debug {
                            debug!("Drained {} bytes from modem input", n);
                        }
                    }
                },
            }
        }
    }

    /// Write raw bytes to the caller and flush.
    pub fn write_flush(&mut self, data: &[u8]) -> io::Result<()> {
        if self.debug {
            debug!("Writing to modem: {}", escape_bytes(data));
        }
        self.line.write_all(data)?;
        self.line.flush()
    }

    /// Write caller-visible text followed by CRLF.
    pub fn print_line(&mut self, text: &str) -> io::Result<()> {
        let mut out = text.to_string();
        if !out.ends_with("\r\n") {
            out.push_str("\r\n");
        }
        self.write_flush(out.as_bytes())
    }

    /// Print `prompt` (no newline) and read one line typed by the caller.
    ///
    /// Typed characters are echoed, or replaced by `mask` when given. Leading
    /// CR/LF are ignored unless `allow_empty`, in which case a bare Enter
    /// returns an empty string.
    pub fn input_line(
        &mut self,
        prompt: &str,
        mask: Option<char>,
        allow_empty: bool,
    ) -> Result<String> {
        if !prompt.is_empty() {
            self.write_flush(prompt.as_bytes())?;
        }
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let b = self.read_byte()?;
            match b {
                b'\r' | b'\n' => {
                    if buf.is_empty() && !allow_empty {
                        continue;
                    }
                    self.write_flush(b"\r\n")?;
                    break;
                }
                0x08 | 0x7F => {
                    if buf.pop().is_some() {
                        self.write_flush(b"\x08 \x08")?;
                    }
                }
                b if b < 0x20 => {}
                b => {
                    buf.push(b);
                    let echo = match mask {
                        Some(m) => m.to_string(),
                        None => (b as char).to_string(),
                    };
                    self.write_flush(echo.as_bytes())?;
                }
            }
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Print `prompt` (no newline) and return the next keystroke.
    pub fn getch(&mut self, prompt: &str) -> Result<u8> {
        if !prompt.is_empty() {
            self.write_flush(prompt.as_bytes())?;
        }
        self.read_byte()
    }

    fn read_byte(&mut self) -> Result<u8> {
        loop {
            if self.shutdown.is_triggered() {
                return Err(GatewayError::Cancelled);
            }
            if self.line.bytes_to_read()? > 0 {
                let mut one = [0u8; 1];
                if read_some(&mut self.line, &mut one)? == 1 {
                    if self.debug {
                        debug!("Read byte: {}", escape_bytes(&one));
                    }
                    return Ok(one[0]);
                }
            }
            sleep(self.timings.poll_interval);
        }
    }
}

/// Read whatever is available; a would-block or timed-out read counts as zero bytes.
fn read_some<L: SerialLine>(line: &mut L, buf: &mut [u8]) -> io::Result<usize> {
    match line.read(buf) {
        Ok(n) => Ok(n),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            Ok(0)
        }
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
        Err(e) => Err(e),
    }
}

/// First line of `raw` containing CONNECT (case-insensitive), trimmed.
fn connect_line(raw: &str) -> String {
    raw.split(['\r', '\n'])
        .find(|line| line.to_ascii_uppercase().contains("CONNECT"))
        .map(|line| line.trim().to_string())
        .unwrap_or_default()
}

/// Extract the negotiated speed from a CONNECT banner (`CONNECT 2400/ARQ` -> `2400`).
pub fn parse_baud_rate(banner: &str) -> Option<String> {
    let upper = banner.to_ascii_uppercase();
    let start = upper.find("CONNECT")? + "CONNECT".len();
    let digits: String = banner[start..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_line_keeps_original_case() {
        let raw = "\r\nRING\r\nconnect 9600/ARQ/V42\r\n";
        assert_eq!(connect_line(raw), "connect 9600/ARQ/V42");
    }

    #[test]
    fn baud_rate_from_banner() {
        assert_eq!(parse_baud_rate("CONNECT 2400/ARQ").as_deref(), Some("2400"));
        assert_eq!(parse_baud_rate("connect 33600").as_deref(), Some("33600"));
        assert_eq!(parse_baud_rate("CONNECT"), None);
        assert_eq!(parse_baud_rate("NO CARRIER"), None);
    }

    #[test]
    fn default_timings_follow_hayes_guard_times() {
        let t = ModemTimings::default();
        assert_eq!(t.dtr_drop, Duration::from_secs(1));
        assert_eq!(t.guard, Duration::from_millis(500));
        assert_eq!(t.hangup_timeout, Duration::from_secs(5));
    }
}
