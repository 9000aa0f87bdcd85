//! Auto-login macro execution against a freshly connected stream.
//!
//! The script runs with the stream in blocking mode and hands it back in
//! non-blocking mode. A failed script is reported as `false`; it never closes
//! the stream and never ends the session on its own.

use crate::config::LoginStep;
use crate::logutil::{escape_bytes, escape_log};
use crate::poller::deadline_after;
use crate::shutdown::ShutdownFlag;
use crate::stream::{DuplexStream, ReadOutcome};
use log::{debug, info, warn};
use std::io;
use std::thread::sleep;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Back-off when a read comes back empty before the deadline.
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("timed out waiting for {0:?}")]
    Timeout(String),
    #[error("connection closed during auto-login")]
    Closed,
    #[error("transfer failed: {0}")]
    Io(#[from] io::Error),
    #[error("cancelled")]
    Cancelled,
}

pub struct AutoLoginEngine {
    default_timeout: Duration,
    shutdown: ShutdownFlag,
}

impl AutoLoginEngine {
    pub fn new(default_timeout: Duration, shutdown: ShutdownFlag) -> Self {
        Self {
            default_timeout,
            shutdown,
        }
    }

    /// Run `steps` in order. Returns `true` when every step completed.
    pub fn run(&self, stream: &mut dyn DuplexStream, steps: &[LoginStep]) -> bool {
        info!("Executing auto-login sequence with {} steps", steps.len());
        if let Err(e) = stream.set_blocking(true) {
            warn!("Could not switch stream to blocking mode: {}", e);
        }
        let result = self.run_steps(stream, steps);
        if let Err(e) = stream.set_blocking(false) {
            warn!("Could not restore non-blocking mode: {}", e);
        }
        match result {
            Ok(()) => {
                info!("Auto-login sequence completed successfully");
                true
            }
            Err(e) => {
                warn!("Auto-login aborted: {}", e);
                false
            }
        }
    }

    fn run_steps(&self, stream: &mut dyn DuplexStream, steps: &[LoginStep]) -> Result<(), LoginError> {
        let mut received = String::new();
        for (i, step) in steps.iter().enumerate() {
            debug!("Auto-login step {}: {}", i + 1, step.action());
            match step {
                LoginStep::Wait { text, timeout } => {
                    let limit = timeout.unwrap_or(self.default_timeout);
                    self.wait_for(stream, &mut received, text, limit)?;
                    debug!("Found target string: {:?}", text);
                    received.clear();
                }
                LoginStep::Send(text) => {
                    let payload = format!("{text}\r");
                    debug!("Sending: {}", escape_log(&payload));
                    stream.write_all(payload.as_bytes())?;
                }
                LoginStep::SendRaw(bytes) => {
                    debug!("Sending raw: {}", escape_bytes(bytes));
                    stream.write_all(bytes)?;
                }
                LoginStep::Delay(delay) => {
                    debug!("Delaying {}ms", delay.as_millis());
                    sleep(*delay);
                }
                LoginStep::Unknown(action) => {
                    warn!("Unknown auto-login action: {}", action);
                }
            }
        }
        Ok(())
    }

    /// `received` holds lowercased text; each read only rescans the tail that
    /// could complete a match.
    fn wait_for(
        &self,
        stream: &mut dyn DuplexStream,
        received: &mut String,
        text: &str,
        limit: Duration,
    ) -> Result<(), LoginError> {
        let deadline = deadline_after(limit);
        let target = text.to_lowercase();
        let mut buf = [0u8; 1024];
        let mut chunk = String::new();
        let mut scan_from = 0;
        while !received[scan_from..].contains(&target) {
            if self.shutdown.is_triggered() {
                return Err(LoginError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LoginError::Timeout(text.to_string()));
            }
            match stream.read(&mut buf)? {
                ReadOutcome::Data(n) => {
                    debug!("Received: {}", escape_bytes(&buf[..n]));
                    scan_from = tail_start(received, target.len());
                    chunk.clear();
                    decode_dropping_invalid(&buf[..n], &mut chunk);
                    received.push_str(&chunk.to_lowercase());
                }
                ReadOutcome::WouldBlock => sleep(IDLE_BACKOFF.min(deadline - now)),
                ReadOutcome::Closed => return Err(LoginError::Closed),
            }
        }
        Ok(())
    }
}

/// Char boundary at or before the last `len` bytes of `text`.
fn tail_start(text: &str, len: usize) -> usize {
    let mut start = text.len().saturating_sub(len);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    start
}

/// Run a script with the default shutdown flag (never triggered).
pub fn execute(stream: &mut dyn DuplexStream, steps: &[LoginStep], timeout: Duration) -> bool {
    AutoLoginEngine::new(timeout, ShutdownFlag::new()).run(stream, steps)
}

/// Append the valid UTF-8 in `bytes` to `out`, dropping undecodable sequences.
fn decode_dropping_invalid(mut bytes: &[u8], out: &mut String) {
    loop {
        match std::str::from_utf8(bytes) {
            Ok(s) => {
                out.push_str(s);
                return;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(std::str::from_utf8(&bytes[..valid]).unwrap_or_default());
                let skip = e.error_len().unwrap_or(bytes.len() - valid);
                bytes = &bytes[valid + skip..];
            }
        }
    }
}
