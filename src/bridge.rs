//! # Bridge Session
//!
//! One caller, one remote host. [`run_session`] connects to the selected BBS,
//! runs its auto-login script, then pumps bytes in both directions until the
//! far end closes, the caller drops carrier, the line goes idle, a transfer
//! fails, or the process is asked to stop.
//!
//! However the pump ends, the session's [`Finalizer`] closes the remote stream
//! and forces a modem hangup exactly once, including when the pump unwinds
//! from a panic.
//!
//! ## Directions
//!
//! Bytes are forwarded in arrival order within each direction. The two
//! directions are independent; the loop services whichever side is ready.

use crate::autologin::AutoLoginEngine;
use crate::config::{BbsEntry, Config, LoginStep};
use crate::connector::{self, ConnectOptions};
use crate::logutil::escape_bytes;
use crate::modem::{Modem, SerialLine};
use crate::poller;
use crate::stream::{DuplexStream, ReadOutcome};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt;
use std::io::{self, Read};
use std::time::{Duration, Instant};

/// How a bridge session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The caller's side of the line closed.
    UserHangup,
    /// The remote host closed the connection.
    BbsClosed,
    /// No traffic for the configured idle window.
    Timeout,
    /// Carrier detect dropped.
    CarrierLost,
    /// A read or write failed on either endpoint.
    Error,
    /// No stream could be established.
    ConnectionFailed,
    /// The process is shutting down.
    Cancelled,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::UserHangup => "user_hangup",
            SessionOutcome::BbsClosed => "bbs_closed",
            SessionOutcome::Timeout => "timeout",
            SessionOutcome::CarrierLost => "carrier_lost",
            SessionOutcome::Error => "error",
            SessionOutcome::ConnectionFailed => "connection_failed",
            SessionOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session tunables, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub connect: ConnectOptions,
    pub autologin_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    /// Upper bound on one readiness wait; also how often the idle timeout is checked.
    pub select_timeout: Duration,
    pub modem_read_chunk: usize,
    pub bbs_read_chunk: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl BridgeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: ConnectOptions {
                timeout: Duration::from_secs(config.bridge.connect_timeout_secs),
                ssh_anonymous_user: config.ssh.anonymous_user.clone(),
            },
            autologin_timeout: Duration::from_secs(config.bridge.autologin_timeout_secs),
            idle_timeout: config.bridge.idle_timeout(),
            select_timeout: Duration::from_secs(1),
            modem_read_chunk: config.bridge.modem_read_chunk.max(1),
            bbs_read_chunk: config.bridge.bbs_read_chunk.max(1),
        }
    }
}

/// Connect to `entry` and bridge the caller to it until the session ends.
pub fn run_session<L: SerialLine>(
    modem: &mut Modem<L>,
    entry: &BbsEntry,
    settings: &BridgeSettings,
) -> SessionOutcome {
    info!(
        "Connecting to {} at {} via {}...",
        entry.name,
        entry.address(),
        entry.protocol
    );
    let stream = match connector::connect(entry, modem, &settings.connect) {
        Some(stream) => stream,
        None => {
            error!("Could not connect to {}", entry.name);
            if let Err(e) = modem.print_line("Connection failed.") {
                warn!("Could not notify caller: {}", e);
            }
            return SessionOutcome::ConnectionFailed;
        }
    };
    info!("Connected to {} via {}", entry.name, stream.protocol_name());
    bridge_stream(modem, stream, entry.auto_login.as_deref(), settings)
}

/// Bridge an already-connected stream. Takes ownership of the stream; it is
/// closed and the modem hung up before this returns.
pub fn bridge_stream<L: SerialLine, S: DuplexStream>(
    modem: &mut Modem<L>,
    stream: S,
    script: Option<&[LoginStep]>,
    settings: &BridgeSettings,
) -> SessionOutcome {
    let mut session = Finalizer::new(modem, stream);

    match script {
        Some(steps) if !steps.is_empty() => {
            info!("Running auto-login sequence...");
            let engine =
                AutoLoginEngine::new(settings.autologin_timeout, session.modem.shutdown().clone());
            if !engine.run(&mut session.stream, steps) {
                warn!("Auto-login did not complete successfully");
                if let Err(e) = session
                    .modem
                    .print_line("Auto-login failed, continuing anyway...")
                {
                    warn!("Could not notify caller: {}", e);
                }
            }
        }
        _ => debug!("No auto-login configured, skipping"),
    }

    match settings.idle_timeout {
        Some(idle) => info!(
            "Connection established. Entering bridge loop... (idle timeout: {}s)",
            idle.as_secs()
        ),
        None => info!("Connection established. Entering bridge loop... (no idle timeout)"),
    }
    let outcome = pump(&mut *session.modem, &mut session.stream, settings);
    info!("Bridge loop ended: {}", outcome);
    outcome
}

/// Closes the stream and hangs up the modem when dropped.
struct Finalizer<'m, L: SerialLine, S: DuplexStream> {
    modem: &'m mut Modem<L>,
    stream: S,
}

impl<'m, L: SerialLine, S: DuplexStream> Finalizer<'m, L, S> {
    fn new(modem: &'m mut Modem<L>, stream: S) -> Self {
        Self { modem, stream }
    }
}

impl<L: SerialLine, S: DuplexStream> Drop for Finalizer<'_, L, S> {
    fn drop(&mut self) {
        self.stream.close();
        info!("Bridge loop exited, forcing hangup.");
        self.modem.force_hangup();
    }
}

fn pump<L: SerialLine, S: DuplexStream>(
    modem: &mut Modem<L>,
    stream: &mut S,
    settings: &BridgeSettings,
) -> SessionOutcome {
    if let Err(e) = stream.set_blocking(false) {
        error!("Could not switch stream to non-blocking mode: {}", e);
        return SessionOutcome::Error;
    }
    let debug_io = modem.is_debug();
    let mut from_modem = vec![0u8; settings.modem_read_chunk];
    let mut from_bbs = vec![0u8; settings.bbs_read_chunk];
    let mut last_activity = Instant::now();

    loop {
        if modem.shutdown().is_triggered() {
            info!("Shutdown requested, ending session");
            return SessionOutcome::Cancelled;
        }

        let wait = if stream.has_pending() {
            Duration::ZERO
        } else {
            settings.select_timeout
        };
        let ready = match poller::wait_readable(&[modem.line().poll_fd(), stream.poll_fd()], wait) {
            Ok(ready) => ready,
            Err(e) => {
                error!("Readiness wait failed: {}", e);
                return SessionOutcome::Error;
            }
        };
        let modem_ready = ready[0];
        let bbs_ready = ready[1] || stream.has_pending();

        if !modem.line().is_local() && modem.line_mut().carrier_detect() == Some(false) {
            info!("Carrier lost (caller disconnected). Ending session.");
            return SessionOutcome::CarrierLost;
        }

        if !modem_ready && !bbs_ready {
            if let Some(idle) = settings.idle_timeout {
                if last_activity.elapsed() > idle {
                    warn!(
                        "Session timed out after {}s of inactivity",
                        idle.as_secs_f32()
                    );
                    if let Err(e) = modem.print_line("\r\nSession timed out due to inactivity.") {
                        warn!("Could not notify caller: {}", e);
                    }
                    return SessionOutcome::Timeout;
                }
            }
            continue;
        }

        if modem_ready {
            let available = match modem.line_mut().bytes_to_read() {
                Ok(n) => n,
                Err(e) => {
                    error!("Error polling modem: {}", e);
                    return SessionOutcome::Error;
                }
            };
            let want = if available > 0 {
                available
            } else {
                settings.modem_read_chunk
            };
            if from_modem.len() < want {
                from_modem.resize(want, 0);
            }
            match modem.line_mut().read(&mut from_modem[..want]) {
                Ok(0) => {
                    info!("Caller line closed. Ending session.");
                    return SessionOutcome::UserHangup;
                }
                Ok(n) => {
                    last_activity = Instant::now();
                    if debug_io {
                        debug!(
                            "Modem->BBS: {} bytes: {}",
                            n,
                            escape_bytes(&from_modem[..n])
                        );
                    }
                    if let Err(e) = stream.write_all(&from_modem[..n]) {
                        error!("Send to BBS failed: {}", e);
                        return SessionOutcome::Error;
                    }
                }
                Err(e) if is_transient(&e) => {}
                Err(e) => {
                    error!("Error reading modem: {}", e);
                    return SessionOutcome::Error;
                }
            }
        }

        if bbs_ready {
            match stream.read(&mut from_bbs) {
                Ok(ReadOutcome::Data(n)) => {
                    last_activity = Instant::now();
                    if debug_io {
                        debug!("BBS->Modem: {} bytes: {}", n, escape_bytes(&from_bbs[..n]));
                    }
                    if let Err(e) = modem.write_flush(&from_bbs[..n]) {
                        error!("Write to modem failed: {}", e);
                        return SessionOutcome::Error;
                    }
                }
                Ok(ReadOutcome::WouldBlock) => {}
                Ok(ReadOutcome::Closed) => {
                    info!("BBS closed connection. Ending session.");
                    return SessionOutcome::BbsClosed;
                }
                Err(e) => {
                    error!("Error reading BBS: {}", e);
                    return SessionOutcome::Error;
                }
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
