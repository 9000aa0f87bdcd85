//! # Gateway Call Loop
//!
//! Answers calls and hands each caller a numbered directory of the configured
//! BBS entries. Picking an entry runs one bridge session; when the session ends
//! the call ends too, unless the connection never came up (back to the menu)
//! or the gateway is running on the local terminal (always back to the menu).
//!
//! Every session is summarised in a [`SessionReport`] that is logged and kept
//! for the lifetime of the gateway.

use crate::bridge::{self, BridgeSettings, SessionOutcome};
use crate::config::{BbsEntry, Config, Protocol};
use crate::error::{GatewayError, Result};
use crate::modem::{parse_baud_rate, Modem, SerialLine};
use crate::poller::deadline_after;
use crate::shutdown::ShutdownFlag;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::fmt;
use std::thread::sleep;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Pause before reopening the serial device after an error.
pub const SERIAL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Summary of one bridge session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub id: Uuid,
    pub bbs: String,
    pub protocol: Protocol,
    pub started: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: SessionOutcome,
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session {} to {} via {} started {} lasted {:.1}s: {}",
            self.id,
            self.bbs,
            self.protocol,
            self.started.format("%Y-%m-%dT%H:%M:%SZ"),
            self.duration_ms as f64 / 1000.0,
            self.outcome
        )
    }
}

pub struct Gateway {
    config: Config,
    settings: BridgeSettings,
    shutdown: ShutdownFlag,
    reports: Vec<SessionReport>,
}

impl Gateway {
    pub fn new(config: Config, shutdown: ShutdownFlag) -> Self {
        let settings = BridgeSettings::from_config(&config);
        Self {
            config,
            settings,
            shutdown,
            reports: Vec::new(),
        }
    }

    /// Replace the bridge settings derived from the config.
    pub fn with_settings(mut self, settings: BridgeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn reports(&self) -> &[SessionReport] {
        &self.reports
    }

    /// Wrap `line` in a modem channel using the configured timings.
    pub fn modem_for<L: SerialLine>(&self, line: L) -> Modem<L> {
        Modem::new(line, self.config.modem.timings(), self.shutdown.clone())
            .with_debug(self.config.modem.debug)
    }

    /// Answer calls until shutdown. `open` is called to (re)open the serial
    /// device; errors from it or from the modem are logged and retried after
    /// [`SERIAL_RETRY_DELAY`].
    pub fn run_modem<L, F>(&mut self, mut open: F) -> Result<()>
    where
        L: SerialLine,
        F: FnMut() -> Result<L>,
    {
        info!(
            "Gateway ready with {} BBS entries",
            self.config.bbs_entries.len()
        );
        while !self.shutdown.is_triggered() {
            let line = match open() {
                Ok(line) => line,
                Err(e) => {
                    error!("Serial error: {}", e);
                    self.pause(SERIAL_RETRY_DELAY);
                    continue;
                }
            };
            let mut modem = self.modem_for(line);
            match self.answer_call(&mut modem) {
                Ok(()) => info!("Call ended"),
                Err(GatewayError::Cancelled) => break,
                Err(e) => {
                    error!("Serial error: {}", e);
                    self.pause(SERIAL_RETRY_DELAY);
                }
            }
        }
        info!("Gateway shutting down");
        Ok(())
    }

    /// Reset the modem, wait for one call and serve it.
    pub fn answer_call<L: SerialLine>(&mut self, modem: &mut Modem<L>) -> Result<()> {
        modem.force_hangup();
        modem.initialize(&self.config.modem.init_sequence);
        modem.flush_input();

        let banner = modem.wait_for_connect()?;
        match parse_baud_rate(&banner) {
            Some(baud) => info!("Caller connected at {} bps", baud),
            None => info!("Caller connected ({})", banner),
        }

        let hangups = modem.hangup_count();
        let result = self.serve_caller(modem);
        // Sessions hang up on their own; a call that never dialled still needs one.
        if modem.hangup_count() == hangups {
            modem.force_hangup();
        }
        result
    }

    /// Serve the local terminal as if it were a caller, until they hang up.
    pub fn run_local<L: SerialLine>(&mut self, line: L) -> Result<()> {
        info!("Starting in local mode (no modem)");
        let mut modem = self.modem_for(line);
        match self.serve_caller(&mut modem) {
            Ok(()) | Err(GatewayError::Cancelled) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Menu loop for one connected caller.
    pub fn serve_caller<L: SerialLine>(&mut self, modem: &mut Modem<L>) -> Result<()> {
        let local = modem.line().is_local();
        loop {
            self.show_menu(modem)?;
            let entry = match self.select_entry(modem)? {
                Some(entry) => entry,
                None => {
                    modem.print_line("Goodbye!")?;
                    return Ok(());
                }
            };
            match self.dial(modem, &entry) {
                SessionOutcome::ConnectionFailed => continue,
                SessionOutcome::Cancelled => return Err(GatewayError::Cancelled),
                _ if local => continue,
                _ => return Ok(()),
            }
        }
    }

    fn show_menu<L: SerialLine>(&self, modem: &mut Modem<L>) -> Result<()> {
        modem.print_line("")?;
        modem.print_line(&self.config.gateway.welcome_message)?;
        modem.print_line("")?;
        modem.print_line("=== BBS Directory ===")?;
        modem.print_line("")?;
        for (i, entry) in self.config.bbs_entries.iter().enumerate() {
            modem.print_line(&format!("{}. {}", i + 1, entry.name))?;
            if !entry.description.is_empty() {
                modem.print_line(&format!("   {}", entry.description))?;
            }
        }
        modem.print_line("")?;
        modem.print_line("0. Hang up")?;
        modem.print_line("")?;
        Ok(())
    }

    /// One keystroke per choice; `None` means hang up.
    fn select_entry<L: SerialLine>(&self, modem: &mut Modem<L>) -> Result<Option<BbsEntry>> {
        let max = self.config.bbs_entries.len();
        loop {
            let key = modem.getch(&format!("Enter choice (1-{}, 0 to hang up): ", max))?;
            modem.print_line("")?;
            if !key.is_ascii_digit() {
                modem.print_line("Invalid input. Try again.")?;
                continue;
            }
            let choice = usize::from(key - b'0');
            if choice == 0 {
                info!("User chose to hang up");
                return Ok(None);
            }
            if let Some(entry) = self.config.bbs_entries.get(choice - 1) {
                info!("User selected BBS: {}", entry.name);
                modem.print_line(&format!("Connecting to {}...", entry.name))?;
                return Ok(Some(entry.clone()));
            }
            modem.print_line(&format!("Please enter 1-{} or 0.", max))?;
        }
    }

    fn dial<L: SerialLine>(&mut self, modem: &mut Modem<L>, entry: &BbsEntry) -> SessionOutcome {
        let id = Uuid::new_v4();
        let started = Utc::now();
        let clock = Instant::now();
        info!("Session {} starting: {} via {}", id, entry.name, entry.protocol);

        let outcome = bridge::run_session(modem, entry, &self.settings);

        let report = SessionReport {
            id,
            bbs: entry.name.clone(),
            protocol: entry.protocol,
            started,
            duration_ms: clock.elapsed().as_millis() as u64,
            outcome,
        };
        if outcome == SessionOutcome::Error {
            warn!("{}", report);
        } else {
            info!("{}", report);
        }
        self.reports.push(report);
        outcome
    }

    fn pause(&self, total: Duration) {
        let deadline = deadline_after(total);
        while !self.shutdown.is_triggered() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }
}
