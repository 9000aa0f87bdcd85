//! # Configuration Management Module
//!
//! All gateway settings live in a single TOML file. Sections map one-to-one onto
//! the structs below and every section has defaults, so a file only needs the
//! `[[bbs]]` entries it wants to offer.
//!
//! - [`GatewayConfig`] - caller-facing text
//! - [`ModemConfig`] - serial device, AT init sequence, hangup timings
//! - [`BridgeConfig`] - idle timeout, connect timeout, read chunk sizes
//! - [`SshConfig`] - anonymous SSH login name
//! - [`LoggingConfig`] - log level and optional log file
//! - [`BbsEntry`] - one dialable destination, with an optional [`LoginStep`] script
//!
//! ## Configuration File Format
//!
//! ```toml
//! [modem]
//! port = "/dev/ttyUSB0"
//! baud_rate = 38400
//! init_sequence = ["ATZ", "AT&D0", "AT&C0", "ATV1", "ATS0=1"]
//!
//! [bridge]
//! idle_timeout_secs = 600
//!
//! [[bbs]]
//! name = "Local Synchronet"
//! host = "bbs.example.org"
//! port = 23
//! auto_login = [
//!     { wait = "login:" },
//!     { send = "guest" },
//!     { wait = { text = "password:", timeout_secs = 5 } },
//!     { send = "guest" },
//!     { delay = 500 },
//! ]
//! ```

use crate::error::GatewayError;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;

use crate::modem::ModemTimings;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default, rename = "bbs")]
    pub bbs_entries: Vec<BbsEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub welcome_message: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            welcome_message: "Welcome to the BBS Gateway!".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    pub port: String,
    pub baud_rate: u32,
    /// AT commands sent (each followed by CR) before waiting for a call.
    pub init_sequence: Vec<String>,
    /// RTS/CTS flow control on the serial port.
    pub hardware_flow_control: bool,
    /// Log every byte exchanged with the modem and the remote host.
    pub debug: bool,
    /// Pause after each init command (ms).
    pub command_delay_ms: u64,
    /// How long to wait for OK / NO CARRIER after ATH.
    pub hangup_timeout_secs: u64,
    pub dtr_drop_ms: u64,
    /// Escape guard time before and after `+++` (ms).
    pub guard_ms: u64,
    pub escape_wait_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 38400,
            init_sequence: default_init_sequence(),
            hardware_flow_control: true,
            debug: false,
            command_delay_ms: 1000,
            hangup_timeout_secs: 5,
            dtr_drop_ms: 1000,
            guard_ms: 500,
            escape_wait_ms: 1000,
            poll_interval_ms: 50,
        }
    }
}

/// Upper bound for any configured timeout, in seconds (one week).
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 3600;

pub fn default_init_sequence() -> Vec<String> {
    ["ATZ", "AT&D0", "AT&C0", "ATV1", "ATS0=1"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl ModemConfig {
    pub fn timings(&self) -> ModemTimings {
        ModemTimings {
            command_delay: Duration::from_millis(self.command_delay_ms),
            dtr_drop: Duration::from_millis(self.dtr_drop_ms),
            dtr_settle: Duration::from_millis(self.guard_ms),
            guard: Duration::from_millis(self.guard_ms),
            escape_wait: Duration::from_millis(self.escape_wait_ms),
            hangup_timeout: Duration::from_secs(self.hangup_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Seconds without traffic in either direction before the call is dropped. 0 disables.
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Default per-step timeout for auto-login `wait` steps.
    pub autologin_timeout_secs: u64,
    /// Minimum bytes read from the modem per readiness event.
    pub modem_read_chunk: usize,
    /// Maximum bytes read from the remote host per readiness event.
    pub bbs_read_chunk: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            connect_timeout_secs: 10,
            autologin_timeout_secs: 30,
            modem_read_chunk: 1,
            bbs_read_chunk: 1024,
        }
    }
}

impl BridgeConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// User name offered with "none" authentication when the caller leaves the username blank.
    pub anonymous_user: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            anonymous_user: "guest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("modemgate.log".to_string()),
        }
    }
}

/// Transport used to reach a BBS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Protocol {
    #[default]
    Telnet,
    Ssh,
    Rlogin,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Telnet => "telnet",
            Protocol::Ssh => "ssh",
            Protocol::Rlogin => "rlogin",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = GatewayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telnet" => Ok(Protocol::Telnet),
            "ssh" => Ok(Protocol::Ssh),
            "rlogin" => Ok(Protocol::Rlogin),
            other => Err(GatewayError::UnknownProtocol(other.to_string())),
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = GatewayError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Protocol> for String {
    fn from(value: Protocol) -> Self {
        value.as_str().to_string()
    }
}

/// A dialable destination offered in the gateway menu.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BbsEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_login: Option<Vec<LoginStep>>,
}

impl BbsEntry {
    pub fn new(name: &str, host: &str, port: u16, protocol: Protocol) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            description: String::new(),
            protocol,
            auto_login: None,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One action of an auto-login script.
///
/// In TOML each step is a one-key table: `{ wait = "login:" }`,
/// `{ wait = { text = "Password:", timeout_secs = 5 } }`, `{ send = "guest" }`,
/// `{ send_raw = "\u001b" }`, `{ delay = 250 }`. Any other key loads as
/// [`LoginStep::Unknown`] and is skipped when the script runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "toml::Table", into = "toml::Table")]
pub enum LoginStep {
    Wait {
        text: String,
        timeout: Option<Duration>,
    },
    Send(String),
    SendRaw(Vec<u8>),
    Delay(Duration),
    Unknown(String),
}

impl LoginStep {
    pub fn wait(text: &str) -> Self {
        LoginStep::Wait {
            text: text.to_string(),
            timeout: None,
        }
    }

    pub fn send(text: &str) -> Self {
        LoginStep::Send(text.to_string())
    }

    pub fn send_raw(bytes: &[u8]) -> Self {
        LoginStep::SendRaw(bytes.to_vec())
    }

    pub fn delay_ms(ms: u64) -> Self {
        LoginStep::Delay(Duration::from_millis(ms))
    }

    pub fn action(&self) -> &str {
        match self {
            LoginStep::Wait { .. } => "wait",
            LoginStep::Send(_) => "send",
            LoginStep::SendRaw(_) => "send_raw",
            LoginStep::Delay(_) => "delay",
            LoginStep::Unknown(action) => action,
        }
    }
}

impl TryFrom<toml::Table> for LoginStep {
    type Error = String;

    fn try_from(table: toml::Table) -> std::result::Result<Self, Self::Error> {
        let mut entries = table.into_iter();
        let (action, value) = match (entries.next(), entries.next()) {
            (Some(kv), None) => kv,
            _ => return Err("auto_login step must have exactly one action key".to_string()),
        };
        match action.as_str() {
            "wait" => match value {
                toml::Value::String(text) => Ok(LoginStep::Wait {
                    text,
                    timeout: None,
                }),
                toml::Value::Table(mut detail) => {
                    let text = match detail.remove("text") {
                        Some(toml::Value::String(text)) => text,
                        _ => return Err("wait step needs a `text` string".to_string()),
                    };
                    let timeout = match detail.remove("timeout_secs") {
                        None => None,
                        Some(toml::Value::Integer(secs))
                            if (0..=MAX_TIMEOUT_SECS as i64).contains(&secs) =>
                        {
                            Some(Duration::from_secs(secs as u64))
                        }
                        Some(toml::Value::Float(secs))
                            if (0.0..=MAX_TIMEOUT_SECS as f64).contains(&secs) =>
                        {
                            Some(
                                Duration::try_from_secs_f64(secs)
                                    .map_err(|e| format!("invalid wait timeout_secs: {e}"))?,
                            )
                        }
                        Some(other) => {
                            return Err(format!("invalid wait timeout_secs: {other}"))
                        }
                    };
                    Ok(LoginStep::Wait { text, timeout })
                }
                other => Err(format!("invalid wait step: {other}")),
            },
            "send" => match value {
                toml::Value::String(text) => Ok(LoginStep::Send(text)),
                other => Err(format!("send step needs a string, got {other}")),
            },
            "send_raw" => match value {
                toml::Value::String(text) => Ok(LoginStep::SendRaw(text.into_bytes())),
                other => Err(format!("send_raw step needs a string, got {other}")),
            },
            "delay" => match value {
                toml::Value::Integer(ms) if ms >= 0 => {
                    Ok(LoginStep::Delay(Duration::from_millis(ms as u64)))
                }
                other => Err(format!("delay step needs milliseconds, got {other}")),
            },
            _ => Ok(LoginStep::Unknown(action)),
        }
    }
}

impl From<LoginStep> for toml::Table {
    fn from(step: LoginStep) -> Self {
        let mut table = toml::Table::new();
        match step {
            LoginStep::Wait {
                text,
                timeout: None,
            } => {
                table.insert("wait".to_string(), toml::Value::String(text));
            }
            LoginStep::Wait {
                text,
                timeout: Some(timeout),
            } => {
                let mut detail = toml::Table::new();
                detail.insert("text".to_string(), toml::Value::String(text));
                detail.insert(
                    "timeout_secs".to_string(),
                    toml::Value::Float(timeout.as_secs_f64()),
                );
                table.insert("wait".to_string(), toml::Value::Table(detail));
            }
            LoginStep::Send(text) => {
                table.insert("send".to_string(), toml::Value::String(text));
            }
            LoginStep::SendRaw(bytes) => {
                table.insert(
                    "send_raw".to_string(),
                    toml::Value::String(String::from_utf8_lossy(&bytes).into_owned()),
                );
            }
            LoginStep::Delay(delay) => {
                table.insert(
                    "delay".to_string(),
                    toml::Value::Integer(delay.as_millis() as i64),
                );
            }
            LoginStep::Unknown(action) => {
                table.insert(action, toml::Value::Boolean(true));
            }
        }
        table
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;
        config
            .validate()
            .map_err(|e| anyhow!("Config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file with one sample entry
    pub async fn create_default(path: &str) -> Result<()> {
        let content = toml::to_string_pretty(&Config::sample())
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn sample() -> Self {
        let mut entry = BbsEntry::new("Example BBS", "bbs.example.org", 23, Protocol::Telnet);
        entry.description = "Replace with a real host".to_string();
        Config {
            bbs_entries: vec![entry],
            ..Config::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), GatewayError> {
        if self.modem.init_sequence.iter().any(|cmd| cmd.trim().is_empty()) {
            return Err(GatewayError::Config(
                "modem.init_sequence contains an empty command".to_string(),
            ));
        }
        if self.bridge.modem_read_chunk == 0 || self.bridge.bbs_read_chunk == 0 {
            return Err(GatewayError::Config(
                "bridge read chunk sizes must be at least 1".to_string(),
            ));
        }
        let timeouts = [
            ("modem.hangup_timeout_secs", self.modem.hangup_timeout_secs),
            ("bridge.idle_timeout_secs", self.bridge.idle_timeout_secs),
            ("bridge.connect_timeout_secs", self.bridge.connect_timeout_secs),
            ("bridge.autologin_timeout_secs", self.bridge.autologin_timeout_secs),
        ];
        if let Some((name, secs)) = timeouts.iter().find(|(_, secs)| *secs > MAX_TIMEOUT_SECS) {
            return Err(GatewayError::Config(format!(
                "{name} = {secs} exceeds the {MAX_TIMEOUT_SECS}s limit"
            )));
        }
        let delays = [
            ("modem.command_delay_ms", self.modem.command_delay_ms),
            ("modem.dtr_drop_ms", self.modem.dtr_drop_ms),
            ("modem.guard_ms", self.modem.guard_ms),
            ("modem.escape_wait_ms", self.modem.escape_wait_ms),
            ("modem.poll_interval_ms", self.modem.poll_interval_ms),
        ];
        if let Some((name, ms)) = delays
            .iter()
            .find(|(_, ms)| *ms > MAX_TIMEOUT_SECS * 1000)
        {
            return Err(GatewayError::Config(format!(
                "{name} = {ms} exceeds the {MAX_TIMEOUT_SECS}s limit"
            )));
        }
        if let Some(entry) = self.bbs_entries.iter().find(|e| e.port == 0) {
            return Err(GatewayError::Config(format!(
                "bbs entry '{}' has port 0",
                entry.name
            )));
        }
        Ok(())
    }
}
