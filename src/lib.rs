//! # Modemgate - Dial-up Gateway to Telnet, SSH and rlogin BBSes
//!
//! Modemgate answers calls on a Hayes-compatible modem and bridges each caller
//! to a bulletin board reachable over the network. Callers pick a destination
//! from a numbered menu; the gateway connects, optionally logs them in with a
//! scripted exchange, then relays bytes both ways until somebody hangs up.
//!
//! ## Features
//!
//! - **Modem Control**: AT init sequence, `CONNECT` detection, and a forced hangup (DTR drop, `+++`, `ATH`) on every exit path.
//! - **Three Transports**: raw telnet, SSH-2 shell channels (libssh2) and the RFC 1282 rlogin handshake behind one [`stream::DuplexStream`] trait.
//! - **Auto-Login Scripts**: per-entry `wait` / `send` / `send_raw` / `delay` steps executed before the caller takes over.
//! - **Session Policies**: idle timeout, carrier-loss detection and cooperative shutdown, all ending in the same cleanup.
//! - **Local Mode**: drive the whole menu from your own terminal without a modem.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modemgate::config::Config;
//! use modemgate::gateway::Gateway;
//! use modemgate::modem::LocalLine;
//! use modemgate::shutdown::ShutdownFlag;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut gateway = Gateway::new(config, ShutdownFlag::new());
//!     tokio::task::spawn_blocking(move || -> modemgate::error::Result<()> {
//!         gateway.run_local(LocalLine::new()?)
//!     })
//!     .await??;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - TOML configuration, BBS entries and auto-login steps
//! - [`modem`] - modem control channel and the serial line abstraction
//! - [`stream`] - connected remote streams (socket, SSH)
//! - [`connector`] - per-protocol connection setup
//! - [`autologin`] - auto-login script interpreter
//! - [`bridge`] - the per-session data pump and its finalization
//! - [`gateway`] - call acceptance loop and caller menu
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Gateway      │ ← answers calls, shows the menu
//! └─────────────────┘
//!          │
//! ┌─────────────────┐     ┌─────────────────┐
//! │  Bridge Session │ ──→ │   Connector     │ ← telnet / ssh / rlogin
//! └─────────────────┘     └─────────────────┘
//!      │        │                  │
//! ┌─────────┐ ┌──────────┐  ┌─────────────┐
//! │  Modem  │ │Auto-Login│→ │ RemoteStream│
//! └─────────┘ └──────────┘  └─────────────┘
//! ```
//!
//! Everything below the gateway runs on one thread per serial line; the
//! binary keeps tokio for startup, config loading and signal handling.

pub mod autologin;
pub mod bridge;
pub mod config;
pub mod connector;
pub mod error;
pub mod gateway;
pub mod logutil;
pub mod modem;
pub mod poller;
pub mod shutdown;
pub mod stream;
