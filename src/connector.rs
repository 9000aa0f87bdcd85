//! # Protocol Connectors
//!
//! Turn a [`BbsEntry`] into a connected [`RemoteStream`]:
//!
//! - **telnet** - plain TCP connect, no negotiation
//! - **ssh** - prompts the caller for credentials, accepts any host key,
//!   opens an `ansi` 80x24 shell, and offers retry-or-menu after a failure
//! - **rlogin** - prompts for a username and performs the RFC 1282 handshake
//!
//! Connectors never fail loudly: anything that goes wrong is logged, a short
//! notice is shown to the caller, and `None` comes back so the caller returns
//! to the menu.

use crate::config::{BbsEntry, Protocol};
use crate::error::{GatewayError, Result};
use crate::modem::{Modem, SerialLine};
use crate::stream::{RemoteStream, SocketStream, SshStream};
use log::{debug, error, info, warn};
use ssh2::{ErrorCode, HashType, Session};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// libssh2's LIBSSH2_ERROR_AUTHENTICATION_FAILED.
const SSH_AUTH_FAILED: i32 = -18;

/// Terminal advertised to the remote side by SSH and rlogin.
pub const TERMINAL_TYPE: &str = "ansi";
pub const TERMINAL_COLS: u32 = 80;
pub const TERMINAL_ROWS: u32 = 24;
const RLOGIN_TERMINAL: &str = "ansi/9600";

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub timeout: Duration,
    /// User name for "none" authentication when the caller gives no SSH username.
    pub ssh_anonymous_user: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            ssh_anonymous_user: "guest".to_string(),
        }
    }
}

/// Establish a stream to `entry` using its configured protocol.
pub fn connect<L: SerialLine>(
    entry: &BbsEntry,
    modem: &mut Modem<L>,
    opts: &ConnectOptions,
) -> Option<RemoteStream> {
    match entry.protocol {
        Protocol::Telnet => connect_telnet(entry, opts),
        Protocol::Ssh => connect_ssh(entry, modem, opts),
        Protocol::Rlogin => connect_rlogin(entry, modem, opts),
    }
}

pub fn connect_telnet(entry: &BbsEntry, opts: &ConnectOptions) -> Option<RemoteStream> {
    debug!("Creating telnet connection to {}", entry.address());
    match open_tcp(entry, opts.timeout) {
        Ok(sock) => Some(RemoteStream::Telnet(SocketStream::new(sock))),
        Err(e) => {
            error!("Telnet connection failed: {}", e);
            None
        }
    }
}

pub fn connect_ssh<L: SerialLine>(
    entry: &BbsEntry,
    modem: &mut Modem<L>,
    opts: &ConnectOptions,
) -> Option<RemoteStream> {
    match ssh_dialog(entry, modem, opts) {
        Ok(stream) => stream,
        Err(GatewayError::Cancelled) => None,
        Err(e) => {
            error!("SSH setup aborted: {}", e);
            None
        }
    }
}

fn ssh_dialog<L: SerialLine>(
    entry: &BbsEntry,
    modem: &mut Modem<L>,
    opts: &ConnectOptions,
) -> Result<Option<RemoteStream>> {
    modem.print_line("")?;
    modem.print_line(&format!("SSH connection to {}", entry.address()))?;
    loop {
        modem.print_line("")?;
        let username = modem.input_line("Username: ", None, true)?;
        let password = if username.is_empty() {
            None
        } else {
            Some(modem.input_line("Password: ", Some('*'), true)?)
        };

        debug!(
            "Creating SSH connection to {} as {:?}",
            entry.address(),
            username
        );
        match open_ssh(entry, &username, password.as_deref(), opts) {
            Ok(stream) => {
                info!("SSH connected to {}", entry.address());
                return Ok(Some(RemoteStream::Ssh(stream)));
            }
            Err(GatewayError::AuthenticationFailed) => {
                error!("SSH authentication failed for {}", entry.address());
                modem.print_line("Authentication failed.")?;
            }
            Err(GatewayError::Ssh(e)) => {
                error!("SSH error: {}", e);
                modem.print_line(&format!("SSH error: {}", e.message()))?;
            }
            Err(e) => {
                error!("SSH connection failed: {}", e);
                modem.print_line(&format!("Connection failed: {}", e))?;
            }
        }

        modem.print_line("")?;
        let choice = modem.getch("(R)etry or (M)enu? ")?;
        modem.print_line("")?;
        if !choice.eq_ignore_ascii_case(&b'r') {
            return Ok(None);
        }
    }
}

/// How a caller's SSH credentials are presented to the server.
#[derive(Debug, PartialEq, Eq)]
enum SshAuth<'a> {
    /// "none" authentication as this user.
    NoPassword(&'a str),
    Password(&'a str, &'a str),
}

impl<'a> SshAuth<'a> {
    /// A blank username logs in as `anonymous`; a blank password is left out.
    fn plan(username: &'a str, password: Option<&'a str>, anonymous: &'a str) -> Self {
        match (username, password) {
            ("", _) => SshAuth::NoPassword(anonymous),
            (user, Some(pass)) if !pass.is_empty() => SshAuth::Password(user, pass),
            (user, _) => SshAuth::NoPassword(user),
        }
    }
}

/// Open an SSH session, authenticate, and start an interactive shell.
///
/// The host key is accepted without verification; its fingerprint is only logged.
/// An empty `username` tries "none" authentication as the configured anonymous user,
/// and an empty password tries "none" authentication as `username`.
pub fn open_ssh(
    entry: &BbsEntry,
    username: &str,
    password: Option<&str>,
    opts: &ConnectOptions,
) -> Result<SshStream> {
    let tcp = open_tcp(entry, opts.timeout)?;
    let mut session = Session::new()?;
    session.set_tcp_stream(tcp.try_clone()?);
    session.set_timeout(opts.timeout.as_millis().min(u32::MAX as u128) as u32);
    session.handshake()?;

    if let Some(hash) = session.host_key_hash(HashType::Sha256) {
        let fingerprint: String = hash.iter().map(|b| format!("{:02x}", b)).collect();
        info!(
            "Accepting host key for {} without verification (SHA256 {})",
            entry.address(),
            fingerprint
        );
    }

    match SshAuth::plan(username, password, &opts.ssh_anonymous_user) {
        SshAuth::NoPassword(user) => {
            // Listing methods attempts "none" auth; a permissive server accepts it.
            if let Err(e) = session.auth_methods(user) {
                debug!("SSH none auth for {:?}: {}", user, e);
            }
        }
        SshAuth::Password(user, pass) => {
            if let Err(e) = session.userauth_password(user, pass) {
                if e.code() == ErrorCode::Session(SSH_AUTH_FAILED) {
                    return Err(GatewayError::AuthenticationFailed);
                }
                return Err(e.into());
            }
        }
    }
    if !session.authenticated() {
        return Err(GatewayError::AuthenticationFailed);
    }

    let mut channel = session.channel_session()?;
    channel.request_pty(
        TERMINAL_TYPE,
        None,
        Some((TERMINAL_COLS, TERMINAL_ROWS, 0, 0)),
    )?;
    channel.shell()?;
    session.set_blocking(false);
    Ok(SshStream::new(session, channel, tcp))
}

pub fn connect_rlogin<L: SerialLine>(
    entry: &BbsEntry,
    modem: &mut Modem<L>,
    opts: &ConnectOptions,
) -> Option<RemoteStream> {
    match rlogin_dialog(entry, modem, opts) {
        Ok(stream) => stream,
        Err(GatewayError::Cancelled) => None,
        Err(e) => {
            error!("rlogin setup aborted: {}", e);
            None
        }
    }
}

fn rlogin_dialog<L: SerialLine>(
    entry: &BbsEntry,
    modem: &mut Modem<L>,
    opts: &ConnectOptions,
) -> Result<Option<RemoteStream>> {
    modem.print_line("")?;
    modem.print_line(&format!("rlogin connection to {}", entry.address()))?;
    modem.print_line("")?;

    let username = modem.input_line("Username: ", None, true)?;
    if username.is_empty() {
        warn!("rlogin to {} aborted: {}", entry.address(), GatewayError::UsernameRequired);
        modem.print_line("Username required.")?;
        return Ok(None);
    }

    debug!(
        "Creating rlogin connection to {} as {:?}",
        entry.address(),
        username
    );
    match open_rlogin(entry, &username, opts.timeout) {
        Ok(stream) => {
            info!("rlogin connected to {}", entry.address());
            Ok(Some(RemoteStream::Rlogin(stream)))
        }
        Err(e) => {
            error!("rlogin connection failed: {}", e);
            modem.print_line(&format!("Connection failed: {}", e))?;
            Ok(None)
        }
    }
}

/// RFC 1282 client handshake: `\0 local-user \0 remote-user \0 term/speed \0`,
/// with the remote user equal to the local one.
pub fn rlogin_handshake(username: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(username.len() * 2 + RLOGIN_TERMINAL.len() + 4);
    out.push(0);
    out.extend_from_slice(username.as_bytes());
    out.push(0);
    out.extend_from_slice(username.as_bytes());
    out.push(0);
    out.extend_from_slice(RLOGIN_TERMINAL.as_bytes());
    out.push(0);
    out
}

/// Connect, send the handshake in one write, and read the server's one-byte
/// acknowledgement. A non-null acknowledgement is logged and tolerated.
pub fn open_rlogin(entry: &BbsEntry, username: &str, timeout: Duration) -> Result<SocketStream> {
    let mut sock = open_tcp(entry, timeout)?;
    sock.write_all(&rlogin_handshake(username))?;

    sock.set_read_timeout(Some(timeout))?;
    let mut ack = [0u8; 1];
    match sock.read(&mut ack)? {
        0 => warn!("rlogin server {} closed before acknowledging", entry.address()),
        _ if ack[0] != 0 => warn!("Unexpected rlogin response: {:#04x}", ack[0]),
        _ => debug!("rlogin handshake acknowledged"),
    }

    sock.set_read_timeout(None)?;
    sock.set_nonblocking(true)?;
    Ok(SocketStream::new(sock))
}

/// TCP connect to `entry`, trying each resolved address within `timeout`.
pub fn open_tcp(entry: &BbsEntry, timeout: Duration) -> Result<TcpStream> {
    let addrs = (entry.host.as_str(), entry.port)
        .to_socket_addrs()
        .map_err(|e| GatewayError::ConnectionFailed {
            target: entry.address(),
            reason: format!("cannot resolve host: {}", e),
        })?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(sock) => {
                let _ = sock.set_nodelay(true);
                return Ok(sock);
            }
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(GatewayError::ConnectionFailed {
        target: entry.address(),
        reason: last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no addresses".to_string()),
    })
}
