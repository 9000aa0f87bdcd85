use thiserror::Error;

/// Errors raised inside the gateway core.
///
/// Most of these never leave their component: connectors turn them into an
/// empty result, auto-login into `false`, and the bridge into a
/// [`SessionOutcome`](crate::bridge::SessionOutcome).
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Wrapper around IO errors on sockets and the local terminal.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapper around serial port errors (open, control lines).
    #[cfg(feature = "serial")]
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),

    /// Wrapper around libssh2 errors (transport, auth, channel).
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// Raw termios/poll errors from nix.
    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// Remote host could not be reached or the transport could not be set up.
    #[error("connection to {target} failed: {reason}")]
    ConnectionFailed { target: String, reason: String },

    /// The SSH server rejected the supplied credentials.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// rlogin needs a username and the caller gave none.
    #[error("username required")]
    UsernameRequired,

    /// The BBS entry names a protocol this gateway does not speak.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// The process is shutting down.
    #[error("cancelled")]
    Cancelled,

    /// Configuration values that cannot be used.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
