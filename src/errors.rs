//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed, oversized, or out-of-sequence frame on a session.
    Protocol(String),
    /// Stream closed, reset, or timed out.
    Network(String),
    /// Handshake rejected the peer.
    Unauthorized(String),
    /// Code image could not be loaded at all.
    Load(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Unexpected failure in the host itself; tears the whole host down.
    Host(String),
}

impl AppError {
    /// Whether the error is contained by the session that raised it.
    ///
    /// Everything else is treated as a programming error and escalated to
    /// the host abort path.
    #[must_use]
    pub fn is_session_local(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::Network(_) | Self::Unauthorized(_) | Self::Io(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Network(msg) => write!(f, "network: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Load(msg) => write!(f, "load: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Host(msg) => write!(f, "host: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut => Self::Network(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<bincode::Error> for AppError {
    fn from(err: bincode::Error) -> Self {
        Self::Protocol(format!("malformed payload: {err}"))
    }
}
