//! Error types for HezarDastan Core

use thiserror::Error;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Main error type for HezarDastan Core
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Obfuscation error: {0}")]
    Obfuscation(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("{protocol} does not handle {transport} traffic")]
    UnsupportedTransport {
        protocol: &'static str,
        transport: &'static str,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout error: operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Error: {0}")]
    Other(String),
}

impl CoreError {
    /// Create a new handshake error
    pub fn handshake<S: Into<String>>(msg: S) -> Self {
        Self::Handshake(msg.into())
    }

    /// Create a new obfuscation error
    pub fn obfuscation<S: Into<String>>(msg: S) -> Self {
        Self::Obfuscation(msg.into())
    }

    /// Create a new protocol violation error
    pub fn protocol_violation<S: Into<String>>(msg: S) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Create a new unauthorized error
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a new general error
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }

    /// Map the error onto the closest `std::io::ErrorKind`
    pub fn kind(&self) -> std::io::ErrorKind {
        use std::io::ErrorKind;

        match self {
            Self::Io(err) => err.kind(),
            Self::Handshake(_) | Self::ProtocolViolation(_) | Self::Obfuscation(_) => {
                ErrorKind::InvalidData
            }
            Self::UnsupportedTransport { .. } => ErrorKind::Unsupported,
            Self::Unauthorized(_) => ErrorKind::PermissionDenied,
            Self::Configuration(_) => ErrorKind::InvalidInput,
            Self::Timeout { .. } => ErrorKind::TimedOut,
            Self::Serialization(_) | Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether the error only means the peer went away
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionAborted
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::Serialization(format!("YAML error: {}", err))
    }
}

impl From<toml::ser::Error> for CoreError {
    fn from(err: toml::ser::Error) -> Self {
        CoreError::Serialization(format!("TOML error: {}", err))
    }
}

impl From<WsError> for CoreError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::Io(e) => CoreError::Io(e),
            WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                CoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "WebSocket connection closed",
                ))
            }
            WsError::Protocol(e) => CoreError::ProtocolViolation(e.to_string()),
            WsError::Capacity(e) => CoreError::ProtocolViolation(e.to_string()),
            WsError::Http(response) => {
                CoreError::Handshake(format!("Upgrade refused with {}", response.status()))
            }
            other => CoreError::Other(other.to_string()),
        }
    }
}
