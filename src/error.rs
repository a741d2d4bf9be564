use std::fmt;

use thiserror::Error;

/// Reply codes a projector uses to refuse a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorCode {
    /// ERR1
    UndefinedCommand,
    /// ERR2
    OutOfParameter,
    /// ERR3, the device cannot accept the command right now (warming, cooling, busy)
    UnavailableState,
    /// ERR4
    DeviceFailure,
}

impl ProtocolErrorCode {
    pub fn from_reply(data: &str) -> Option<Self> {
        match data.trim().to_ascii_uppercase().as_str() {
            "ERR1" => Some(Self::UndefinedCommand),
            "ERR2" => Some(Self::OutOfParameter),
            "ERR3" => Some(Self::UnavailableState),
            "ERR4" => Some(Self::DeviceFailure),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UndefinedCommand => "undefined_command",
            Self::OutOfParameter => "out_of_parameter",
            Self::UnavailableState => "unavailable_state",
            Self::DeviceFailure => "device_failure",
        }
    }
}

impl fmt::Display for ProtocolErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::UndefinedCommand => "undefined command (ERR1)",
            Self::OutOfParameter => "out of parameter (ERR2)",
            Self::UnavailableState => "unavailable in current state (ERR3)",
            Self::DeviceFailure => "projector failure (ERR4)",
        };
        f.write_str(text)
    }
}

/// Failure talking to a single device.
///
/// Messages are short and human readable: they end up verbatim in audit records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("network unreachable: {0}")]
    Unreachable(String),

    #[error("connection refused")]
    ConnectionRefused,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("protocol error: {0}")]
    Protocol(ProtocolErrorCode),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("malformed reply: {0}")]
    MalformedReply(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl DeviceError {
    /// Stable classification label stored alongside audit records.
    pub fn kind(&self) -> String {
        match self {
            Self::Unreachable(_) => "network_unreachable".to_string(),
            Self::ConnectionRefused => "connection_refused".to_string(),
            Self::AuthenticationFailed(_) => "authentication_failed".to_string(),
            Self::Protocol(code) => format!("protocol.{}", code.as_str()),
            Self::Timeout(_) => "timeout".to_string(),
            Self::MalformedReply(_) => "protocol.malformed_reply".to_string(),
            Self::InvalidCommand(_) => "invalid_command".to_string(),
        }
    }

    /// Connection-level failures, as opposed to the device refusing a command.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_) | Self::ConnectionRefused | Self::Timeout(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid stored value: {0}")]
    InvalidData(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Pool(_) | Self::Migration(_) | Self::InvalidData(_)
        )
    }
}
