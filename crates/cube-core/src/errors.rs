/// Errors raised by the relay service.
///
/// Routing and per-frame errors are contained to the command or session that
/// caused them; only [`RelayError::Bind`] is fatal to the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Neither the controller nor a mock locker is available.
    #[error("No locker connected")]
    NoLockerConnected,
    #[error("controller link unavailable: {0}")]
    ControllerSend(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),
    #[error("{role} sessions may not send `{message_type}` messages")]
    UnexpectedMessage {
        role: &'static str,
        message_type: &'static str,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn bind(addr: impl ToString, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// Fatal errors stop the relay; everything else is contained.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Bind { .. })
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NoLockerConnected => "no_locker_connected",
            Self::ControllerSend(_) => "controller_send",
            Self::InvalidFrame(_) => "invalid_frame",
            Self::UnexpectedMessage { .. } => "unexpected_message",
            Self::Bind { .. } => "bind",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
