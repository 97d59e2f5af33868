/// Errors surfaced to SDK users.
#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("not connected to the cube app service")]
    NotConnected,
    /// The relay answered the command with a nak.
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("compartment {0} not found")]
    CompartmentNotFound(String),
    #[error("compartment {0} has no lock configured")]
    NoLockConfigured(String),
    #[error("client closed")]
    Closed,
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SdkError>;
