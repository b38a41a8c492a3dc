//! Transport error types

use thiserror::Error;

/// Errors raised by transport implementations
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// No route to the recipient (node unreachable or unknown)
    #[error("No route to node: {0}")]
    NoRoute(String),

    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The recipient's queue rejected the envelope
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Invalid address or configuration
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Transport already shut down
    #[error("Transport shut down")]
    Shutdown,

    /// Other transport error
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether this error means the recipient is currently unreachable
    pub fn is_no_route(&self) -> bool {
        matches!(self, TransportError::NoRoute(_))
    }
}
