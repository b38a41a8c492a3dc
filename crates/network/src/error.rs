//! Network layer error types

use meshq_transport::TransportError;
use thiserror::Error;

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors raised by the network layer
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Peer not present in the topology
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Request did not complete within its timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Response channel closed before a reply arrived
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Payload could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed or unexpected message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Service-level failure while handling a request
    #[error("Service error: {0}")]
    Service(String),

    /// Manager already shut down
    #[error("Network manager shut down")]
    Shutdown,
}

impl NetworkError {
    /// Whether this error means the peer is currently unreachable
    pub fn is_unreachable(&self) -> bool {
        match self {
            NetworkError::Transport(e) => e.is_no_route(),
            NetworkError::PeerNotFound(_) => true,
            _ => false,
        }
    }

    /// Whether this error is a request timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetworkError::Timeout(_))
    }
}
