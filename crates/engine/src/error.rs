//! Error types for the engine

use std::fmt;

use meshq_network::NetworkError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, Error>;

/// Main error type for the engine
#[derive(Debug)]
pub struct Error {
    /// Error kind
    kind: ErrorKind,
    /// Error context
    context: ErrorContext,
}

impl Error {
    /// Create a new error
    pub fn new(kind: ErrorKind, context: ErrorContext) -> Self {
        Self { kind, context }
    }

    /// Create error with string context
    pub fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: ErrorContext::Message(context.into()),
        }
    }

    /// Get error kind
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Get error context
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::NotFound, what)
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::InvalidState, msg)
    }

    /// Create an operation failed error
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::OperationFailed, msg)
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Timeout, msg)
    }

    /// Create a protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Protocol, msg)
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Storage, msg)
    }

    /// Create an invalid filter error
    pub fn invalid_filter(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::InvalidFilter, msg)
    }

    /// Create an unreachable-peer error
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Unreachable, msg)
    }

    /// Create a no-response error (peer reachable but silent)
    pub fn no_response(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::NoResponse, msg)
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Network, msg)
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Check if this means the peer is currently unreachable
    pub fn is_unreachable(&self) -> bool {
        matches!(self.kind, ErrorKind::Unreachable)
    }

    /// Check if this is the reachable-but-silent condition
    pub fn is_no_response(&self) -> bool {
        matches!(self.kind, ErrorKind::NoResponse)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            ErrorContext::Message(msg) => write!(f, "{}: {}", self.kind, msg),
            ErrorContext::Chain { message, source } => {
                write!(f, "{}: {} (caused by: {})", self.kind, message, source)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<NetworkError> for Error {
    fn from(e: NetworkError) -> Self {
        let kind = if e.is_timeout() {
            ErrorKind::NoResponse
        } else if e.is_unreachable() {
            ErrorKind::Unreachable
        } else {
            ErrorKind::Network
        };
        Self::with_context(kind, e.to_string())
    }
}

/// Error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resource not found
    NotFound,
    /// Invalid state for operation
    InvalidState,
    /// Operation failed
    OperationFailed,
    /// Operation timed out
    Timeout,
    /// Peer reachable but did not answer in time
    NoResponse,
    /// Peer currently unreachable
    Unreachable,
    /// Protocol violation (out-of-order sequence, reply after close)
    Protocol,
    /// Local message-store failure
    Storage,
    /// Filter failed to parse
    InvalidFilter,
    /// Network error
    Network,
    /// Configuration error
    Configuration,
    /// Internal error
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "Not found"),
            ErrorKind::InvalidState => write!(f, "Invalid state"),
            ErrorKind::OperationFailed => write!(f, "Operation failed"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::NoResponse => write!(f, "No response"),
            ErrorKind::Unreachable => write!(f, "Unreachable"),
            ErrorKind::Protocol => write!(f, "Protocol violation"),
            ErrorKind::Storage => write!(f, "Storage error"),
            ErrorKind::InvalidFilter => write!(f, "Invalid filter"),
            ErrorKind::Network => write!(f, "Network error"),
            ErrorKind::Configuration => write!(f, "Configuration error"),
            ErrorKind::Internal => write!(f, "Internal error"),
        }
    }
}

/// Error context
#[derive(Debug)]
pub enum ErrorContext {
    /// Simple message context
    Message(String),
    /// Chained error context
    Chain {
        /// Context message
        message: String,
        /// Source error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
