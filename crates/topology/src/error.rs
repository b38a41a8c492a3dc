//! Error types for topology operations

use thiserror::Error;

/// Topology-related errors
#[derive(Clone, Debug, Error)]
pub enum TopologyError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Topology adaptor error
    #[error("Topology adaptor error: {0}")]
    Adaptor(String),

    /// Node not found in the current topology
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
