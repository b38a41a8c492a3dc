//! Generic transport abstraction for node-to-node communication
//!
//! This crate provides a transport-agnostic interface for moving message
//! envelopes between nodes. Specific transport implementations (in-memory,
//! TCP, ...) live in separate crates.
//!
//! Wire framing, signing and payload serialization are owned by the
//! transport implementation and its collaborators; consumers of this trait
//! only see verified envelopes.

pub mod error;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use meshq_topology::NodeId;
use std::pin::Pin;
use uuid::Uuid;

pub use error::TransportError;

/// Transport-level message envelope
#[derive(Debug, Clone)]
pub struct TransportEnvelope {
    /// Correlation ID for request/response tracking
    pub correlation_id: Option<Uuid>,
    /// Message type tag used for handler dispatch
    pub message_type: String,
    /// The message payload
    pub payload: Bytes,
    /// The sender of the message
    pub sender: NodeId,
}

/// Transport trait for sending and receiving envelopes
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send an envelope to a specific node
    ///
    /// Fails with [`TransportError::NoRoute`] when the recipient is not
    /// currently reachable; callers treat that as a topology condition,
    /// not a protocol failure.
    async fn send_envelope(
        &self,
        recipient: &NodeId,
        payload: &Bytes,
        message_type: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<(), TransportError>;

    /// Get the stream of incoming envelopes
    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEnvelope> + Send>>;

    /// Shut down the transport
    async fn shutdown(&self) -> Result<(), TransportError>;
}

/// Configuration shared by transport implementations
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection timeout in milliseconds
    pub connection_timeout_ms: u64,
    /// Maximum message size in bytes
    pub max_message_size: usize,
    /// Message queue size per destination
    pub per_destination_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 5000,
            max_message_size: 10 * 1024 * 1024,
            per_destination_queue_size: 1000,
        }
    }
}
