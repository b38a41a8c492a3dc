//! In-memory transport implementation for testing
//!
//! Routes envelopes between nodes within the same process through a global
//! registry. Severing a node drops its registration so sends to it fail
//! with `NoRoute` — tests use this to drive the unreachable and
//! reattachment paths.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use meshq_topology::NodeId;
use meshq_transport::{Transport, TransportEnvelope, TransportError};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Global registry of memory transports for in-process routing
static GLOBAL_REGISTRY: once_cell::sync::Lazy<Arc<DashMap<NodeId, flume::Sender<TransportEnvelope>>>> =
    once_cell::sync::Lazy::new(|| Arc::new(DashMap::new()));

/// Memory transport bound to one node ID
#[derive(Debug)]
pub struct MemoryTransport {
    node_id: NodeId,
    incoming_rx: Mutex<Option<flume::Receiver<TransportEnvelope>>>,
}

impl MemoryTransport {
    /// Create a transport for the given node and register it for routing
    pub fn new(node_id: NodeId) -> Self {
        let (tx, rx) = flume::unbounded();
        GLOBAL_REGISTRY.insert(node_id.clone(), tx);
        debug!("Memory transport registered for node {}", node_id);
        Self {
            node_id,
            incoming_rx: Mutex::new(Some(rx)),
        }
    }

    /// Drop a node's registration so sends to it fail with `NoRoute`
    pub fn sever(node_id: &NodeId) {
        GLOBAL_REGISTRY.remove(node_id);
        debug!("Memory transport severed for node {}", node_id);
    }

    /// Re-register a previously severed node
    pub fn restore(&self) {
        let (tx, rx) = flume::unbounded();
        GLOBAL_REGISTRY.insert(self.node_id.clone(), tx);
        *self.incoming_rx.lock() = Some(rx);
        debug!("Memory transport restored for node {}", self.node_id);
    }

    /// Clear all global state (useful between tests)
    pub fn clear_global_state() {
        GLOBAL_REGISTRY.clear();
    }

    /// The node this transport is bound to
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        GLOBAL_REGISTRY.remove(&self.node_id);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_envelope(
        &self,
        recipient: &NodeId,
        payload: &Bytes,
        message_type: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<(), TransportError> {
        let sender = GLOBAL_REGISTRY
            .get(recipient)
            .ok_or_else(|| TransportError::NoRoute(recipient.to_string()))?;

        let envelope = TransportEnvelope {
            correlation_id,
            message_type: message_type.to_string(),
            payload: payload.clone(),
            sender: self.node_id.clone(),
        };

        sender
            .send(envelope)
            .map_err(|_| TransportError::SendFailed(recipient.to_string()))
    }

    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEnvelope> + Send>> {
        let rx = self
            .incoming_rx
            .lock()
            .take()
            .expect("incoming() may only be called once per transport");
        Box::pin(rx.into_stream())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        GLOBAL_REGISTRY.remove(&self.node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn routes_between_registered_nodes() {
        let a = MemoryTransport::new(NodeId::from_seed(101));
        let b = MemoryTransport::new(NodeId::from_seed(102));
        let mut incoming = b.incoming();

        a.send_envelope(b.node_id(), &Bytes::from_static(b"hi"), "test", None)
            .await
            .unwrap();

        let envelope = incoming.next().await.unwrap();
        assert_eq!(envelope.sender, NodeId::from_seed(101));
        assert_eq!(envelope.message_type, "test");
        assert_eq!(envelope.payload, Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn severed_node_is_unroutable() {
        let a = MemoryTransport::new(NodeId::from_seed(103));
        let b = MemoryTransport::new(NodeId::from_seed(104));

        MemoryTransport::sever(b.node_id());
        let err = a
            .send_envelope(b.node_id(), &Bytes::from_static(b"hi"), "test", None)
            .await
            .unwrap_err();
        assert!(err.is_no_route());

        b.restore();
        a.send_envelope(b.node_id(), &Bytes::from_static(b"hi"), "test", None)
            .await
            .unwrap();
    }
}
