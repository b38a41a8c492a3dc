//! Node identity types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a messaging node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Create a fresh random node ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Create a deterministic ID from a seed byte (tests)
    pub fn from_seed(seed: u8) -> Self {
        Self(Uuid::from_bytes([seed; 16]))
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node in the messaging topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    node_id: NodeId,
    origin: String,
}

impl Node {
    /// Create a new node
    pub fn new(node_id: NodeId, origin: impl Into<String>) -> Self {
        Self {
            node_id,
            origin: origin.into(),
        }
    }

    /// Get the node's ID
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Get the node's origin address
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.node_id, self.origin)
    }
}
