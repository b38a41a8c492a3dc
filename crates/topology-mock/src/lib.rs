//! Hand-driven topology adaptor for tests
//!
//! Tests add and remove nodes directly, then call
//! `TopologyManager::refresh_topology` to make the change observable.
//! Removing a node is how tests simulate it becoming unreachable.

use async_trait::async_trait;
use meshq_topology::{Node, NodeId, TopologyAdaptor, TopologyError};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// In-memory topology adaptor
#[derive(Debug, Default)]
pub struct MockTopologyAdaptor {
    nodes: Mutex<BTreeMap<NodeId, Node>>,
}

impl MockTopologyAdaptor {
    /// Create an empty mock topology
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock topology pre-populated with the given nodes
    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mock = Self::new();
        for node in nodes {
            mock.add_node(node);
        }
        mock
    }

    /// Add (or re-add) a node, making it reachable
    pub fn add_node(&self, node: Node) {
        self.nodes.lock().insert(node.node_id().clone(), node);
    }

    /// Remove a node, making it unreachable
    pub fn remove_node(&self, node_id: &NodeId) {
        self.nodes.lock().remove(node_id);
    }

    /// Whether a node is currently present
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.lock().contains_key(node_id)
    }
}

#[async_trait]
impl TopologyAdaptor for MockTopologyAdaptor {
    async fn get_topology(&self) -> Result<Vec<Node>, TopologyError> {
        Ok(self.nodes.lock().values().cloned().collect())
    }
}
