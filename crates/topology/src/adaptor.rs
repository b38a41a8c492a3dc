//! Topology discovery abstraction

use crate::error::TopologyError;
use crate::node::Node;
use async_trait::async_trait;
use std::fmt::Debug;

/// Source of truth for the node set of the mesh
///
/// A node is considered reachable while it is present in the topology the
/// adaptor returns; nodes that drop out of the returned set are treated as
/// unreachable until they reappear.
#[async_trait]
pub trait TopologyAdaptor: Debug + Send + Sync + 'static {
    /// Get the current set of reachable nodes
    async fn get_topology(&self) -> Result<Vec<Node>, TopologyError>;
}
