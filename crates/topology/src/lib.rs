//! Network topology management for meshq
//!
//! This crate provides:
//! - Node identity types (`NodeId`, `Node`)
//! - The `TopologyAdaptor` trait for topology discovery
//! - A `TopologyManager` that caches the node set, tracks per-node
//!   reachability and broadcasts reachability transitions to subscribers

pub mod adaptor;
pub mod error;
pub mod manager;
pub mod node;
pub mod subscriber;

pub use adaptor::TopologyAdaptor;
pub use error::TopologyError;
pub use manager::{TopologyManager, TopologyManagerConfig};
pub use node::{Node, NodeId};
pub use subscriber::{TopologyEvent, TopologySubscription};
