//! Registry of locally hosted partitions

use dashmap::DashMap;
use std::sync::Arc;

use crate::foundation::traits::LocalPartition;
use crate::foundation::types::DestinationName;

/// Destinations whose partition is hosted by this node
#[derive(Default)]
pub struct DestinationRegistry {
    partitions: DashMap<DestinationName, Arc<dyn LocalPartition>>,
}

impl DestinationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a locally hosted partition
    pub fn register(&self, partition: Arc<dyn LocalPartition>) {
        self.partitions
            .insert(partition.destination().clone(), partition);
    }

    /// Remove a partition registration
    pub fn deregister(&self, destination: &DestinationName) {
        self.partitions.remove(destination);
    }

    /// Look up the local partition for a destination
    pub fn get(&self, destination: &DestinationName) -> Option<Arc<dyn LocalPartition>> {
        self.partitions
            .get(destination)
            .map(|entry| entry.value().clone())
    }
}

impl std::fmt::Debug for DestinationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationRegistry")
            .field("partitions", &self.partitions.len())
            .finish()
    }
}
