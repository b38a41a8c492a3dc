//! Reachability event broadcast

use crate::node::{Node, NodeId};
use parking_lot::RwLock;

/// Reachability transition for a node in the topology
#[derive(Debug, Clone)]
pub enum TopologyEvent {
    /// The node appeared in the topology (or came back)
    NodeReachable(Node),
    /// The node dropped out of the topology
    NodeUnreachable(NodeId),
}

/// Receiving end of a topology subscription
pub type TopologySubscription = flume::Receiver<TopologyEvent>;

/// Fan-out of topology events to all live subscribers
///
/// Subscribers that dropped their receiver are pruned on the next send.
#[derive(Debug, Default)]
pub(crate) struct TopologyBroadcaster {
    senders: RwLock<Vec<flume::Sender<TopologyEvent>>>,
}

impl TopologyBroadcaster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> TopologySubscription {
        let (tx, rx) = flume::unbounded();
        self.senders.write().push(tx);
        rx
    }

    pub(crate) fn broadcast(&self, event: TopologyEvent) {
        let mut senders = self.senders.write();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_subscribers_are_pruned() {
        let broadcaster = TopologyBroadcaster::new();
        let keep = broadcaster.subscribe();
        let dropped = broadcaster.subscribe();
        drop(dropped);

        broadcaster.broadcast(TopologyEvent::NodeUnreachable(NodeId::from_seed(1)));

        assert_eq!(broadcaster.senders.read().len(), 1);
        assert!(matches!(
            keep.try_recv().unwrap(),
            TopologyEvent::NodeUnreachable(_)
        ));
    }
}
