//! Topology management and reachability tracking

use crate::adaptor::TopologyAdaptor;
use crate::error::TopologyError;
use crate::node::{Node, NodeId};
use crate::subscriber::{TopologyBroadcaster, TopologyEvent, TopologySubscription};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default refresh interval for topology updates
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for the topology manager
#[derive(Clone)]
pub struct TopologyManagerConfig {
    /// Interval at which to refresh the topology
    pub refresh_interval: Duration,
}

impl Default for TopologyManagerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

/// Background task state
struct TaskState {
    refresh_task: Option<JoinHandle<()>>,
    shutdown_signal: Option<oneshot::Sender<()>>,
}

/// Manages the node set and per-node reachability
///
/// Reachability follows presence: a node present in the adaptor's topology
/// is reachable, one that dropped out is not. Each refresh diffs the cached
/// set against the adaptor's and broadcasts the transitions.
pub struct TopologyManager<G>
where
    G: TopologyAdaptor,
{
    adaptor: Arc<G>,
    node_id: NodeId,
    cached_nodes: Arc<RwLock<HashMap<NodeId, Node>>>,
    broadcaster: Arc<TopologyBroadcaster>,
    task_state: Arc<RwLock<TaskState>>,
    config: TopologyManagerConfig,
}

impl<G> TopologyManager<G>
where
    G: TopologyAdaptor,
{
    /// Create a new topology manager with default configuration
    pub fn new(adaptor: Arc<G>, node_id: NodeId) -> Self {
        Self::with_config(adaptor, node_id, TopologyManagerConfig::default())
    }

    /// Create a new topology manager with custom configuration
    pub fn with_config(adaptor: Arc<G>, node_id: NodeId, config: TopologyManagerConfig) -> Self {
        Self {
            adaptor,
            node_id,
            cached_nodes: Arc::new(RwLock::new(HashMap::new())),
            broadcaster: Arc::new(TopologyBroadcaster::new()),
            task_state: Arc::new(RwLock::new(TaskState {
                refresh_task: None,
                shutdown_signal: None,
            })),
            config,
        }
    }

    /// Get the local node ID
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Start the manager: initial refresh plus the background refresh task
    pub async fn start(&self) -> Result<(), TopologyError> {
        info!("Starting topology manager for node {}", self.node_id);
        self.refresh_topology().await?;
        self.start_refresh_task().await;
        Ok(())
    }

    /// Shut down the background refresh task
    pub async fn shutdown(&self) -> Result<(), TopologyError> {
        let mut state = self.task_state.write().await;

        if let Some(signal) = state.shutdown_signal.take() {
            let _ = signal.send(());
        }

        if let Some(task) = state.refresh_task.take() {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => debug!("Topology refresh task completed"),
                Ok(Err(e)) => warn!("Topology refresh task failed: {}", e),
                Err(_) => warn!("Topology refresh task timed out"),
            }
        }

        Ok(())
    }

    /// Subscribe to reachability transitions
    pub fn subscribe(&self) -> TopologySubscription {
        self.broadcaster.subscribe()
    }

    /// Refresh the topology from the adaptor, broadcasting transitions
    pub async fn refresh_topology(&self) -> Result<(), TopologyError> {
        Self::refresh_static(
            &self.adaptor,
            &self.node_id,
            &self.cached_nodes,
            &self.broadcaster,
        )
        .await
    }

    /// Get a node by ID, if currently reachable
    pub async fn get_node(&self, node_id: &NodeId) -> Option<Node> {
        self.cached_nodes.read().await.get(node_id).cloned()
    }

    /// All reachable peers, excluding the local node
    pub async fn peers(&self) -> Vec<Node> {
        self.cached_nodes
            .read()
            .await
            .values()
            .filter(|n| n.node_id() != &self.node_id)
            .cloned()
            .collect()
    }

    async fn refresh_static(
        adaptor: &Arc<G>,
        node_id: &NodeId,
        cached_nodes: &Arc<RwLock<HashMap<NodeId, Node>>>,
        broadcaster: &Arc<TopologyBroadcaster>,
    ) -> Result<(), TopologyError> {
        let topology = adaptor.get_topology().await?;

        let mut fresh = HashMap::with_capacity(topology.len());
        for node in topology {
            fresh.insert(node.node_id().clone(), node);
        }

        let mut events = Vec::new();
        {
            let mut cached = cached_nodes.write().await;

            for (id, node) in &fresh {
                if id != node_id && !cached.contains_key(id) {
                    events.push(TopologyEvent::NodeReachable(node.clone()));
                }
            }
            for id in cached.keys() {
                if id != node_id && !fresh.contains_key(id) {
                    events.push(TopologyEvent::NodeUnreachable(id.clone()));
                }
            }

            *cached = fresh;
        }

        for event in events {
            debug!("Topology transition: {:?}", event);
            broadcaster.broadcast(event);
        }

        Ok(())
    }

    async fn start_refresh_task(&self) {
        let adaptor = self.adaptor.clone();
        let node_id = self.node_id.clone();
        let cached_nodes = self.cached_nodes.clone();
        let broadcaster = self.broadcaster.clone();
        let interval = self.config.refresh_interval;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = Self::refresh_static(
                            &adaptor,
                            &node_id,
                            &cached_nodes,
                            &broadcaster,
                        )
                        .await
                        {
                            warn!("Topology refresh failed: {}", e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Topology refresh task shutting down");
                        break;
                    }
                }
            }
        });

        let mut state = self.task_state.write().await;
        state.refresh_task = Some(task);
        state.shutdown_signal = Some(shutdown_tx);
    }
}

impl<G> std::fmt::Debug for TopologyManager<G>
where
    G: TopologyAdaptor,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyManager")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct ScriptedAdaptor {
        nodes: Mutex<Vec<Node>>,
    }

    impl ScriptedAdaptor {
        fn set_nodes(&self, nodes: Vec<Node>) {
            *self.nodes.lock() = nodes;
        }
    }

    #[async_trait]
    impl TopologyAdaptor for ScriptedAdaptor {
        async fn get_topology(&self) -> Result<Vec<Node>, TopologyError> {
            Ok(self.nodes.lock().clone())
        }
    }

    fn node(seed: u8) -> Node {
        Node::new(NodeId::from_seed(seed), format!("mem://{seed}"))
    }

    #[tokio::test]
    async fn refresh_broadcasts_transitions() {
        let local = NodeId::from_seed(1);
        let adaptor = Arc::new(ScriptedAdaptor::default());
        adaptor.set_nodes(vec![node(1), node(2)]);

        let manager = TopologyManager::new(adaptor.clone(), local.clone());
        let events = manager.subscribe();

        manager.refresh_topology().await.unwrap();
        match events.try_recv().unwrap() {
            TopologyEvent::NodeReachable(n) => assert_eq!(n.node_id(), &NodeId::from_seed(2)),
            other => panic!("unexpected event {other:?}"),
        }

        adaptor.set_nodes(vec![node(1)]);
        manager.refresh_topology().await.unwrap();
        match events.try_recv().unwrap() {
            TopologyEvent::NodeUnreachable(id) => assert_eq!(id, NodeId::from_seed(2)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_node_never_produces_events() {
        let local = NodeId::from_seed(1);
        let adaptor = Arc::new(ScriptedAdaptor::default());
        adaptor.set_nodes(vec![node(1)]);

        let manager = TopologyManager::new(adaptor.clone(), local);
        let events = manager.subscribe();

        manager.refresh_topology().await.unwrap();
        adaptor.set_nodes(vec![]);
        manager.refresh_topology().await.unwrap();

        assert!(events.try_recv().is_err());
    }
}
