//! Engine assembly
//!
//! Wires configuration, the network layer, the destination registry, the
//! anycast protocol service and per-destination gathering dispatchers into
//! one startable unit.

use dashmap::DashMap;
use meshq_topology::{TopologyAdaptor, TopologyEvent};
use meshq_transport::Transport;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineResult, Error};
use crate::foundation::destinations::DestinationRegistry;
use crate::foundation::traits::LocalPartition;
use crate::foundation::types::DestinationName;
use crate::services::anycast::{AnycastService, RemoteConsumerAccess};
use crate::services::gathering::GatheringConsumerDispatcher;
use meshq_network::NetworkManager;

/// One node of the message-queue engine
pub struct QueueEngine<T, G>
where
    T: Transport,
    G: TopologyAdaptor,
{
    config: EngineConfig,
    network: Arc<NetworkManager<T, G>>,
    destinations: Arc<DestinationRegistry>,
    anycast: Arc<AnycastService<T, G>>,
    dispatchers: DashMap<DestinationName, Arc<GatheringConsumerDispatcher>>,
    topology_task: Mutex<Option<JoinHandle<()>>>,
    cancellation: CancellationToken,
}

impl<T, G> QueueEngine<T, G>
where
    T: Transport,
    G: TopologyAdaptor,
{
    /// Assemble an engine over a network manager
    pub fn new(config: EngineConfig, network: Arc<NetworkManager<T, G>>) -> Arc<Self> {
        let destinations = Arc::new(DestinationRegistry::new());
        let anycast = AnycastService::new(
            network.clone(),
            destinations.clone(),
            config.anycast.clone(),
        );
        Arc::new(Self {
            config,
            network,
            destinations,
            anycast,
            dispatchers: DashMap::new(),
            topology_task: Mutex::new(None),
            cancellation: CancellationToken::new(),
        })
    }

    /// The destinations hosted by this node
    pub fn destinations(&self) -> &Arc<DestinationRegistry> {
        &self.destinations
    }

    /// The anycast protocol service
    pub fn anycast(&self) -> &Arc<AnycastService<T, G>> {
        &self.anycast
    }

    /// Host a partition on this node
    pub fn register_partition(&self, partition: Arc<dyn LocalPartition>) {
        self.destinations.register(partition);
    }

    /// Start the node: network routing, protocol handlers, topology watch
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        // Subscribe before the initial refresh so no transition is missed
        let events = self.network.topology().subscribe();

        self.network.start();
        self.anycast.start();
        self.network
            .topology()
            .start()
            .await
            .map_err(|e| Error::network(e.to_string()))?;

        let engine = self.clone();
        let cancellation = self.cancellation.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv_async() => {
                        match event {
                            Ok(event) => engine.route_topology_event(event).await,
                            Err(_) => break,
                        }
                    }
                    _ = cancellation.cancelled() => break,
                }
            }
        });
        *self.topology_task.lock() = Some(task);

        info!("Queue engine started on {}", self.network.local_node_id());
        Ok(())
    }

    /// Stop the node, closing sessions, cursors and attachments
    pub async fn stop(&self) -> EngineResult<()> {
        self.cancellation.cancel();
        if let Some(task) = self.topology_task.lock().take() {
            task.abort();
        }

        for entry in self.dispatchers.iter() {
            entry.value().close().await;
        }
        self.dispatchers.clear();

        self.anycast.stop().await;

        if let Err(e) = self.network.topology().shutdown().await {
            warn!("Topology shutdown failed: {}", e);
        }
        self.network.shutdown().await?;

        info!("Queue engine stopped on {}", self.network.local_node_id());
        Ok(())
    }

    /// The gathering dispatcher for a destination, created on first use
    ///
    /// The dispatcher starts out knowing every currently-reachable peer;
    /// later transitions reach it through the topology watch.
    pub async fn gathering_dispatcher(
        &self,
        destination: &DestinationName,
    ) -> Arc<GatheringConsumerDispatcher> {
        if let Some(dispatcher) = self.dispatchers.get(destination) {
            return dispatcher.value().clone();
        }

        let dispatcher = GatheringConsumerDispatcher::new(
            destination.clone(),
            self.network.local_node_id().clone(),
            self.destinations.get(destination),
            self.anycast.clone() as Arc<dyn RemoteConsumerAccess>,
            self.config.gathering.clone(),
        );
        for peer in self.network.topology().peers().await {
            dispatcher.seed_remote(peer.node_id().clone());
        }

        self.dispatchers
            .entry(destination.clone())
            .or_insert(dispatcher)
            .value()
            .clone()
    }

    async fn route_topology_event(self: &Arc<Self>, event: TopologyEvent) {
        match event {
            TopologyEvent::NodeReachable(node) => {
                debug!("Node {} reachable", node.node_id());
                let dispatchers: Vec<Arc<GatheringConsumerDispatcher>> =
                    self.dispatchers.iter().map(|e| e.value().clone()).collect();
                for dispatcher in dispatchers {
                    dispatcher
                        .handle_node_reachable(node.node_id().clone())
                        .await;
                }
            }
            TopologyEvent::NodeUnreachable(node_id) => {
                debug!("Node {} unreachable", node_id);
                let dispatchers: Vec<Arc<GatheringConsumerDispatcher>> =
                    self.dispatchers.iter().map(|e| e.value().clone()).collect();
                for dispatcher in dispatchers {
                    dispatcher.handle_node_unreachable(&node_id);
                }
            }
        }
    }
}

impl<T, G> std::fmt::Debug for QueueEngine<T, G>
where
    T: Transport,
    G: TopologyAdaptor,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEngine")
            .field("node", self.network.local_node_id())
            .field("dispatchers", &self.dispatchers.len())
            .finish_non_exhaustive()
    }
}
