//! Anycast service wiring
//!
//! Binds the protocol objects to the network layer: registers the one-way
//! browse message sinks and the attach-handshake service, and gives the
//! rest of the engine typed entry points for opening browses and attaching
//! remote consumers.

use async_trait::async_trait;
use meshq_network::{MessageSink, NetworkManager, NetworkResult, Service, ServiceContext};
use meshq_topology::{NodeId, TopologyAdaptor};
use meshq_transport::Transport;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::AnycastConfig;
use crate::error::{EngineResult, Error};
use crate::foundation::destinations::DestinationRegistry;
use crate::foundation::types::{BrowseId, DestinationName, GatheringTargetId, MessageFilter};
use crate::services::anycast::cursor::{BrowseCursor, BrowseCursorRegistry};
use crate::services::anycast::messages::{
    BrowseData, BrowseEnd, BrowseGet, BrowseStatus, ConsumerCreate, ConsumerCreateAck,
    CreateRejectReason,
};
use crate::services::anycast::session::BrowseSessionRegistry;

/// Outbound control-message surface of the protocol
///
/// Sessions and cursors send through this trait so they stay independent
/// of the network stack; tests substitute a recording implementation.
#[async_trait]
pub trait AnycastWire: Send + Sync + 'static {
    /// Send a `BrowseGet` to the hosting node
    async fn send_browse_get(&self, to: &NodeId, msg: BrowseGet) -> EngineResult<()>;

    /// Send a `BrowseData` to the requesting node
    async fn send_browse_data(&self, to: &NodeId, msg: BrowseData) -> EngineResult<()>;

    /// Send a `BrowseEnd` to the requesting node
    async fn send_browse_end(&self, to: &NodeId, msg: BrowseEnd) -> EngineResult<()>;

    /// Send a `BrowseStatus` to the peer
    async fn send_browse_status(&self, to: &NodeId, msg: BrowseStatus) -> EngineResult<()>;
}

/// Remote consumer operations the gathering layer depends on
#[async_trait]
pub trait RemoteConsumerAccess: Send + Sync + 'static {
    /// Run the attach handshake against a hosting node
    ///
    /// A handshake timeout surfaces as the no-response condition, a
    /// missing route as unreachable; both are distinguishable by the
    /// caller, which treats them differently.
    async fn attach_consumer(&self, node: &NodeId, create: ConsumerCreate) -> EngineResult<()>;

    /// Open a browse cursor against a hosting node (no round trip; the
    /// hosting-side session is created by the first get)
    fn open_browse(
        &self,
        node: NodeId,
        destination: DestinationName,
        gathering_target: Option<GatheringTargetId>,
        filter: Option<String>,
    ) -> Arc<BrowseCursor>;

    /// Finish a browse and drop its cursor
    async fn finish_browse(&self, browse_id: BrowseId) -> EngineResult<()>;

    /// Drop a browse cursor without notifying the hosting side
    fn discard_browse(&self, browse_id: BrowseId);

    /// Force a fresh view of (and route to) a node before protocol work
    async fn force_connect(&self, node: &NodeId) -> EngineResult<()>;
}

/// The anycast protocol service of one node
pub struct AnycastService<T, G>
where
    T: Transport,
    G: TopologyAdaptor,
{
    network: Arc<NetworkManager<T, G>>,
    config: AnycastConfig,
    sessions: Arc<BrowseSessionRegistry>,
    cursors: Arc<BrowseCursorRegistry>,
    destinations: Arc<DestinationRegistry>,
}

impl<T, G> AnycastService<T, G>
where
    T: Transport,
    G: TopologyAdaptor,
{
    /// Create the service for a node
    pub fn new(
        network: Arc<NetworkManager<T, G>>,
        destinations: Arc<DestinationRegistry>,
        config: AnycastConfig,
    ) -> Arc<Self> {
        let wire: Arc<dyn AnycastWire> = Arc::new(NetworkWire {
            network: network.clone(),
        });
        let sessions = Arc::new(BrowseSessionRegistry::new(
            destinations.clone(),
            wire.clone(),
            config.expiry_timeout,
        ));
        let cursors = Arc::new(BrowseCursorRegistry::new(
            wire,
            config.get_timeout,
            config.liveness_interval,
        ));
        Arc::new(Self {
            network,
            config,
            sessions,
            cursors,
            destinations,
        })
    }

    /// Register handlers with the network layer and start the registries
    pub fn start(self: &Arc<Self>) {
        self.sessions.start();
        self.cursors.start();

        self.network.register_sink(Arc::new(BrowseGetSink {
            sessions: self.sessions.clone(),
        }));
        self.network.register_sink(Arc::new(BrowseStatusSink {
            sessions: self.sessions.clone(),
        }));
        self.network.register_sink(Arc::new(BrowseDataSink {
            cursors: self.cursors.clone(),
        }));
        self.network.register_sink(Arc::new(BrowseEndSink {
            cursors: self.cursors.clone(),
        }));
        self.network.register_service(Arc::new(ConsumerCreateService {
            destinations: self.destinations.clone(),
        }));

        info!(
            "Anycast service started on {}",
            self.network.local_node_id()
        );
    }

    /// Close every session and cursor (engine shutdown)
    pub async fn stop(&self) {
        self.sessions.close_all();
        self.cursors.finish_all().await;
    }

    /// The hosting-side session registry
    pub fn sessions(&self) -> &Arc<BrowseSessionRegistry> {
        &self.sessions
    }

    /// The requesting-side cursor registry
    pub fn cursors(&self) -> &Arc<BrowseCursorRegistry> {
        &self.cursors
    }
}

#[async_trait]
impl<T, G> RemoteConsumerAccess for AnycastService<T, G>
where
    T: Transport,
    G: TopologyAdaptor,
{
    async fn attach_consumer(&self, node: &NodeId, create: ConsumerCreate) -> EngineResult<()> {
        let destination = create.destination.clone();
        let ack: ConsumerCreateAck = self
            .network
            .request(node, create, self.config.get_timeout)
            .await?;

        if ack.accepted {
            return Ok(());
        }
        match ack.reason {
            Some(CreateRejectReason::UnknownDestination) => Err(Error::not_found(format!(
                "{node} hosts no partition of {destination}"
            ))),
            Some(CreateRejectReason::BadFilter(detail)) => Err(Error::invalid_filter(format!(
                "attach to {destination} on {node} rejected: {detail}"
            ))),
            Some(CreateRejectReason::Other(detail)) => Err(Error::operation_failed(format!(
                "attach to {destination} on {node} rejected: {detail}"
            ))),
            None => Err(Error::operation_failed(format!(
                "attach to {destination} on {node} rejected"
            ))),
        }
    }

    fn open_browse(
        &self,
        node: NodeId,
        destination: DestinationName,
        gathering_target: Option<GatheringTargetId>,
        filter: Option<String>,
    ) -> Arc<BrowseCursor> {
        self.cursors.open(node, destination, gathering_target, filter)
    }

    async fn finish_browse(&self, browse_id: BrowseId) -> EngineResult<()> {
        self.cursors.finish(browse_id).await
    }

    fn discard_browse(&self, browse_id: BrowseId) {
        self.cursors.discard(browse_id);
    }

    async fn force_connect(&self, node: &NodeId) -> EngineResult<()> {
        // Connections are made on demand; forcing one means refreshing the
        // topology view and confirming the node is routable again.
        self.network
            .topology()
            .refresh_topology()
            .await
            .map_err(|e| Error::network(e.to_string()))?;
        match self.network.topology().get_node(node).await {
            Some(_) => Ok(()),
            None => Err(Error::unreachable(format!("{node} not in topology"))),
        }
    }
}

impl<T, G> std::fmt::Debug for AnycastService<T, G>
where
    T: Transport,
    G: TopologyAdaptor,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnycastService")
            .field("sessions", &self.sessions.len())
            .field("cursors", &self.cursors.len())
            .finish_non_exhaustive()
    }
}

/// `AnycastWire` over the network manager
struct NetworkWire<T, G>
where
    T: Transport,
    G: TopologyAdaptor,
{
    network: Arc<NetworkManager<T, G>>,
}

#[async_trait]
impl<T, G> AnycastWire for NetworkWire<T, G>
where
    T: Transport,
    G: TopologyAdaptor,
{
    async fn send_browse_get(&self, to: &NodeId, msg: BrowseGet) -> EngineResult<()> {
        self.network.send(to, msg).await.map_err(Error::from)
    }

    async fn send_browse_data(&self, to: &NodeId, msg: BrowseData) -> EngineResult<()> {
        self.network.send(to, msg).await.map_err(Error::from)
    }

    async fn send_browse_end(&self, to: &NodeId, msg: BrowseEnd) -> EngineResult<()> {
        self.network.send(to, msg).await.map_err(Error::from)
    }

    async fn send_browse_status(&self, to: &NodeId, msg: BrowseStatus) -> EngineResult<()> {
        self.network.send(to, msg).await.map_err(Error::from)
    }
}

struct BrowseGetSink {
    sessions: Arc<BrowseSessionRegistry>,
}

#[async_trait]
impl MessageSink for BrowseGetSink {
    type Message = BrowseGet;

    async fn deliver(&self, message: BrowseGet, ctx: ServiceContext) -> NetworkResult<()> {
        self.sessions.handle_browse_get(ctx.sender, message).await;
        Ok(())
    }
}

struct BrowseStatusSink {
    sessions: Arc<BrowseSessionRegistry>,
}

#[async_trait]
impl MessageSink for BrowseStatusSink {
    type Message = BrowseStatus;

    async fn deliver(&self, message: BrowseStatus, ctx: ServiceContext) -> NetworkResult<()> {
        self.sessions.handle_browse_status(ctx.sender, message);
        Ok(())
    }
}

struct BrowseDataSink {
    cursors: Arc<BrowseCursorRegistry>,
}

#[async_trait]
impl MessageSink for BrowseDataSink {
    type Message = BrowseData;

    async fn deliver(&self, message: BrowseData, _ctx: ServiceContext) -> NetworkResult<()> {
        self.cursors.deliver_data(message);
        Ok(())
    }
}

struct BrowseEndSink {
    cursors: Arc<BrowseCursorRegistry>,
}

#[async_trait]
impl MessageSink for BrowseEndSink {
    type Message = BrowseEnd;

    async fn deliver(&self, message: BrowseEnd, _ctx: ServiceContext) -> NetworkResult<()> {
        self.cursors.deliver_end(message);
        Ok(())
    }
}

/// Hosting-side attach handshake
struct ConsumerCreateService {
    destinations: Arc<DestinationRegistry>,
}

#[async_trait]
impl Service for ConsumerCreateService {
    type Request = ConsumerCreate;

    async fn handle(
        &self,
        request: ConsumerCreate,
        ctx: ServiceContext,
    ) -> NetworkResult<ConsumerCreateAck> {
        debug!(
            "Consumer create from {} for {}",
            ctx.sender, request.destination
        );

        if self.destinations.get(&request.destination).is_none() {
            return Ok(ConsumerCreateAck {
                accepted: false,
                reason: Some(CreateRejectReason::UnknownDestination),
            });
        }

        if let Some(selector) = request.filter.as_deref()
            && let Err(e) = MessageFilter::parse(selector)
        {
            return Ok(ConsumerCreateAck {
                accepted: false,
                reason: Some(CreateRejectReason::BadFilter(e.to_string())),
            });
        }

        Ok(ConsumerCreateAck {
            accepted: true,
            reason: None,
        })
    }
}
