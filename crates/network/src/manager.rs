//! Network manager: correlation, service dispatch and the router loop

use crate::error::{NetworkError, NetworkResult};
use crate::message::{NetworkMessage, ServiceMessage, response_type};
use crate::service::{
    MessageSink, Service, ServiceContext, ServiceHandler, SinkHandler, TypedServiceHandler,
    TypedSinkHandler,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use meshq_topology::{NodeId, TopologyAdaptor, TopologyManager};
use meshq_transport::{Transport, TransportEnvelope};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Network manager for typed node-to-node messaging
///
/// Owns the pending-request table (UUID correlation to a oneshot
/// completion) and the registries of request/response services and one-way
/// sinks. The router loop consumes the transport's incoming stream and
/// dispatches: correlated replies complete pending requests, everything
/// else goes to the registered handler for its message type.
pub struct NetworkManager<T, G>
where
    T: Transport,
    G: TopologyAdaptor,
{
    local_node_id: NodeId,
    transport: Arc<T>,
    topology: Arc<TopologyManager<G>>,
    pending_requests: Arc<DashMap<Uuid, oneshot::Sender<Bytes>>>,
    services: Arc<DashMap<String, Arc<dyn ServiceHandler>>>,
    sinks: Arc<DashMap<String, Arc<dyn SinkHandler>>>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl<T, G> NetworkManager<T, G>
where
    T: Transport,
    G: TopologyAdaptor,
{
    /// Create a new network manager
    pub fn new(
        local_node_id: NodeId,
        transport: Arc<T>,
        topology: Arc<TopologyManager<G>>,
    ) -> Self {
        Self {
            local_node_id,
            transport,
            topology,
            pending_requests: Arc::new(DashMap::new()),
            services: Arc::new(DashMap::new()),
            sinks: Arc::new(DashMap::new()),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Get the local node ID
    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    /// Get the topology manager
    pub fn topology(&self) -> &Arc<TopologyManager<G>> {
        &self.topology
    }

    /// Register a request/response service
    pub fn register_service<S>(&self, service: Arc<S>)
    where
        S: Service,
    {
        let id = S::Request::service_id().to_string();
        self.services
            .insert(id, Arc::new(TypedServiceHandler { service }));
    }

    /// Register a one-way message sink
    pub fn register_sink<S>(&self, sink: Arc<S>)
    where
        S: MessageSink,
    {
        let id = S::Message::message_type().to_string();
        self.sinks.insert(id, Arc::new(TypedSinkHandler { sink }));
    }

    /// Start the router loop over the transport's incoming stream
    pub fn start(&self) {
        let mut incoming = self.transport.incoming();
        let transport = self.transport.clone();
        let pending = self.pending_requests.clone();
        let services = self.services.clone();
        let sinks = self.sinks.clone();
        let tracker = self.task_tracker.clone();
        let cancellation = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    envelope = incoming.next() => {
                        let Some(envelope) = envelope else {
                            debug!("Transport incoming stream ended");
                            break;
                        };
                        Self::route_envelope(
                            envelope,
                            &transport,
                            &pending,
                            &services,
                            &sinks,
                            &tracker,
                        );
                    }
                    _ = cancellation.cancelled() => {
                        debug!("Router loop cancelled");
                        break;
                    }
                }
            }
        });

        info!("Network manager started for node {}", self.local_node_id);
    }

    /// Send a typed one-way message to a peer
    pub async fn send<M>(&self, target: &NodeId, message: M) -> NetworkResult<()>
    where
        M: NetworkMessage,
    {
        let payload = message.encode()?;
        self.transport
            .send_envelope(target, &payload, M::message_type(), None)
            .await
            .map_err(NetworkError::Transport)
    }

    /// Send a typed request and wait for the typed response
    pub async fn request<M>(
        &self,
        target: &NodeId,
        message: M,
        timeout_duration: Duration,
    ) -> NetworkResult<M::Response>
    where
        M: ServiceMessage,
    {
        let correlation_id = Uuid::new_v4();
        let payload = message.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending_requests.insert(correlation_id, tx);

        if let Err(e) = self
            .transport
            .send_envelope(target, &payload, M::message_type(), Some(correlation_id))
            .await
        {
            self.pending_requests.remove(&correlation_id);
            return Err(NetworkError::Transport(e));
        }

        let response_bytes = match timeout(timeout_duration, rx).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(_)) => {
                self.pending_requests.remove(&correlation_id);
                return Err(NetworkError::ChannelClosed(
                    "response channel closed".to_string(),
                ));
            }
            Err(_) => {
                self.pending_requests.remove(&correlation_id);
                return Err(NetworkError::Timeout(format!(
                    "request to {target} timed out after {timeout_duration:?}"
                )));
            }
        };

        M::Response::decode(&response_bytes)
    }

    /// Shut down the router loop and the transport
    pub async fn shutdown(&self) -> NetworkResult<()> {
        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        self.transport.shutdown().await?;

        // Unblock any caller still waiting on a reply
        self.pending_requests.clear();

        info!("Network manager stopped for node {}", self.local_node_id);
        Ok(())
    }

    fn route_envelope(
        envelope: TransportEnvelope,
        transport: &Arc<T>,
        pending: &Arc<DashMap<Uuid, oneshot::Sender<Bytes>>>,
        services: &Arc<DashMap<String, Arc<dyn ServiceHandler>>>,
        sinks: &Arc<DashMap<String, Arc<dyn SinkHandler>>>,
        tracker: &TaskTracker,
    ) {
        // A correlated envelope we issued ourselves is a reply; complete
        // the pending request. Anything else dispatches by message type.
        if let Some(correlation_id) = envelope.correlation_id
            && let Some((_, tx)) = pending.remove(&correlation_id)
        {
            let _ = tx.send(envelope.payload);
            return;
        }

        let ctx = ServiceContext {
            sender: envelope.sender.clone(),
            correlation_id: envelope.correlation_id,
        };

        if let Some(handler) = services.get(&envelope.message_type) {
            let handler = handler.clone();
            let transport = transport.clone();
            let message_type = envelope.message_type.clone();
            tracker.spawn(async move {
                let reply_to = ctx.sender.clone();
                let correlation_id = ctx.correlation_id;
                match handler.handle(envelope.payload, ctx).await {
                    Ok(response) => {
                        if let Err(e) = transport
                            .send_envelope(
                                &reply_to,
                                &response,
                                &response_type(&message_type),
                                correlation_id,
                            )
                            .await
                        {
                            warn!("Failed to send {} response: {}", message_type, e);
                        }
                    }
                    Err(e) => {
                        warn!("Service {} failed: {}", message_type, e);
                    }
                }
            });
            return;
        }

        if let Some(handler) = sinks.get(&envelope.message_type) {
            let handler = handler.clone();
            let message_type = envelope.message_type.clone();
            tracker.spawn(async move {
                if let Err(e) = handler.deliver(envelope.payload, ctx).await {
                    warn!("Sink {} failed: {}", message_type, e);
                }
            });
            return;
        }

        debug!("No handler for message type {}", envelope.message_type);
    }
}

impl<T, G> std::fmt::Debug for NetworkManager<T, G>
where
    T: Transport,
    G: TopologyAdaptor,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("local_node_id", &self.local_node_id)
            .finish_non_exhaustive()
    }
}
