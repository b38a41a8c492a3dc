//! Service trait definitions and type-erased handler plumbing

use crate::error::NetworkResult;
use crate::message::{NetworkMessage, ServiceMessage};
use async_trait::async_trait;
use bytes::Bytes;
use meshq_topology::NodeId;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

/// Context provided to service handlers
#[derive(Debug, Clone)]
pub struct ServiceContext {
    /// The node that sent the request
    pub sender: NodeId,
    /// Correlation ID if this is part of a request/response exchange
    pub correlation_id: Option<Uuid>,
}

/// Trait for request/response services
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// The request type this service handles
    type Request: ServiceMessage;

    /// Handle a request and return a response
    async fn handle(
        &self,
        request: Self::Request,
        ctx: ServiceContext,
    ) -> NetworkResult<<Self::Request as ServiceMessage>::Response>;
}

/// Trait for one-way message sinks (no response is sent)
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// The message type this sink consumes
    type Message: NetworkMessage;

    /// Consume one message
    async fn deliver(&self, message: Self::Message, ctx: ServiceContext) -> NetworkResult<()>;
}

type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Type-erased request/response handler
pub(crate) trait ServiceHandler: Send + Sync {
    fn handle(&self, payload: Bytes, ctx: ServiceContext) -> BoxedFuture<NetworkResult<Bytes>>;
}

/// Type-erased one-way handler
pub(crate) trait SinkHandler: Send + Sync {
    fn deliver(&self, payload: Bytes, ctx: ServiceContext) -> BoxedFuture<NetworkResult<()>>;
}

pub(crate) struct TypedServiceHandler<S: Service> {
    pub(crate) service: Arc<S>,
}

impl<S: Service> ServiceHandler for TypedServiceHandler<S> {
    fn handle(&self, payload: Bytes, ctx: ServiceContext) -> BoxedFuture<NetworkResult<Bytes>> {
        let service = self.service.clone();
        Box::pin(async move {
            let request = S::Request::decode(&payload)?;
            let response = service.handle(request, ctx).await?;
            response.encode()
        })
    }
}

pub(crate) struct TypedSinkHandler<S: MessageSink> {
    pub(crate) sink: Arc<S>,
}

impl<S: MessageSink> SinkHandler for TypedSinkHandler<S> {
    fn deliver(&self, payload: Bytes, ctx: ServiceContext) -> BoxedFuture<NetworkResult<()>> {
        let sink = self.sink.clone();
        Box::pin(async move {
            let message = S::Message::decode(&payload)?;
            sink.deliver(message, ctx).await
        })
    }
}
