//! Test doubles for the gathering consumer

use async_trait::async_trait;
use meshq_topology::NodeId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineResult;
use crate::foundation::traits::PartitionConsumer;
use crate::foundation::types::{
    BrowseId, DestinationName, GatheringTargetId, QueuedMessage, WaitTimeout,
};
use crate::services::anycast::cursor::{BrowseCursor, BrowseCursorRegistry};
use crate::services::anycast::messages::ConsumerCreate;
use crate::services::anycast::service::{AnycastWire, RemoteConsumerAccess};
use crate::services::anycast::testing::RecordingWire;

/// Scripted local consumer backed by a queue of messages
pub(crate) struct ScriptedConsumer {
    pub(crate) messages: Mutex<VecDeque<QueuedMessage>>,
    pub(crate) wait_response: WaitTimeout,
}

impl ScriptedConsumer {
    pub(crate) fn with_messages(payloads: &[&str]) -> Box<Self> {
        Box::new(Self {
            messages: Mutex::new(
                payloads
                    .iter()
                    .map(|p| QueuedMessage::new(p.as_bytes().to_vec()))
                    .collect(),
            ),
            wait_response: WaitTimeout::NoWait,
        })
    }

    pub(crate) fn with_wait_response(wait_response: WaitTimeout) -> Box<Self> {
        Box::new(Self {
            messages: Mutex::new(VecDeque::new()),
            wait_response,
        })
    }
}

impl PartitionConsumer for ScriptedConsumer {
    fn pull_next(&mut self) -> EngineResult<Option<QueuedMessage>> {
        Ok(self.messages.lock().pop_front())
    }

    fn waiting(&mut self, _timeout: WaitTimeout, _modify: bool) -> WaitTimeout {
        self.wait_response
    }

    fn ready(&mut self) {}

    fn not_ready(&mut self) {}

    fn start(&mut self) {}

    fn stop(&mut self) {}

    fn detach(&mut self) -> EngineResult<()> {
        Ok(())
    }
}

/// Remote access backed by a real cursor registry over a recording wire
pub(crate) struct MockRemoteAccess {
    pub(crate) wire: Arc<RecordingWire>,
    pub(crate) cursors: Arc<BrowseCursorRegistry>,
    pub(crate) attach_calls: Mutex<Vec<NodeId>>,
    pub(crate) attach_results: Mutex<VecDeque<EngineResult<()>>>,
    pub(crate) connect_calls: Mutex<Vec<NodeId>>,
    pub(crate) connect_results: Mutex<VecDeque<EngineResult<()>>>,
}

impl MockRemoteAccess {
    pub(crate) fn new(get_timeout: Duration) -> Arc<Self> {
        let wire = Arc::new(RecordingWire::new());
        let cursors = Arc::new(BrowseCursorRegistry::new(
            wire.clone() as Arc<dyn AnycastWire>,
            get_timeout,
            Duration::from_secs(60),
        ));
        cursors.start();
        Arc::new(Self {
            wire,
            cursors,
            attach_calls: Mutex::new(Vec::new()),
            attach_results: Mutex::new(VecDeque::new()),
            connect_calls: Mutex::new(Vec::new()),
            connect_results: Mutex::new(VecDeque::new()),
        })
    }

    pub(crate) fn script_attach(&self, result: EngineResult<()>) {
        self.attach_results.lock().push_back(result);
    }

    pub(crate) fn attach_call_count(&self) -> usize {
        self.attach_calls.lock().len()
    }
}

#[async_trait]
impl RemoteConsumerAccess for MockRemoteAccess {
    async fn attach_consumer(&self, node: &NodeId, _create: ConsumerCreate) -> EngineResult<()> {
        self.attach_calls.lock().push(node.clone());
        self.attach_results.lock().pop_front().unwrap_or(Ok(()))
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
        self.connect_calls.lock().push(node.clone());
        self.connect_results.lock().pop_front().unwrap_or(Ok(()))
    }
}
