//! Test doubles for the anycast protocol

use async_trait::async_trait;
use meshq_topology::NodeId;
use parking_lot::Mutex;

use crate::error::{EngineResult, Error};
use crate::services::anycast::messages::{BrowseData, BrowseEnd, BrowseGet, BrowseStatus};
use crate::services::anycast::service::AnycastWire;

/// One control message captured by a [`RecordingWire`]
#[derive(Debug, Clone)]
pub(crate) enum SentControl {
    Get(NodeId, BrowseGet),
    Data(NodeId, BrowseData),
    End(NodeId, BrowseEnd),
    Status(NodeId, BrowseStatus),
}

/// Wire that records every send instead of networking
#[derive(Debug, Default)]
pub(crate) struct RecordingWire {
    pub(crate) sent: Mutex<Vec<SentControl>>,
    pub(crate) fail_sends: Mutex<bool>,
}

impl RecordingWire {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail as if the peer were unreachable
    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        *self.fail_sends.lock() = unreachable;
    }

    pub(crate) fn sent(&self) -> Vec<SentControl> {
        self.sent.lock().clone()
    }

    fn record(&self, control: SentControl) -> EngineResult<()> {
        if *self.fail_sends.lock() {
            return Err(Error::unreachable("peer severed"));
        }
        self.sent.lock().push(control);
        Ok(())
    }
}

#[async_trait]
impl AnycastWire for RecordingWire {
    async fn send_browse_get(&self, to: &NodeId, msg: BrowseGet) -> EngineResult<()> {
        self.record(SentControl::Get(to.clone(), msg))
    }

    async fn send_browse_data(&self, to: &NodeId, msg: BrowseData) -> EngineResult<()> {
        self.record(SentControl::Data(to.clone(), msg))
    }

    async fn send_browse_end(&self, to: &NodeId, msg: BrowseEnd) -> EngineResult<()> {
        self.record(SentControl::End(to.clone(), msg))
    }

    async fn send_browse_status(&self, to: &NodeId, msg: BrowseStatus) -> EngineResult<()> {
        self.record(SentControl::Status(to.clone(), msg))
    }
}
