//! Requesting-side browse cursors
//!
//! A cursor issues sequence-numbered gets against the hosting node and
//! blocks its caller on a single-slot reply channel until the correlated
//! reply arrives or the per-request timeout elapses. Terminal states are
//! sticky: once closed or failed, a cursor never issues another round
//! trip. A request timeout is itself terminal.

use dashmap::DashMap;
use meshq_topology::NodeId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineResult, Error};
use crate::foundation::types::{BrowseId, DestinationName, GatheringTargetId, QueuedMessage};
use crate::services::anycast::lease::Lease;
use crate::services::anycast::messages::{
    BrowseData, BrowseEnd, BrowseEndReason, BrowseGet, BrowseStatus, BrowseStatusKind,
};
use crate::services::anycast::service::AnycastWire;

/// Events delivered from cursor keep-alive timers to the registry loop
#[derive(Debug, Clone)]
pub(crate) enum CursorEvent {
    KeepAlive(BrowseId),
}

/// Why a cursor failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureReason {
    Remote(BrowseEndReason),
    Timeout,
    Comms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorPhase {
    Open,
    Closed,
    Failed(FailureReason),
}

/// Reply deposited in the pending slot by the transport side
enum CursorReply {
    Item(QueuedMessage),
    End(BrowseEndReason),
}

struct CursorState {
    // Starts at -1; pre-incremented so its value during a request equals
    // the sequence number the hosting side must echo
    sequence_number: i64,
    pending: Option<oneshot::Sender<CursorReply>>,
    phase: CursorPhase,
}

/// One requesting-side browse cursor
pub struct BrowseCursor {
    target: NodeId,
    destination: DestinationName,
    gathering_target: Option<GatheringTargetId>,
    browse_id: BrowseId,
    filter: Option<String>,
    get_timeout: Duration,
    wire: Arc<dyn AnycastWire>,
    keep_alive: Lease<CursorEvent>,
    state: Mutex<CursorState>,
}

impl BrowseCursor {
    #[allow(clippy::too_many_arguments)]
    fn new(
        target: NodeId,
        destination: DestinationName,
        gathering_target: Option<GatheringTargetId>,
        browse_id: BrowseId,
        filter: Option<String>,
        get_timeout: Duration,
        liveness_interval: Duration,
        wire: Arc<dyn AnycastWire>,
        events_tx: flume::Sender<CursorEvent>,
    ) -> Self {
        let keep_alive = Lease::periodic(
            liveness_interval,
            events_tx,
            CursorEvent::KeepAlive(browse_id),
        );
        keep_alive.touch();
        Self {
            target,
            destination,
            gathering_target,
            browse_id,
            filter,
            get_timeout,
            wire,
            keep_alive,
            state: Mutex::new(CursorState {
                sequence_number: -1,
                pending: None,
                phase: CursorPhase::Open,
            }),
        }
    }

    /// The browse identity
    pub fn browse_id(&self) -> BrowseId {
        self.browse_id
    }

    /// The hosting node this cursor browses
    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// Whether the cursor can still issue requests
    pub fn is_open(&self) -> bool {
        self.state.lock().phase == CursorPhase::Open
    }

    /// Pull the next message from the hosting node
    ///
    /// Returns `Ok(None)` at end of data. Blocks the calling task until
    /// the correlated reply arrives or the per-request timeout elapses;
    /// the timeout leaves the cursor terminally failed.
    pub async fn next(&self) -> EngineResult<Option<QueuedMessage>> {
        let (sequence_number, filter, rx) = {
            let mut state = self.state.lock();
            match state.phase {
                CursorPhase::Closed => return Ok(None),
                CursorPhase::Failed(reason) => return Err(self.failure_error(reason)),
                CursorPhase::Open => {}
            }
            if state.pending.is_some() {
                return Err(Error::invalid_state(format!(
                    "{} already has a request in flight",
                    self.browse_id
                )));
            }

            self.keep_alive.cancel();
            state.sequence_number += 1;
            let sequence_number = state.sequence_number as u64;
            // The filter establishes hosting-side state once, on the
            // session-opening request
            let filter = if sequence_number == 0 {
                self.filter.clone()
            } else {
                None
            };
            let (tx, rx) = oneshot::channel();
            state.pending = Some(tx);
            (sequence_number, filter, rx)
        };

        let get = BrowseGet {
            destination: self.destination.clone(),
            gathering_target: self.gathering_target,
            browse_id: self.browse_id,
            sequence_number,
            filter,
        };
        if let Err(e) = self.wire.send_browse_get(&self.target, get).await {
            let mut state = self.state.lock();
            state.pending = None;
            state.phase = CursorPhase::Failed(FailureReason::Comms);
            return Err(Error::unreachable(format!(
                "browse of {} on {} failed to send: {}",
                self.destination, self.target, e
            )));
        }

        match tokio::time::timeout(self.get_timeout, rx).await {
            Ok(Ok(CursorReply::Item(message))) => {
                self.keep_alive.touch();
                Ok(Some(message))
            }
            Ok(Ok(CursorReply::End(BrowseEndReason::Ok))) => Ok(None),
            Ok(Ok(CursorReply::End(reason))) => {
                Err(self.failure_error(FailureReason::Remote(reason)))
            }
            Ok(Err(_)) => {
                // Pending sender dropped without a reply; read the phase
                // the dropper left behind
                let phase = self.state.lock().phase;
                match phase {
                    CursorPhase::Closed => Ok(None),
                    CursorPhase::Failed(reason) => Err(self.failure_error(reason)),
                    CursorPhase::Open => Err(Error::invalid_state(format!(
                        "{} reply slot abandoned",
                        self.browse_id
                    ))),
                }
            }
            Err(_) => {
                let mut state = self.state.lock();
                state.pending = None;
                state.phase = CursorPhase::Failed(FailureReason::Timeout);
                Err(Error::timeout(format!(
                    "browse of {} on {} got no reply within {:?}",
                    self.destination, self.target, self.get_timeout
                )))
            }
        }
    }

    /// Deliver a reply item from the transport side
    ///
    /// A reply whose sequence number does not match the current request is
    /// stale or misordered: the item is discarded and the cursor fails.
    pub fn put(&self, sequence_number: u64, message: QueuedMessage) {
        let mut state = self.state.lock();
        if state.phase != CursorPhase::Open {
            debug!("{} dropping reply after close", self.browse_id);
            return;
        }
        if state.sequence_number < 0 || sequence_number != state.sequence_number as u64 {
            warn!(
                "{} reply out of order: got {}, current {}",
                self.browse_id, sequence_number, state.sequence_number
            );
            state.phase = CursorPhase::Failed(FailureReason::Remote(BrowseEndReason::OutOfOrder));
            self.keep_alive.cancel();
            if let Some(tx) = state.pending.take() {
                let _ = tx.send(CursorReply::End(BrowseEndReason::OutOfOrder));
            }
            return;
        }
        match state.pending.take() {
            Some(tx) => {
                let _ = tx.send(CursorReply::Item(message));
            }
            None => {
                // Caller gave up on this request already
                debug!("{} dropping reply with no waiter", self.browse_id);
            }
        }
    }

    /// Deliver a hosting-side end-of-browse
    pub fn end_browse(&self, reason: BrowseEndReason) {
        let mut state = self.state.lock();
        if state.phase != CursorPhase::Open {
            return;
        }
        state.phase = match reason {
            BrowseEndReason::Ok => CursorPhase::Closed,
            other => CursorPhase::Failed(FailureReason::Remote(other)),
        };
        self.keep_alive.cancel();
        if let Some(tx) = state.pending.take() {
            let _ = tx.send(CursorReply::End(reason));
        }
    }

    /// Finish the browse from the requesting side; idempotent
    ///
    /// Wakes any blocked caller with end-of-data and tells the hosting
    /// side to drop its session. The cursor is closed even when the close
    /// notification cannot be delivered; that failure is returned so
    /// best-effort cleanup can still surface it.
    pub async fn finished(&self) -> EngineResult<()> {
        if !self.abandon() {
            return Ok(());
        }

        let status = BrowseStatus {
            gathering_target: self.gathering_target,
            browse_id: self.browse_id,
            status: BrowseStatusKind::Close,
        };
        self.wire.send_browse_status(&self.target, status).await
    }

    /// Close the cursor locally without notifying the hosting side
    ///
    /// Used when the hosting node is assumed gone; returns whether the
    /// cursor was still open.
    pub fn abandon(&self) -> bool {
        let mut state = self.state.lock();
        let was_open = state.phase == CursorPhase::Open;
        if was_open {
            state.phase = CursorPhase::Closed;
            if let Some(tx) = state.pending.take() {
                let _ = tx.send(CursorReply::End(BrowseEndReason::Ok));
            }
        }
        self.keep_alive.cancel();
        was_open
    }

    /// Send one liveness ping so the hosting side's lease is renewed
    pub(crate) async fn ping(&self) {
        if !self.is_open() {
            return;
        }
        let status = BrowseStatus {
            gathering_target: self.gathering_target,
            browse_id: self.browse_id,
            status: BrowseStatusKind::Alive,
        };
        if let Err(e) = self.wire.send_browse_status(&self.target, status).await {
            debug!("{} liveness ping failed: {}", self.browse_id, e);
        }
    }

    fn failure_error(&self, reason: FailureReason) -> Error {
        match reason {
            FailureReason::Remote(BrowseEndReason::OutOfOrder) => Error::protocol(format!(
                "browse of {} on {} ended: {}",
                self.destination,
                self.target,
                BrowseEndReason::OutOfOrder
            )),
            FailureReason::Remote(BrowseEndReason::StoreException) => Error::storage(format!(
                "browse of {} on {} ended: {}",
                self.destination,
                self.target,
                BrowseEndReason::StoreException
            )),
            FailureReason::Remote(BrowseEndReason::BadFilter) => Error::invalid_filter(format!(
                "browse of {} on {} ended: {}",
                self.destination,
                self.target,
                BrowseEndReason::BadFilter
            )),
            FailureReason::Remote(BrowseEndReason::Ok) => {
                Error::invalid_state(format!("browse of {} closed", self.destination))
            }
            FailureReason::Timeout => Error::timeout(format!(
                "browse of {} on {} timed out",
                self.destination, self.target
            )),
            FailureReason::Comms => Error::unreachable(format!(
                "browse of {} on {} lost its peer",
                self.destination, self.target
            )),
        }
    }
}

impl std::fmt::Debug for BrowseCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowseCursor")
            .field("browse_id", &self.browse_id)
            .field("target", &self.target)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

/// All live requesting-side cursors on this node, keyed by browse ID
///
/// The browse ID suffices as the key: IDs are unique relative to this
/// node, which issues them.
pub struct BrowseCursorRegistry {
    cursors: DashMap<BrowseId, Arc<BrowseCursor>>,
    wire: Arc<dyn AnycastWire>,
    get_timeout: Duration,
    liveness_interval: Duration,
    next_browse_id: AtomicU64,
    events_tx: flume::Sender<CursorEvent>,
    events_rx: Mutex<Option<flume::Receiver<CursorEvent>>>,
    cancellation: CancellationToken,
}

impl BrowseCursorRegistry {
    /// Create a registry
    pub fn new(
        wire: Arc<dyn AnycastWire>,
        get_timeout: Duration,
        liveness_interval: Duration,
    ) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            cursors: DashMap::new(),
            wire,
            get_timeout,
            liveness_interval,
            next_browse_id: AtomicU64::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancellation: CancellationToken::new(),
        }
    }

    /// Start the keep-alive loop
    pub fn start(self: &Arc<Self>) {
        let registry = self.clone();
        let events_rx = self
            .events_rx
            .lock()
            .take()
            .expect("cursor registry started twice");
        let cancellation = self.cancellation.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events_rx.recv_async() => {
                        match event {
                            Ok(CursorEvent::KeepAlive(browse_id)) => {
                                let cursor =
                                    registry.cursors.get(&browse_id).map(|e| e.value().clone());
                                if let Some(cursor) = cursor {
                                    cursor.ping().await;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    _ = cancellation.cancelled() => break,
                }
            }
        });
    }

    /// Open a new browse against a hosting node
    pub fn open(
        &self,
        target: NodeId,
        destination: DestinationName,
        gathering_target: Option<GatheringTargetId>,
        filter: Option<String>,
    ) -> Arc<BrowseCursor> {
        let browse_id = BrowseId::new(self.next_browse_id.fetch_add(1, Ordering::Relaxed));
        let cursor = Arc::new(BrowseCursor::new(
            target,
            destination,
            gathering_target,
            browse_id,
            filter,
            self.get_timeout,
            self.liveness_interval,
            self.wire.clone(),
            self.events_tx.clone(),
        ));
        self.cursors.insert(browse_id, cursor.clone());
        cursor
    }

    /// Deliver incoming browse data to its cursor
    ///
    /// Data for an unknown cursor (for example after recovery) is dropped.
    pub fn deliver_data(&self, msg: BrowseData) {
        match self.cursors.get(&msg.browse_id).map(|e| e.value().clone()) {
            Some(cursor) => cursor.put(msg.sequence_number, msg.message),
            None => debug!("Dropping browse data for unknown {}", msg.browse_id),
        }
    }

    /// Deliver an incoming end-of-browse to its cursor
    pub fn deliver_end(&self, msg: BrowseEnd) {
        match self.cursors.get(&msg.browse_id).map(|e| e.value().clone()) {
            Some(cursor) => cursor.end_browse(msg.reason),
            None => debug!("Dropping browse end for unknown {}", msg.browse_id),
        }
    }

    /// Finish one browse and drop it from the registry
    pub async fn finish(&self, browse_id: BrowseId) -> EngineResult<()> {
        match self.cursors.remove(&browse_id) {
            Some((_, cursor)) => cursor.finished().await,
            None => Ok(()),
        }
    }

    /// Drop one browse without notifying the hosting side
    pub fn discard(&self, browse_id: BrowseId) {
        if let Some((_, cursor)) = self.cursors.remove(&browse_id) {
            cursor.abandon();
        }
    }

    /// Finish every live browse (engine shutdown)
    pub async fn finish_all(&self) {
        let ids: Vec<BrowseId> = self.cursors.iter().map(|e| *e.key()).collect();
        for browse_id in ids {
            if let Err(e) = self.finish(browse_id).await {
                debug!("Close notification for {} failed: {}", browse_id, e);
            }
        }
        self.cancellation.cancel();
    }

    /// Number of live cursors
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    /// Whether any cursor is live
    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

impl std::fmt::Debug for BrowseCursorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowseCursorRegistry")
            .field("cursors", &self.cursors.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::services::anycast::testing::{RecordingWire, SentControl};

    fn registry(
        wire: &Arc<RecordingWire>,
        get_timeout: Duration,
        liveness: Duration,
    ) -> Arc<BrowseCursorRegistry> {
        let registry = Arc::new(BrowseCursorRegistry::new(
            wire.clone() as Arc<dyn AnycastWire>,
            get_timeout,
            liveness,
        ));
        registry.start();
        registry
    }

    fn open(registry: &Arc<BrowseCursorRegistry>, filter: Option<&str>) -> Arc<BrowseCursor> {
        registry.open(
            NodeId::from_seed(7),
            DestinationName::from("orders"),
            None,
            filter.map(str::to_string),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    fn sent_gets(wire: &RecordingWire) -> Vec<BrowseGet> {
        wire.sent()
            .into_iter()
            .filter_map(|c| match c {
                SentControl::Get(_, get) => Some(get),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn filter_travels_only_on_the_first_request() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry(&wire, Duration::from_secs(5), Duration::from_secs(60));
        let cursor = open(&registry, Some("color=red"));

        let pull = {
            let cursor = cursor.clone();
            tokio::spawn(async move { cursor.next().await })
        };
        settle().await;
        cursor.put(0, QueuedMessage::new(b"a".as_slice()));
        assert!(pull.await.unwrap().unwrap().is_some());

        let pull = {
            let cursor = cursor.clone();
            tokio::spawn(async move { cursor.next().await })
        };
        settle().await;
        cursor.put(1, QueuedMessage::new(b"b".as_slice()));
        assert!(pull.await.unwrap().unwrap().is_some());

        let gets = sent_gets(&wire);
        assert_eq!(gets.len(), 2);
        assert_eq!(gets[0].sequence_number, 0);
        assert_eq!(gets[0].filter.as_deref(), Some("color=red"));
        assert_eq!(gets[1].sequence_number, 1);
        assert!(gets[1].filter.is_none());
    }

    #[tokio::test]
    async fn stale_reply_is_discarded_and_fails_the_cursor() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry(&wire, Duration::from_secs(5), Duration::from_secs(60));
        let cursor = open(&registry, None);

        let pull = {
            let cursor = cursor.clone();
            tokio::spawn(async move { cursor.next().await })
        };
        settle().await;
        cursor.put(3, QueuedMessage::new(b"stale".as_slice()));

        let err = pull.await.unwrap().unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Protocol);

        // Terminal: no further round trip is attempted
        let before = sent_gets(&wire).len();
        let err = cursor.next().await.unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Protocol);
        assert_eq!(sent_gets(&wire).len(), before);
    }

    #[tokio::test]
    async fn end_of_data_is_not_an_error_and_sticks() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry(&wire, Duration::from_secs(5), Duration::from_secs(60));
        let cursor = open(&registry, None);

        let pull = {
            let cursor = cursor.clone();
            tokio::spawn(async move { cursor.next().await })
        };
        settle().await;
        cursor.end_browse(BrowseEndReason::Ok);
        assert!(pull.await.unwrap().unwrap().is_none());

        let before = sent_gets(&wire).len();
        assert!(cursor.next().await.unwrap().is_none());
        assert_eq!(sent_gets(&wire).len(), before);
    }

    #[tokio::test]
    async fn remote_failure_reasons_are_distinguishable() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry(&wire, Duration::from_secs(5), Duration::from_secs(60));

        let cursor = open(&registry, None);
        let pull = {
            let cursor = cursor.clone();
            tokio::spawn(async move { cursor.next().await })
        };
        settle().await;
        cursor.end_browse(BrowseEndReason::StoreException);
        let err = pull.await.unwrap().unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Storage);

        let cursor = open(&registry, None);
        let pull = {
            let cursor = cursor.clone();
            tokio::spawn(async move { cursor.next().await })
        };
        settle().await;
        cursor.end_browse(BrowseEndReason::BadFilter);
        let err = pull.await.unwrap().unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::InvalidFilter);
    }

    #[tokio::test]
    async fn request_timeout_is_terminal() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry(&wire, Duration::from_millis(30), Duration::from_secs(60));
        let cursor = open(&registry, None);

        let err = cursor.next().await.unwrap_err();
        assert!(err.is_timeout());

        let before = sent_gets(&wire).len();
        let err = cursor.next().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(sent_gets(&wire).len(), before);
    }

    #[tokio::test]
    async fn unreachable_peer_fails_the_cursor() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry(&wire, Duration::from_secs(5), Duration::from_secs(60));
        let cursor = open(&registry, None);

        wire.set_unreachable(true);
        let err = cursor.next().await.unwrap_err();
        assert!(err.is_unreachable());
        assert!(!cursor.is_open());
    }

    #[tokio::test]
    async fn finished_is_idempotent_and_wakes_a_blocked_caller() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry(&wire, Duration::from_secs(5), Duration::from_secs(60));
        let cursor = open(&registry, None);

        let pull = {
            let cursor = cursor.clone();
            tokio::spawn(async move { cursor.next().await })
        };
        settle().await;

        registry.finish(cursor.browse_id()).await.unwrap();
        assert!(pull.await.unwrap().unwrap().is_none());
        assert!(registry.is_empty());

        cursor.finished().await;
        let closes = wire
            .sent()
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    SentControl::Status(
                        _,
                        BrowseStatus {
                            status: BrowseStatusKind::Close,
                            ..
                        }
                    )
                )
            })
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn idle_cursor_pings_the_hosting_side() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry(&wire, Duration::from_secs(5), Duration::from_millis(20));
        let cursor = open(&registry, None);

        tokio::time::sleep(Duration::from_millis(90)).await;
        let alives = wire
            .sent()
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    SentControl::Status(
                        _,
                        BrowseStatus {
                            status: BrowseStatusKind::Alive,
                            ..
                        }
                    )
                )
            })
            .count();
        assert!(alives >= 2, "expected repeated pings, got {alives}");

        registry.finish(cursor.browse_id()).await.unwrap();
        let after_close = wire.sent().len();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(wire.sent().len(), after_close);
    }
}
