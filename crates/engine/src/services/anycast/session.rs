//! Hosting-side browse sessions
//!
//! A session is created when a remote node first requests a browse of a
//! local partition (sequence 0) and owns the underlying local cursor
//! exclusively until it closes. The protocol allows at most one request in
//! flight per browse, so a sequence mismatch means state was lost on one
//! side and is always fatal to the session.

use dashmap::DashMap;
use meshq_topology::NodeId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::foundation::destinations::DestinationRegistry;
use crate::foundation::traits::MessageCursor;
use crate::foundation::types::{BrowseId, GatheringTargetId, MessageFilter};
use crate::services::anycast::lease::Lease;
use crate::services::anycast::messages::{
    BrowseData, BrowseEnd, BrowseEndReason, BrowseGet, BrowseStatus, BrowseStatusKind,
};
use crate::services::anycast::service::AnycastWire;

/// Identity of one hosting-side browse session
///
/// Keys are equal when node and browse IDs are equal and the gathering
/// targets are either both unset or equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrowseSessionKey {
    /// The requesting node
    pub remote_node: NodeId,
    /// Gathering scope of the browse, if any
    pub gathering_target: Option<GatheringTargetId>,
    /// Browse identity, unique relative to the requesting node
    pub browse_id: BrowseId,
}

/// Events delivered from session lease timers to the registry loop
#[derive(Debug, Clone)]
pub(crate) enum SessionEvent {
    LeaseExpired(BrowseSessionKey),
}

/// What one pull decided, computed under the session lock and sent after
enum PullOutcome {
    AlreadyClosed,
    Item(BrowseData),
    End(BrowseEndReason),
}

struct SessionInner {
    cursor: Option<Box<dyn MessageCursor>>,
    expected_sequence_number: u64,
    closed: bool,
}

/// One hosting-side browse session
pub struct BrowseSession {
    key: BrowseSessionKey,
    wire: Arc<dyn AnycastWire>,
    lease: Lease<SessionEvent>,
    inner: Mutex<SessionInner>,
}

impl BrowseSession {
    /// Create a session owning the given cursor, with its lease armed
    pub fn new(
        key: BrowseSessionKey,
        cursor: Box<dyn MessageCursor>,
        wire: Arc<dyn AnycastWire>,
        expiry: Duration,
        events_tx: flume::Sender<SessionEvent>,
    ) -> Self {
        let lease = Lease::one_shot(expiry, events_tx, SessionEvent::LeaseExpired(key.clone()));
        lease.touch();
        Self {
            key,
            wire,
            lease,
            inner: Mutex::new(SessionInner {
                cursor: Some(cursor),
                expected_sequence_number: 0,
                closed: false,
            }),
        }
    }

    /// The session's identity
    pub fn key(&self) -> &BrowseSessionKey {
        &self.key
    }

    /// Serve one pull; returns `true` when the session closed
    ///
    /// Lease renewal is a side effect of any protocol activity, not just
    /// successful pulls.
    pub async fn pull_next(&self, sequence_number: u64) -> bool {
        self.lease.touch();

        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                PullOutcome::AlreadyClosed
            } else if sequence_number != inner.expected_sequence_number {
                // Client retried, duplicated, or one side restarted; the
                // protocol allows one request in flight, so state is gone.
                warn!(
                    "Browse {} out of order: got {}, expected {}",
                    self.key.browse_id, sequence_number, inner.expected_sequence_number
                );
                Self::close_inner(&mut inner, &self.lease);
                PullOutcome::End(BrowseEndReason::OutOfOrder)
            } else {
                let pulled = inner
                    .cursor
                    .as_mut()
                    .map(|cursor| cursor.next())
                    .unwrap_or(Ok(None));
                match pulled {
                    Ok(Some(message)) => {
                        let data = BrowseData {
                            browse_id: self.key.browse_id,
                            sequence_number: inner.expected_sequence_number,
                            message,
                        };
                        inner.expected_sequence_number += 1;
                        PullOutcome::Item(data)
                    }
                    Ok(None) => {
                        Self::close_inner(&mut inner, &self.lease);
                        PullOutcome::End(BrowseEndReason::Ok)
                    }
                    Err(e) => {
                        warn!("Browse {} store failure: {}", self.key.browse_id, e);
                        Self::close_inner(&mut inner, &self.lease);
                        PullOutcome::End(BrowseEndReason::StoreException)
                    }
                }
            }
        };

        match outcome {
            PullOutcome::AlreadyClosed => true,
            PullOutcome::Item(data) => {
                if let Err(e) = self.wire.send_browse_data(&self.key.remote_node, data).await {
                    debug!("Failed to send browse data to {}: {}", self.key.remote_node, e);
                }
                false
            }
            PullOutcome::End(reason) => {
                let end = BrowseEnd {
                    browse_id: self.key.browse_id,
                    reason,
                };
                if let Err(e) = self.wire.send_browse_end(&self.key.remote_node, end).await {
                    debug!("Failed to send browse end to {}: {}", self.key.remote_node, e);
                }
                true
            }
        }
    }

    /// Renew the lease on a liveness ping
    pub fn keep_alive(&self) {
        if !self.inner.lock().closed {
            self.lease.touch();
        }
    }

    /// Close the session; idempotent, releases the cursor exactly once
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        Self::close_inner(&mut inner, &self.lease);
    }

    /// Whether the session has closed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn close_inner(inner: &mut SessionInner, lease: &Lease<SessionEvent>) {
        if inner.closed {
            return;
        }
        inner.closed = true;
        if let Some(mut cursor) = inner.cursor.take() {
            cursor.release();
        }
        lease.cancel();
    }
}

/// All live hosting-side browse sessions on this node
pub struct BrowseSessionRegistry {
    sessions: DashMap<BrowseSessionKey, Arc<BrowseSession>>,
    destinations: Arc<DestinationRegistry>,
    wire: Arc<dyn AnycastWire>,
    expiry: Duration,
    events_tx: flume::Sender<SessionEvent>,
    events_rx: Mutex<Option<flume::Receiver<SessionEvent>>>,
    cancellation: CancellationToken,
}

impl BrowseSessionRegistry {
    /// Create a registry serving the given destinations
    pub fn new(
        destinations: Arc<DestinationRegistry>,
        wire: Arc<dyn AnycastWire>,
        expiry: Duration,
    ) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            sessions: DashMap::new(),
            destinations,
            wire,
            expiry,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancellation: CancellationToken::new(),
        }
    }

    /// Start the lease-expiry loop
    pub fn start(self: &Arc<Self>) {
        let registry = self.clone();
        let events_rx = self
            .events_rx
            .lock()
            .take()
            .expect("session registry started twice");
        let cancellation = self.cancellation.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events_rx.recv_async() => {
                        match event {
                            Ok(SessionEvent::LeaseExpired(key)) => registry.expire(&key),
                            Err(_) => break,
                        }
                    }
                    _ = cancellation.cancelled() => break,
                }
            }
        });
    }

    /// Handle one `BrowseGet` from a remote node
    pub async fn handle_browse_get(&self, sender: NodeId, msg: BrowseGet) {
        let key = BrowseSessionKey {
            remote_node: sender,
            gathering_target: msg.gathering_target,
            browse_id: msg.browse_id,
        };

        if let Some(session) = self.sessions.get(&key).map(|e| e.value().clone()) {
            if session.pull_next(msg.sequence_number).await {
                self.sessions.remove(&key);
            }
            return;
        }

        if msg.sequence_number != 0 {
            // Not a session start: the session was reaped or never existed.
            // Reject rather than silently recreating it.
            self.send_end(&key, BrowseEndReason::OutOfOrder).await;
            return;
        }

        let session = match self.create_session(&key, &msg) {
            Ok(session) => session,
            Err(reason) => {
                self.send_end(&key, reason).await;
                return;
            }
        };

        if let Some(previous) = self.sessions.insert(key.clone(), session.clone()) {
            // Two session starts collided on the same identity; the newer
            // one wins and the stale session gives up its cursor.
            warn!("Duplicate browse session for {:?}", key);
            previous.close();
        }

        if session.pull_next(msg.sequence_number).await {
            self.sessions.remove(&key);
        }
    }

    /// Handle one `BrowseStatus` from a remote node
    pub fn handle_browse_status(&self, sender: NodeId, msg: BrowseStatus) {
        let key = BrowseSessionKey {
            remote_node: sender,
            gathering_target: msg.gathering_target,
            browse_id: msg.browse_id,
        };

        match msg.status {
            BrowseStatusKind::Close => {
                if let Some((_, session)) = self.sessions.remove(&key) {
                    session.close();
                }
            }
            BrowseStatusKind::Alive => {
                if let Some(session) = self.sessions.get(&key) {
                    session.keep_alive();
                }
                // Unknown session: ignore the status message
            }
        }
    }

    /// Close every live session (engine shutdown)
    pub fn close_all(&self) {
        let keys: Vec<BrowseSessionKey> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, session)) = self.sessions.remove(&key) {
                session.close();
            }
        }
        self.cancellation.cancel();
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether any session is live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn create_session(
        &self,
        key: &BrowseSessionKey,
        msg: &BrowseGet,
    ) -> Result<Arc<BrowseSession>, BrowseEndReason> {
        let Some(partition) = self.destinations.get(&msg.destination) else {
            debug!("Browse for unknown destination {}", msg.destination);
            return Err(BrowseEndReason::StoreException);
        };

        let filter = match msg.filter.as_deref() {
            None => None,
            Some(selector) => match MessageFilter::parse(selector) {
                Ok(filter) => Some(filter),
                Err(e) => {
                    debug!("Browse filter rejected: {}", e);
                    return Err(BrowseEndReason::BadFilter);
                }
            },
        };

        // A gathering-scoped session consumes on behalf of a remote
        // consumer; a plain browse must leave the partition untouched
        let cursor = if key.gathering_target.is_some() {
            partition.consuming_cursor(filter.as_ref())
        } else {
            partition.browse_cursor(filter.as_ref())
        }
        .map_err(|_| BrowseEndReason::StoreException)?;

        Ok(Arc::new(BrowseSession::new(
            key.clone(),
            cursor,
            self.wire.clone(),
            self.expiry,
            self.events_tx.clone(),
        )))
    }

    async fn send_end(&self, key: &BrowseSessionKey, reason: BrowseEndReason) {
        let end = BrowseEnd {
            browse_id: key.browse_id,
            reason,
        };
        if let Err(e) = self.wire.send_browse_end(&key.remote_node, end).await {
            debug!("Failed to send browse end to {}: {}", key.remote_node, e);
        }
    }

    fn expire(&self, key: &BrowseSessionKey) {
        if let Some((_, session)) = self.sessions.remove(key) {
            debug!("Browse session {:?} expired with no activity", key);
            session.close();
        }
    }
}

impl std::fmt::Debug for BrowseSessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowseSessionRegistry")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineResult;
    use crate::foundation::memory::MemoryPartition;
    use crate::foundation::types::{DestinationName, QueuedMessage};
    use crate::services::anycast::testing::{RecordingWire, SentControl};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry_with_messages(
        wire: Arc<RecordingWire>,
        expiry: Duration,
        messages: usize,
    ) -> Arc<BrowseSessionRegistry> {
        let destinations = Arc::new(DestinationRegistry::new());
        let partition = Arc::new(MemoryPartition::new(DestinationName::from("orders")));
        for i in 0..messages {
            partition.enqueue(QueuedMessage::new(format!("m{i}").into_bytes()));
        }
        destinations.register(partition);

        let registry = Arc::new(BrowseSessionRegistry::new(destinations, wire, expiry));
        registry.start();
        registry
    }

    fn get(browse_id: u64, sequence_number: u64) -> BrowseGet {
        BrowseGet {
            destination: DestinationName::from("orders"),
            gathering_target: None,
            browse_id: BrowseId::new(browse_id),
            sequence_number,
            filter: None,
        }
    }

    #[tokio::test]
    async fn pulls_echo_a_gapless_sequence_from_zero() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry_with_messages(wire.clone(), Duration::from_secs(60), 3);
        let remote = NodeId::from_seed(9);

        for seq in 0..3 {
            registry.handle_browse_get(remote.clone(), get(1, seq)).await;
        }
        registry.handle_browse_get(remote.clone(), get(1, 3)).await;

        let sent = wire.sent();
        assert_eq!(sent.len(), 4);
        for (i, control) in sent.iter().take(3).enumerate() {
            match control {
                SentControl::Data(to, data) => {
                    assert_eq!(to, &remote);
                    assert_eq!(data.sequence_number, i as u64);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        match &sent[3] {
            SentControl::End(_, end) => assert_eq!(end.reason, BrowseEndReason::Ok),
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn duplicate_retransmit_is_rejected_and_closes_the_session() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry_with_messages(wire.clone(), Duration::from_secs(60), 5);
        let remote = NodeId::from_seed(9);

        registry.handle_browse_get(remote.clone(), get(1, 0)).await;
        registry.handle_browse_get(remote.clone(), get(1, 1)).await;
        // Retransmit of an already-served position
        registry.handle_browse_get(remote.clone(), get(1, 0)).await;

        match wire.sent().last().unwrap() {
            SentControl::End(_, end) => assert_eq!(end.reason, BrowseEndReason::OutOfOrder),
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn nonzero_sequence_without_a_session_is_rejected_not_created() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry_with_messages(wire.clone(), Duration::from_secs(60), 5);

        registry
            .handle_browse_get(NodeId::from_seed(9), get(1, 4))
            .await;

        match wire.sent().last().unwrap() {
            SentControl::End(_, end) => assert_eq!(end.reason, BrowseEndReason::OutOfOrder),
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn bad_filter_and_unknown_destination_answer_distinct_reasons() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry_with_messages(wire.clone(), Duration::from_secs(60), 1);
        let remote = NodeId::from_seed(9);

        let mut bad_filter = get(1, 0);
        bad_filter.filter = Some("not a selector".to_string());
        registry.handle_browse_get(remote.clone(), bad_filter).await;

        let mut unknown = get(2, 0);
        unknown.destination = DestinationName::from("missing");
        registry.handle_browse_get(remote, unknown).await;

        let sent = wire.sent();
        match &sent[0] {
            SentControl::End(_, end) => assert_eq!(end.reason, BrowseEndReason::BadFilter),
            other => panic!("unexpected {other:?}"),
        }
        match &sent[1] {
            SentControl::End(_, end) => assert_eq!(end.reason, BrowseEndReason::StoreException),
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry.is_empty());
    }

    struct CountingCursor {
        releases: Arc<AtomicUsize>,
    }

    impl MessageCursor for CountingCursor {
        fn next(&mut self) -> EngineResult<Option<QueuedMessage>> {
            Ok(Some(QueuedMessage::new(b"m".as_slice())))
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_the_cursor_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let (events_tx, _events_rx) = flume::unbounded();
        let session = BrowseSession::new(
            BrowseSessionKey {
                remote_node: NodeId::from_seed(9),
                gathering_target: None,
                browse_id: BrowseId::new(1),
            },
            Box::new(CountingCursor {
                releases: releases.clone(),
            }),
            Arc::new(RecordingWire::new()),
            Duration::from_secs(60),
            events_tx,
        );

        session.close();
        session.close();
        assert!(session.is_closed());
        assert_eq!(releases.load(Ordering::SeqCst), 1);

        // A pull racing the close sends nothing and reports closed
        assert!(session.pull_next(0).await);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_session_is_reaped_by_its_lease_and_not_recreated() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry_with_messages(wire.clone(), Duration::from_millis(40), 5);
        let remote = NodeId::from_seed(9);

        registry.handle_browse_get(remote.clone(), get(1, 0)).await;
        assert_eq!(registry.len(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(registry.is_empty());

        // The reaped browse cannot be resumed mid-sequence
        registry.handle_browse_get(remote, get(1, 1)).await;
        match wire.sent().last().unwrap() {
            SentControl::End(_, end) => assert_eq!(end.reason, BrowseEndReason::OutOfOrder),
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn liveness_pings_keep_an_idle_session_alive() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry_with_messages(wire.clone(), Duration::from_millis(80), 5);
        let remote = NodeId::from_seed(9);

        registry.handle_browse_get(remote.clone(), get(1, 0)).await;

        let alive = BrowseStatus {
            gathering_target: None,
            browse_id: BrowseId::new(1),
            status: BrowseStatusKind::Alive,
        };
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry.handle_browse_status(remote.clone(), alive.clone());
        }
        assert_eq!(registry.len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn explicit_close_drops_the_session() {
        let wire = Arc::new(RecordingWire::new());
        let registry = registry_with_messages(wire.clone(), Duration::from_secs(60), 5);
        let remote = NodeId::from_seed(9);

        registry.handle_browse_get(remote.clone(), get(1, 0)).await;
        registry.handle_browse_status(
            remote,
            BrowseStatus {
                gathering_target: None,
                browse_id: BrowseId::new(1),
                status: BrowseStatusKind::Close,
            },
        );
        assert!(registry.is_empty());
    }
}
