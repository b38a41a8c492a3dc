//! Consumer keys: per-partition legs and the gathering aggregate
//!
//! Local, remote and gathering consumers share one small capability set
//! {pull, refill, waiting, ready, not-ready, start, stop, detach};
//! [`PartitionKey`] is the enum-tagged per-partition leg and
//! [`GatheringConsumerKey`] the aggregate that selects between legs.

use meshq_topology::NodeId;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineResult, ErrorKind};
use crate::foundation::lock_rank::{self, LockRank};
use crate::foundation::traits::PartitionConsumer;
use crate::foundation::types::{QueuedMessage, WaitDeadline, WaitTimeout};
use crate::services::anycast::correlation::{CorrelationKey, CorrelationTable, DispatchRef};
use crate::services::anycast::cursor::BrowseCursor;
use crate::services::anycast::service::RemoteConsumerAccess;
use crate::services::gathering::attachment::AttachmentDetails;

/// Identity of one attached consumer key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerKeyId(Uuid);

impl ConsumerKeyId {
    /// Create a fresh consumer key ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConsumerKeyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsumerKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Destination-wide shared ordering state of ready consumers
///
/// Its lock ranks below every consumer-group lock; methods acquire the
/// rank themselves so callers cannot get the order wrong silently.
#[derive(Debug, Default)]
pub struct ReadyConsumerPoint {
    ready: Mutex<HashSet<ConsumerKeyId>>,
}

impl ReadyConsumerPoint {
    /// Create an empty ready set
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a consumer ready for delivery
    pub fn mark_ready(&self, id: ConsumerKeyId) {
        let _rank = lock_rank::acquire(LockRank::ReadyPoint);
        self.ready.lock().insert(id);
    }

    /// Mark a consumer not ready
    pub fn mark_not_ready(&self, id: &ConsumerKeyId) {
        let _rank = lock_rank::acquire(LockRank::ReadyPoint);
        self.ready.lock().remove(id);
    }

    /// Whether a consumer is currently ready
    pub fn is_ready(&self, id: &ConsumerKeyId) -> bool {
        let _rank = lock_rank::acquire(LockRank::ReadyPoint);
        self.ready.lock().contains(id)
    }

    /// Number of ready consumers
    pub fn ready_count(&self) -> usize {
        let _rank = lock_rank::acquire(LockRank::ReadyPoint);
        self.ready.lock().len()
    }
}

/// The local leg of a consumer: wraps the partition's own consumer
pub struct LocalKey {
    consumer: Mutex<Box<dyn PartitionConsumer>>,
}

impl LocalKey {
    /// Wrap a local partition consumer
    pub fn new(consumer: Box<dyn PartitionConsumer>) -> Self {
        Self {
            consumer: Mutex::new(consumer),
        }
    }
}

struct RemoteKeyState {
    cursor: Option<Arc<BrowseCursor>>,
    buffered: VecDeque<QueuedMessage>,
    refill_in_flight: bool,
    last_wait: Option<WaitTimeout>,
    started: bool,
    ready: bool,
}

/// The remote leg of a consumer: a browse cursor against one hosting node
/// plus a refill slot the selection algorithm pulls from
pub struct RemoteKey {
    node_id: NodeId,
    owner: ConsumerKeyId,
    details: AttachmentDetails,
    access: Arc<dyn RemoteConsumerAccess>,
    correlations: Arc<CorrelationTable>,
    next_tick: AtomicU64,
    state: Mutex<RemoteKeyState>,
}

impl RemoteKey {
    /// Create the remote leg for one hosting node
    pub fn new(
        node_id: NodeId,
        owner: ConsumerKeyId,
        details: AttachmentDetails,
        access: Arc<dyn RemoteConsumerAccess>,
        correlations: Arc<CorrelationTable>,
    ) -> Self {
        Self {
            node_id,
            owner,
            details,
            access,
            correlations,
            next_tick: AtomicU64::new(0),
            state: Mutex::new(RemoteKeyState {
                cursor: None,
                buffered: VecDeque::new(),
                refill_in_flight: false,
                last_wait: None,
                started: true,
                ready: true,
            }),
        }
    }

    fn pull_next(&self) -> Option<QueuedMessage> {
        let mut state = self.state.lock();
        if !state.started || !state.ready {
            return None;
        }
        state.buffered.pop_front()
    }

    /// Kick off one request round trip unless one is already in flight
    ///
    /// A browse ends when its partition drains, so each refill wave that
    /// finds no open cursor opens a fresh one. The reply lands in the
    /// buffer for a later pull.
    fn initiate_refill(self: &Arc<Self>, wait: WaitTimeout) {
        let cursor = {
            let mut state = self.state.lock();
            if !state.started || !state.ready || state.refill_in_flight {
                return;
            }
            state.refill_in_flight = true;
            state.last_wait = Some(wait);
            let open = state.cursor.as_ref().filter(|c| c.is_open()).cloned();
            match open {
                Some(cursor) => cursor,
                None => {
                    let cursor = self.access.open_browse(
                        self.node_id.clone(),
                        self.details.destination.clone(),
                        self.details.gathering_target,
                        self.details.filter.clone(),
                    );
                    state.cursor = Some(cursor.clone());
                    cursor
                }
            }
        };

        let tick = self.next_tick.fetch_add(1, Ordering::Relaxed);
        self.correlations.insert(Arc::new(CorrelationKey::new(
            tick,
            DispatchRef {
                consumer_id: *self.owner.as_uuid(),
                node_id: self.node_id.clone(),
            },
            wait,
        )));

        let this = self.clone();
        tokio::spawn(async move {
            let result = cursor.next().await;
            this.correlations.complete(tick);

            let mut state = this.state.lock();
            state.refill_in_flight = false;
            match result {
                Ok(Some(message)) => state.buffered.push_back(message),
                Ok(None) => {
                    // Partition drained; the next refill opens a new browse
                    state.cursor = None;
                }
                Err(e) => {
                    debug!("Refill against {} failed: {}", this.node_id, e);
                    state.cursor = None;
                }
            }
        });
    }

    fn waiting(&self, timeout: WaitTimeout, _modify: bool) -> WaitTimeout {
        self.state.lock().last_wait = Some(timeout);
        timeout
    }

    #[cfg(test)]
    pub(crate) fn last_refill_wait(&self) -> Option<WaitTimeout> {
        self.state.lock().last_wait
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.state.lock().buffered.len()
    }
}

/// One per-partition leg of a gathering consumer
#[derive(Clone)]
pub enum PartitionKey {
    /// The destination's local partition
    Local(Arc<LocalKey>),
    /// A partition hosted by a remote node
    Remote(Arc<RemoteKey>),
}

impl PartitionKey {
    /// Build the local leg
    pub fn local(consumer: Box<dyn PartitionConsumer>) -> Self {
        PartitionKey::Local(Arc::new(LocalKey::new(consumer)))
    }

    /// Build the remote leg
    pub fn remote(
        node_id: NodeId,
        owner: ConsumerKeyId,
        details: AttachmentDetails,
        access: Arc<dyn RemoteConsumerAccess>,
        correlations: Arc<CorrelationTable>,
    ) -> Self {
        PartitionKey::Remote(Arc::new(RemoteKey::new(
            node_id,
            owner,
            details,
            access,
            correlations,
        )))
    }

    /// Pull the next available message without waiting
    pub fn pull_next(&self) -> EngineResult<Option<QueuedMessage>> {
        match self {
            PartitionKey::Local(key) => key.consumer.lock().pull_next(),
            PartitionKey::Remote(key) => Ok(key.pull_next()),
        }
    }

    /// Kick off a refill round trip for an empty partition
    pub fn initiate_refill(&self, wait: WaitTimeout) {
        match self {
            PartitionKey::Local(_) => {}
            PartitionKey::Remote(key) => key.initiate_refill(wait),
        }
    }

    /// Report how long the caller is prepared to wait on this partition
    pub fn waiting(&self, timeout: WaitTimeout, modify: bool) -> WaitTimeout {
        match self {
            PartitionKey::Local(key) => key.consumer.lock().waiting(timeout, modify),
            PartitionKey::Remote(key) => key.waiting(timeout, modify),
        }
    }

    /// Mark the leg eligible for delivery
    pub fn ready(&self) {
        match self {
            PartitionKey::Local(key) => key.consumer.lock().ready(),
            PartitionKey::Remote(key) => key.state.lock().ready = true,
        }
    }

    /// Mark the leg ineligible for delivery
    pub fn not_ready(&self) {
        match self {
            PartitionKey::Local(key) => key.consumer.lock().not_ready(),
            PartitionKey::Remote(key) => key.state.lock().ready = false,
        }
    }

    /// Start message flow
    pub fn start(&self) {
        match self {
            PartitionKey::Local(key) => key.consumer.lock().start(),
            PartitionKey::Remote(key) => key.state.lock().started = true,
        }
    }

    /// Stop message flow
    pub fn stop(&self) {
        match self {
            PartitionKey::Local(key) => key.consumer.lock().stop(),
            PartitionKey::Remote(key) => key.state.lock().started = false,
        }
    }

    /// Detach cleanly, closing the remote browse if one is open
    pub async fn detach(&self) -> EngineResult<()> {
        match self {
            PartitionKey::Local(key) => key.consumer.lock().detach(),
            PartitionKey::Remote(key) => {
                let cursor = key.state.lock().cursor.take();
                match cursor {
                    Some(cursor) => key.access.finish_browse(cursor.browse_id()).await,
                    None => Ok(()),
                }
            }
        }
    }

    /// Tear down locally without any remote close; the peer is assumed gone
    pub fn discard(&self) {
        match self {
            PartitionKey::Local(key) => {
                if let Err(e) = key.consumer.lock().detach() {
                    debug!("Local consumer detach failed: {}", e);
                }
            }
            PartitionKey::Remote(key) => {
                let mut state = key.state.lock();
                state.buffered.clear();
                if let Some(cursor) = state.cursor.take() {
                    key.access.discard_browse(cursor.browse_id());
                }
            }
        }
    }
}

struct GatheringInner {
    partitions: HashMap<NodeId, PartitionKey>,
    rotation: Vec<NodeId>,
    last_served: Option<NodeId>,
    outstanding_expiry: WaitDeadline,
    forward_scanning: bool,
    ready: bool,
    started: bool,
    unrecoverable: bool,
}

/// The aggregate key of one gathering consumer
///
/// Holds one leg per reachable partition (the local partition always
/// included while it exists); legs come and go with reachability, and no
/// leg is ever reused for a different node.
pub struct GatheringConsumerKey {
    id: ConsumerKeyId,
    local_node: NodeId,
    details: AttachmentDetails,
    local_weighting: u8,
    ready_point: Arc<ReadyConsumerPoint>,
    inner: Mutex<GatheringInner>,
}

impl GatheringConsumerKey {
    /// Create an empty aggregate; legs are inserted by the dispatcher
    pub fn new(
        local_node: NodeId,
        details: AttachmentDetails,
        local_weighting: u8,
        ready_point: Arc<ReadyConsumerPoint>,
    ) -> Self {
        let forward_scanning = details.forward_scanning;
        Self {
            id: ConsumerKeyId::new(),
            local_node,
            details,
            local_weighting,
            ready_point,
            inner: Mutex::new(GatheringInner {
                partitions: HashMap::new(),
                rotation: Vec::new(),
                last_served: None,
                outstanding_expiry: WaitDeadline::NoWait,
                forward_scanning,
                ready: true,
                started: true,
                unrecoverable: false,
            }),
        }
    }

    /// This key's identity
    pub fn id(&self) -> ConsumerKeyId {
        self.id
    }

    /// The attachment parameters this key was created with
    pub fn details(&self) -> &AttachmentDetails {
        &self.details
    }

    /// Whether selection scans forward only
    pub fn forward_scanning(&self) -> bool {
        let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
        self.inner.lock().forward_scanning
    }

    /// Whether the key hit an unrecoverable local fault
    pub fn is_unrecoverable(&self) -> bool {
        let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
        self.inner.lock().unrecoverable
    }

    /// Insert the leg for a partition, replaying any outstanding wait
    pub fn insert_partition(&self, node: NodeId, key: PartitionKey) {
        let expiry = {
            let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
            let mut inner = self.inner.lock();
            if !inner.rotation.contains(&node) {
                inner.rotation.push(node.clone());
            }
            inner.partitions.insert(node, key.clone());
            inner.outstanding_expiry
        };

        // A consumer already waiting must see the new partition join the
        // wait with whatever patience it has left
        if expiry.is_pending() {
            key.initiate_refill(expiry.remaining());
        }
    }

    /// Remove a partition's leg; the caller tears the leg down
    pub fn remove_partition(&self, node: &NodeId) -> Option<PartitionKey> {
        let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
        let mut inner = self.inner.lock();
        inner.rotation.retain(|n| n != node);
        if inner.last_served.as_ref() == Some(node) {
            inner.last_served = None;
        }
        inner.partitions.remove(node)
    }

    /// Whether a leg exists for a node
    pub fn has_partition(&self, node: &NodeId) -> bool {
        let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
        self.inner.lock().partitions.contains_key(node)
    }

    /// Nodes that currently have a leg
    pub fn partition_nodes(&self) -> Vec<NodeId> {
        let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
        self.inner.lock().rotation.clone()
    }

    /// The latest outstanding wait deadline across the partitions
    pub fn outstanding_deadline(&self) -> WaitDeadline {
        let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
        self.inner.lock().outstanding_expiry
    }

    /// Select a partition and pull one message
    ///
    /// With probability `local-weighting`/100 the local partition is tried
    /// first; otherwise (or when it is empty) selection round-robins over
    /// the full partition set starting immediately after the last node
    /// served, one full cycle at most. Empty partitions are kicked to
    /// refill on the way past.
    pub fn pull_next(&self) -> EngineResult<Option<QueuedMessage>> {
        let (candidates, wait) = {
            let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
            let inner = self.inner.lock();
            if !inner.started || !inner.ready {
                return Ok(None);
            }
            // Snapshot so reattachment racing this pull cannot invalidate
            // the iteration
            let start = inner
                .last_served
                .as_ref()
                .and_then(|last| inner.rotation.iter().position(|n| n == last))
                .map(|pos| pos + 1)
                .unwrap_or(0);
            let mut candidates = Vec::with_capacity(inner.rotation.len());
            for offset in 0..inner.rotation.len() {
                let node = &inner.rotation[(start + offset) % inner.rotation.len()];
                if let Some(key) = inner.partitions.get(node) {
                    candidates.push((node.clone(), key.clone()));
                }
            }
            (candidates, inner.outstanding_expiry.remaining())
        };

        let mut tried_local = false;
        if self.roll_local_preference() {
            if let Some(entry) = candidates.iter().find(|(node, _)| *node == self.local_node) {
                tried_local = true;
                if let Some(message) = self.try_pull(entry, WaitTimeout::NoWait)? {
                    return Ok(Some(message));
                }
            }
        }

        for entry in &candidates {
            if tried_local && entry.0 == self.local_node {
                continue;
            }
            if let Some(message) = self.try_pull(entry, wait)? {
                return Ok(Some(message));
            }
        }

        Ok(None)
    }

    /// Propagate a wait to every partition; the aggregate's answer is the
    /// latest answer any partition gave, and is cached for replay
    pub fn waiting(&self, timeout: WaitTimeout, modify: bool) -> WaitTimeout {
        let partitions: Vec<PartitionKey> = {
            let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
            self.inner.lock().partitions.values().cloned().collect()
        };

        let mut aggregate = timeout;
        for key in &partitions {
            aggregate = aggregate.later_of(key.waiting(timeout, modify));
        }

        {
            let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
            self.inner.lock().outstanding_expiry = WaitDeadline::from_timeout(aggregate);
        }
        aggregate
    }

    /// Mark the consumer ready, fanning out to every leg and the shared
    /// ready state atomically
    pub fn ready(&self) {
        let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
        let mut inner = self.inner.lock();
        inner.ready = true;
        self.ready_point.mark_ready(self.id);
        for key in inner.partitions.values() {
            key.ready();
        }
    }

    /// Mark the consumer not ready
    pub fn not_ready(&self) {
        let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
        let mut inner = self.inner.lock();
        inner.ready = false;
        self.ready_point.mark_not_ready(&self.id);
        for key in inner.partitions.values() {
            key.not_ready();
        }
    }

    /// Start message flow on every leg
    pub fn start(&self) {
        let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
        let mut inner = self.inner.lock();
        inner.started = true;
        for key in inner.partitions.values() {
            key.start();
        }
    }

    /// Stop message flow on every leg
    pub fn stop(&self) {
        let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
        let mut inner = self.inner.lock();
        inner.started = false;
        for key in inner.partitions.values() {
            key.stop();
        }
    }

    /// Detach every leg cleanly; best effort, first error surfaced last
    pub async fn detach(&self) -> EngineResult<()> {
        let partitions: Vec<PartitionKey> = {
            let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
            let mut inner = self.inner.lock();
            inner.rotation.clear();
            inner.last_served = None;
            inner.partitions.drain().map(|(_, key)| key).collect()
        };
        self.ready_point.mark_not_ready(&self.id);

        let mut first_error = None;
        for key in partitions {
            if let Err(e) = key.detach().await {
                warn!("Partition detach failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn roll_local_preference(&self) -> bool {
        match self.local_weighting {
            0 => false,
            w if w >= 100 => true,
            w => rand::thread_rng().gen_range(0..100) < w,
        }
    }

    fn try_pull(
        &self,
        (node, key): &(NodeId, PartitionKey),
        wait: WaitTimeout,
    ) -> EngineResult<Option<QueuedMessage>> {
        match key.pull_next() {
            Ok(Some(message)) => {
                let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
                self.inner.lock().last_served = Some(node.clone());
                Ok(Some(message))
            }
            Ok(None) => {
                key.initiate_refill(wait);
                Ok(None)
            }
            Err(e) => {
                warn!("Pull from partition {} failed: {}", node, e);
                if matches!(e.kind(), ErrorKind::Storage) {
                    let _rank = lock_rank::acquire(LockRank::ConsumerGroup);
                    self.inner.lock().unrecoverable = true;
                }
                Err(e)
            }
        }
    }
}

impl fmt::Debug for GatheringConsumerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatheringConsumerKey")
            .field("id", &self.id)
            .field("local_node", &self.local_node)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::types::DestinationName;
    use crate::services::anycast::messages::BrowseData;
    use crate::services::anycast::testing::SentControl;
    use crate::services::gathering::testing::{MockRemoteAccess, ScriptedConsumer};
    use std::time::Duration;

    fn details() -> AttachmentDetails {
        AttachmentDetails::new(DestinationName::from("orders"))
    }

    fn gathering_key(weighting: u8) -> GatheringConsumerKey {
        GatheringConsumerKey::new(
            NodeId::from_seed(1),
            details(),
            weighting,
            Arc::new(ReadyConsumerPoint::new()),
        )
    }

    fn local_leg(payloads: &[&str]) -> PartitionKey {
        PartitionKey::local(ScriptedConsumer::with_messages(payloads))
    }

    fn payload(message: Option<QueuedMessage>) -> String {
        String::from_utf8(message.unwrap().payload.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn round_robin_visits_each_partition_once_per_cycle() {
        let key = gathering_key(0);
        key.insert_partition(NodeId::from_seed(1), local_leg(&["p1a", "p1b"]));
        key.insert_partition(NodeId::from_seed(2), local_leg(&["p2a", "p2b"]));
        key.insert_partition(NodeId::from_seed(3), local_leg(&["p3a", "p3b"]));

        // One full cycle in rotation order, then the rotation continues
        // after the last node served
        assert_eq!(payload(key.pull_next().unwrap()), "p1a");
        assert_eq!(payload(key.pull_next().unwrap()), "p2a");
        assert_eq!(payload(key.pull_next().unwrap()), "p3a");
        assert_eq!(payload(key.pull_next().unwrap()), "p1b");
    }

    #[tokio::test]
    async fn rotation_starts_after_the_last_node_served() {
        let key = gathering_key(0);
        key.insert_partition(NodeId::from_seed(1), local_leg(&["p1a"]));
        key.insert_partition(NodeId::from_seed(2), local_leg(&[]));
        key.insert_partition(NodeId::from_seed(3), local_leg(&["p3a", "p3b"]));

        assert_eq!(payload(key.pull_next().unwrap()), "p1a");
        // Partition 2 is empty, so 3 serves; next cycle starts after 3
        assert_eq!(payload(key.pull_next().unwrap()), "p3a");
        assert_eq!(payload(key.pull_next().unwrap()), "p3b");
    }

    #[tokio::test]
    async fn full_weighting_always_prefers_the_local_partition() {
        let key = gathering_key(100);
        key.insert_partition(NodeId::from_seed(1), local_leg(&["l1", "l2", "l3"]));
        key.insert_partition(NodeId::from_seed(2), local_leg(&["r1"]));

        for expected in ["l1", "l2", "l3"] {
            assert_eq!(payload(key.pull_next().unwrap()), expected);
        }
        // Local drained; the rotation serves the remote
        assert_eq!(payload(key.pull_next().unwrap()), "r1");
    }

    #[tokio::test]
    async fn zero_weighting_never_jumps_the_rotation_back_to_local() {
        let key = gathering_key(0);
        key.insert_partition(NodeId::from_seed(1), local_leg(&["l1", "l2"]));
        key.insert_partition(NodeId::from_seed(2), local_leg(&["r1"]));

        assert_eq!(payload(key.pull_next().unwrap()), "l1");
        // Local still has messages, but the rotation is past it
        assert_eq!(payload(key.pull_next().unwrap()), "r1");
        assert_eq!(payload(key.pull_next().unwrap()), "l2");
    }

    #[tokio::test]
    async fn waiting_reports_the_most_patient_partition() {
        let key = gathering_key(0);
        key.insert_partition(
            NodeId::from_seed(1),
            PartitionKey::local(ScriptedConsumer::with_wait_response(WaitTimeout::Bounded(
                Duration::from_secs(90),
            ))),
        );
        key.insert_partition(
            NodeId::from_seed(2),
            PartitionKey::local(ScriptedConsumer::with_wait_response(WaitTimeout::NoWait)),
        );

        let reported = key.waiting(WaitTimeout::Bounded(Duration::from_secs(30)), true);
        assert_eq!(reported, WaitTimeout::Bounded(Duration::from_secs(90)));
        assert!(key.outstanding_deadline().is_pending());

        let reported = key.waiting(WaitTimeout::Infinite, true);
        assert_eq!(reported, WaitTimeout::Infinite);
        assert_eq!(key.outstanding_deadline(), WaitDeadline::Infinite);
    }

    #[tokio::test]
    async fn empty_remote_partition_is_kicked_to_refill() {
        let access = MockRemoteAccess::new(Duration::from_secs(5));
        let correlations = Arc::new(CorrelationTable::new());
        let key = gathering_key(0);
        let remote_node = NodeId::from_seed(2);
        key.insert_partition(
            remote_node.clone(),
            PartitionKey::remote(
                remote_node,
                key.id(),
                details(),
                access.clone(),
                correlations.clone(),
            ),
        );

        assert!(key.pull_next().unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(30)).await;

        // One round trip is in flight, correlated by its tick
        let gets: Vec<_> = access
            .wire
            .sent()
            .into_iter()
            .filter_map(|c| match c {
                SentControl::Get(_, get) => Some(get),
                _ => None,
            })
            .collect();
        assert_eq!(gets.len(), 1);
        assert_eq!(gets[0].sequence_number, 0);
        assert_eq!(correlations.len(), 1);

        // The reply lands in the buffer and the next pull drains it
        access.cursors.deliver_data(BrowseData {
            browse_id: gets[0].browse_id,
            sequence_number: 0,
            message: QueuedMessage::new(b"remote".as_slice()),
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(correlations.is_empty());
        assert_eq!(payload(key.pull_next().unwrap()), "remote");
    }

    #[tokio::test]
    async fn inserted_partition_replays_the_outstanding_wait() {
        let access = MockRemoteAccess::new(Duration::from_secs(5));
        let correlations = Arc::new(CorrelationTable::new());
        let key = gathering_key(0);

        key.waiting(WaitTimeout::Bounded(Duration::from_secs(60)), true);

        let remote_node = NodeId::from_seed(2);
        let leg = PartitionKey::remote(
            remote_node.clone(),
            key.id(),
            details(),
            access.clone(),
            correlations,
        );
        key.insert_partition(remote_node, leg.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;

        let PartitionKey::Remote(remote) = &leg else {
            panic!("expected remote leg");
        };
        match remote.last_refill_wait() {
            Some(WaitTimeout::Bounded(d)) => {
                assert!(d <= Duration::from_secs(60));
                assert!(d > Duration::from_secs(55));
            }
            other => panic!("unexpected replay wait {other:?}"),
        }
        assert!(!access.wire.sent().is_empty(), "refill was not issued");
    }

    #[tokio::test]
    async fn infinite_wait_is_replayed_unchanged() {
        let access = MockRemoteAccess::new(Duration::from_secs(5));
        let key = gathering_key(0);
        key.waiting(WaitTimeout::Infinite, true);

        let remote_node = NodeId::from_seed(2);
        let leg = PartitionKey::remote(
            remote_node.clone(),
            key.id(),
            details(),
            access.clone(),
            Arc::new(CorrelationTable::new()),
        );
        key.insert_partition(remote_node, leg.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;

        let PartitionKey::Remote(remote) = &leg else {
            panic!("expected remote leg");
        };
        assert_eq!(remote.last_refill_wait(), Some(WaitTimeout::Infinite));
    }

    #[tokio::test]
    async fn removed_partition_resets_the_rotation_anchor() {
        let key = gathering_key(0);
        key.insert_partition(NodeId::from_seed(1), local_leg(&["p1a", "p1b"]));
        key.insert_partition(NodeId::from_seed(2), local_leg(&["p2a"]));

        assert_eq!(payload(key.pull_next().unwrap()), "p1a");
        let removed = key.remove_partition(&NodeId::from_seed(1));
        assert!(removed.is_some());
        removed.unwrap().discard();

        assert!(!key.has_partition(&NodeId::from_seed(1)));
        assert_eq!(payload(key.pull_next().unwrap()), "p2a");
    }

    #[tokio::test]
    async fn ready_state_gates_delivery_and_updates_the_shared_point() {
        let ready_point = Arc::new(ReadyConsumerPoint::new());
        let key = GatheringConsumerKey::new(
            NodeId::from_seed(1),
            details(),
            0,
            ready_point.clone(),
        );
        key.insert_partition(NodeId::from_seed(1), local_leg(&["m"]));

        key.not_ready();
        assert!(key.pull_next().unwrap().is_none());
        assert!(!ready_point.is_ready(&key.id()));

        key.ready();
        assert!(ready_point.is_ready(&key.id()));
        assert_eq!(payload(key.pull_next().unwrap()), "m");
    }
}
