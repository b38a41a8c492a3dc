//! Gathering consumer dispatcher
//!
//! Top-level fan-out manager for one destination: attaches logical
//! consumers across the local partition and every reachable remote
//! partition, and owns the reattachment machinery driven by topology
//! change.
//!
//! Lock discipline: the attachment table and the remote-partition map are
//! held together only for registration and snapshots, never across a
//! network round trip. Slow-responding attaches are retried with every
//! lock released, because the thread that would deliver the handshake
//! response may need the same locks.

use meshq_topology::NodeId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatheringConfig;
use crate::error::{EngineResult, Error, ErrorKind};
use crate::foundation::lock_rank::{self, LockRank};
use crate::foundation::traits::LocalPartition;
use crate::foundation::types::{DestinationName, GatheringTargetId, MessageFilter};
use crate::services::anycast::correlation::CorrelationTable;
use crate::services::anycast::messages::ConsumerCreate;
use crate::services::anycast::service::RemoteConsumerAccess;
use crate::services::gathering::attachment::AttachmentDetails;
use crate::services::gathering::browse::{GatheringBrowseCursor, GatheringLeg};
use crate::services::gathering::groups::OrderingGroupArena;
use crate::services::gathering::keys::{
    ConsumerKeyId, GatheringConsumerKey, PartitionKey, ReadyConsumerPoint,
};

/// Fan-out manager for gathering consumers of one destination
pub struct GatheringConsumerDispatcher {
    destination: DestinationName,
    local_node: NodeId,
    local_partition: Option<Arc<dyn LocalPartition>>,
    access: Arc<dyn RemoteConsumerAccess>,
    config: GatheringConfig,
    correlations: Arc<CorrelationTable>,
    ready_point: Arc<ReadyConsumerPoint>,
    attachments: Mutex<HashMap<ConsumerKeyId, Arc<GatheringConsumerKey>>>,
    remotes: Mutex<HashSet<NodeId>>,
    groups: Mutex<OrderingGroupArena>,
    pending_retry: Mutex<HashSet<NodeId>>,
    retry_armed: AtomicBool,
    cancellation: CancellationToken,
}

impl GatheringConsumerDispatcher {
    /// Create a dispatcher for one destination
    pub fn new(
        destination: DestinationName,
        local_node: NodeId,
        local_partition: Option<Arc<dyn LocalPartition>>,
        access: Arc<dyn RemoteConsumerAccess>,
        config: GatheringConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            destination,
            local_node,
            local_partition,
            access,
            config,
            correlations: Arc::new(CorrelationTable::new()),
            ready_point: Arc::new(ReadyConsumerPoint::new()),
            attachments: Mutex::new(HashMap::new()),
            remotes: Mutex::new(HashSet::new()),
            groups: Mutex::new(OrderingGroupArena::new()),
            pending_retry: Mutex::new(HashSet::new()),
            retry_armed: AtomicBool::new(false),
            cancellation: CancellationToken::new(),
        })
    }

    /// The destination this dispatcher serves
    pub fn destination(&self) -> &DestinationName {
        &self.destination
    }

    /// The shared ready state of this destination's consumers
    pub fn ready_point(&self) -> &Arc<ReadyConsumerPoint> {
        &self.ready_point
    }

    /// Outstanding remote-get correlation keys
    pub fn correlations(&self) -> &Arc<CorrelationTable> {
        &self.correlations
    }

    /// Attach a logical consumer across all current partitions
    ///
    /// The local partition attaches first, then each currently-known
    /// remote. Remote attaches are independently fallible: a slow
    /// responder is retried out of lock a bounded number of times, an
    /// unreachable node is left for topology-driven reattachment, and any
    /// other failure rolls the attach back and propagates.
    pub async fn attach(
        self: &Arc<Self>,
        details: AttachmentDetails,
    ) -> EngineResult<Arc<GatheringConsumerKey>> {
        // Remote sessions created for this consumer must consume, not
        // browse; the gathering scope on the wire is what tells the
        // hosting side so
        let details = if details.gathering_target.is_none() {
            AttachmentDetails {
                gathering_target: Some(GatheringTargetId::new()),
                ..details
            }
        } else {
            details
        };

        let key = Arc::new(GatheringConsumerKey::new(
            self.local_node.clone(),
            details.clone(),
            self.config.local_weighting,
            self.ready_point.clone(),
        ));

        let remote_nodes: Vec<NodeId> = {
            let _table_rank = lock_rank::acquire(LockRank::AttachmentTable);
            let mut attachments = self.attachments.lock();
            let _map_rank = lock_rank::acquire(LockRank::PartitionMap);
            let remotes = self.remotes.lock();

            if let Some(partition) = &self.local_partition {
                let consumer = partition.consumer(&details)?;
                key.insert_partition(self.local_node.clone(), PartitionKey::local(consumer));
            }

            attachments.insert(key.id(), key.clone());
            remotes.iter().cloned().collect()
        };
        self.groups.lock().add_member(details.consumer_set, key.id());

        let mut queued = Vec::new();
        for node in remote_nodes {
            match self.attach_remote(&key, &node).await {
                Ok(()) => {}
                Err(e) if e.is_no_response() => {
                    debug!("Attach to {} got no response, queueing retry", node);
                    queued.push(node);
                }
                Err(e) if e.is_unreachable() => {
                    debug!("Attach to {} skipped, node unreachable: {}", node, e);
                }
                Err(e) if matches!(e.kind(), ErrorKind::NotFound) => {
                    debug!("{} hosts no partition of {}", node, self.destination);
                }
                Err(e) => {
                    self.rollback(&key).await;
                    return Err(e);
                }
            }
        }

        // Out-of-lock retry loop for the slow responders; every lock is
        // released while we sleep so the response-delivery path cannot
        // deadlock against us
        let mut attempt = 0;
        while !queued.is_empty() && attempt < self.config.no_response_attach_retries {
            attempt += 1;
            tokio::time::sleep(self.config.no_response_attach_interval).await;

            let mut still_queued = Vec::new();
            for node in queued {
                match self.attach_remote(&key, &node).await {
                    Ok(()) => {}
                    Err(e) if e.is_no_response() => still_queued.push(node),
                    Err(e) if e.is_unreachable() => {
                        debug!("Attach retry to {} skipped, node unreachable: {}", node, e);
                    }
                    Err(e) if matches!(e.kind(), ErrorKind::NotFound) => {
                        debug!("{} hosts no partition of {}", node, self.destination);
                    }
                    Err(e) => {
                        self.rollback(&key).await;
                        return Err(e);
                    }
                }
            }
            queued = still_queued;
        }
        for node in queued {
            warn!(
                "Attach to {} still unanswered after {} retries",
                node, attempt
            );
            self.note_retry(node);
        }

        info!(
            "Consumer {} attached to {} across {} partition(s)",
            key.id(),
            self.destination,
            key.partition_nodes().len()
        );
        Ok(key)
    }

    /// Detach a consumer and release every partition leg
    pub async fn detach(&self, key: &Arc<GatheringConsumerKey>) -> EngineResult<()> {
        let removed = {
            let _table_rank = lock_rank::acquire(LockRank::AttachmentTable);
            self.attachments.lock().remove(&key.id())
        };
        if removed.is_none() {
            return Err(Error::not_found(format!(
                "consumer {} is not attached",
                key.id()
            )));
        }
        self.groups
            .lock()
            .remove_member(key.details().consumer_set, &key.id());
        key.detach().await
    }

    /// Open a browse across the local partition and every known remote
    pub fn browse_cursor(&self, filter: Option<String>) -> EngineResult<GatheringBrowseCursor> {
        let parsed = filter.as_deref().map(MessageFilter::parse).transpose()?;

        let mut legs = Vec::new();
        if let Some(partition) = &self.local_partition {
            legs.push(GatheringLeg::Local(Mutex::new(
                partition.browse_cursor(parsed.as_ref())?,
            )));
        }

        let nodes: Vec<NodeId> = {
            let _map_rank = lock_rank::acquire(LockRank::PartitionMap);
            self.remotes.lock().iter().cloned().collect()
        };
        for node in nodes {
            legs.push(GatheringLeg::Remote(self.access.open_browse(
                node,
                self.destination.clone(),
                None,
                filter.clone(),
            )));
        }

        Ok(GatheringBrowseCursor::new(legs, self.access.clone()))
    }

    /// A node now hosts a reachable partition of this destination
    ///
    /// Forces a fresh route first, then replays the saved attachment of
    /// every consumer that does not yet have a leg there. Failures put the
    /// node on the shared retry timer.
    pub async fn handle_node_reachable(self: &Arc<Self>, node: NodeId) {
        if node == self.local_node {
            return;
        }

        if let Err(e) = self.access.force_connect(&node).await {
            debug!("Connect to {} failed despite notification: {}", node, e);
            self.note_retry(node);
            return;
        }

        {
            let _map_rank = lock_rank::acquire(LockRank::PartitionMap);
            self.remotes.lock().insert(node.clone());
        }

        let keys: Vec<Arc<GatheringConsumerKey>> = {
            let _table_rank = lock_rank::acquire(LockRank::AttachmentTable);
            self.attachments.lock().values().cloned().collect()
        };
        for key in keys {
            if key.has_partition(&node) {
                continue;
            }
            match self.attach_remote(&key, &node).await {
                Ok(()) => {
                    debug!("Consumer {} reattached to {}", key.id(), node);
                }
                Err(e) if e.is_no_response() || e.is_unreachable() => {
                    debug!("Reattach to {} deferred: {}", node, e);
                    self.note_retry(node);
                    return;
                }
                Err(e) if matches!(e.kind(), ErrorKind::NotFound) => {
                    debug!("{} hosts no partition of {}", node, self.destination);
                }
                Err(e) => {
                    warn!("Reattach of consumer {} to {} failed: {}", key.id(), node, e);
                }
            }
        }
    }

    /// A node's partition is no longer reachable
    ///
    /// Every consumer drops its leg for the node without attempting a
    /// clean remote close; the remote is assumed gone.
    pub fn handle_node_unreachable(&self, node: &NodeId) {
        {
            let _map_rank = lock_rank::acquire(LockRank::PartitionMap);
            self.remotes.lock().remove(node);
        }
        self.pending_retry.lock().remove(node);

        let keys: Vec<Arc<GatheringConsumerKey>> = {
            let _table_rank = lock_rank::acquire(LockRank::AttachmentTable);
            self.attachments.lock().values().cloned().collect()
        };
        for key in keys {
            if let Some(leg) = key.remove_partition(node) {
                leg.discard();
            }
        }
        info!("Partition on {} detached from {}", node, self.destination);
    }

    /// Detach everything and stop the retry timer
    pub async fn close(&self) {
        self.cancellation.cancel();
        let keys: Vec<Arc<GatheringConsumerKey>> = {
            let _table_rank = lock_rank::acquire(LockRank::AttachmentTable);
            self.attachments.lock().drain().map(|(_, key)| key).collect()
        };
        for key in keys {
            self.groups
                .lock()
                .remove_member(key.details().consumer_set, &key.id());
            if let Err(e) = key.detach().await {
                debug!("Detach during close failed: {}", e);
            }
        }
    }

    /// Number of attached consumers
    pub fn attachment_count(&self) -> usize {
        let _table_rank = lock_rank::acquire(LockRank::AttachmentTable);
        self.attachments.lock().len()
    }

    /// Snapshot of the currently-known remote partition nodes
    pub fn remote_nodes(&self) -> Vec<NodeId> {
        let _map_rank = lock_rank::acquire(LockRank::PartitionMap);
        self.remotes.lock().iter().cloned().collect()
    }

    /// Record a node as hosting a reachable partition, with no attach work
    ///
    /// Used when the dispatcher is created after the topology is already
    /// known; consumers attached later pick the node up normally.
    pub fn seed_remote(&self, node: NodeId) {
        if node == self.local_node {
            return;
        }
        let _map_rank = lock_rank::acquire(LockRank::PartitionMap);
        self.remotes.lock().insert(node);
    }

    async fn attach_remote(
        &self,
        key: &Arc<GatheringConsumerKey>,
        node: &NodeId,
    ) -> EngineResult<()> {
        let details = key.details();
        let create = ConsumerCreate {
            destination: details.destination.clone(),
            gathering_target: details.gathering_target,
            filter: details.filter.clone(),
            consumer_id: *key.id().as_uuid(),
        };
        self.access.attach_consumer(node, create).await?;

        key.insert_partition(
            node.clone(),
            PartitionKey::remote(
                node.clone(),
                key.id(),
                details.clone(),
                self.access.clone(),
                self.correlations.clone(),
            ),
        );
        Ok(())
    }

    async fn rollback(&self, key: &Arc<GatheringConsumerKey>) {
        {
            let _table_rank = lock_rank::acquire(LockRank::AttachmentTable);
            self.attachments.lock().remove(&key.id());
        }
        self.groups
            .lock()
            .remove_member(key.details().consumer_set, &key.id());
        if let Err(e) = key.detach().await {
            debug!("Rollback detach failed: {}", e);
        }
    }

    /// Record a node for the shared retry timer, arming it if idle
    fn note_retry(self: &Arc<Self>, node: NodeId) {
        self.pending_retry.lock().insert(node);
        if self.retry_armed.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(this.config.reattach_interval) => {}
                    _ = this.cancellation.cancelled() => {
                        this.retry_armed.store(false, Ordering::SeqCst);
                        return;
                    }
                }

                let nodes: Vec<NodeId> = this.pending_retry.lock().drain().collect();
                for node in nodes {
                    this.handle_node_reachable(node).await;
                }

                if this.pending_retry.lock().is_empty() {
                    this.retry_armed.store(false, Ordering::SeqCst);
                    // A retry noted between the check and the disarm must
                    // not be lost; pick the timer back up if so
                    if this.pending_retry.lock().is_empty()
                        || this.retry_armed.swap(true, Ordering::SeqCst)
                    {
                        return;
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for GatheringConsumerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatheringConsumerDispatcher")
            .field("destination", &self.destination)
            .field("local_node", &self.local_node)
            .finish_non_exhaustive()
    }
}
