//! Correlation of outstanding remote gets
//!
//! One [`CorrelationKey`] exists per in-flight remote get. The tick is the
//! server-assigned sequence identity the reply must echo; the rest of the
//! key records when and on whose behalf the request was issued, plus a
//! scratch slot bridging the two-phase accept/commit handshake of the
//! guaranteed-delivery protocol built above this primitive.

use dashmap::DashMap;
use meshq_topology::NodeId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::foundation::types::{QueuedMessage, WaitTimeout};

/// Back-reference to the dispatch key waiting on a remote get
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRef {
    /// The consumer key waiting for the reply
    pub consumer_id: Uuid,
    /// The node the request was issued against
    pub node_id: NodeId,
}

/// Correlates one outstanding remote get with its eventual reply
#[derive(Debug)]
pub struct CorrelationKey {
    tick: u64,
    dispatch: Option<DispatchRef>,
    original_timeout: WaitTimeout,
    issue_time: Instant,
    accepted: Mutex<Option<QueuedMessage>>,
}

impl CorrelationKey {
    /// Create a key for a freshly issued request
    pub fn new(tick: u64, dispatch: DispatchRef, original_timeout: WaitTimeout) -> Self {
        Self {
            tick,
            dispatch: Some(dispatch),
            original_timeout,
            issue_time: Instant::now(),
            accepted: Mutex::new(None),
        }
    }

    /// Reconstruct a key from persisted state after a restart
    ///
    /// Only the tick is trustworthy; every other field is advisory and
    /// may be stale.
    pub fn recovered(tick: u64) -> Self {
        Self {
            tick,
            dispatch: None,
            original_timeout: WaitTimeout::NoWait,
            issue_time: Instant::now(),
            accepted: Mutex::new(None),
        }
    }

    /// The server-assigned sequence identity
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// The dispatch key waiting on this request, if known
    pub fn dispatch(&self) -> Option<&DispatchRef> {
        self.dispatch.as_ref()
    }

    /// The timeout the request was originally issued with
    pub fn original_timeout(&self) -> WaitTimeout {
        self.original_timeout
    }

    /// How long this request has been outstanding
    pub fn elapsed(&self) -> Duration {
        self.issue_time.elapsed()
    }

    /// Park an item between accept and commit
    pub fn set_accepted(&self, message: QueuedMessage) {
        *self.accepted.lock() = Some(message);
    }

    /// Take the parked item, if any
    pub fn take_accepted(&self) -> Option<QueuedMessage> {
        self.accepted.lock().take()
    }
}

/// Live correlation keys indexed by tick
#[derive(Debug, Default)]
pub struct CorrelationTable {
    keys: DashMap<u64, Arc<CorrelationKey>>,
}

impl CorrelationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outstanding request
    pub fn insert(&self, key: Arc<CorrelationKey>) {
        self.keys.insert(key.tick(), key);
    }

    /// Resolve a reply: removes and returns the key for a tick
    pub fn complete(&self, tick: u64) -> Option<Arc<CorrelationKey>> {
        self.keys.remove(&tick).map(|(_, key)| key)
    }

    /// Look up an outstanding request without resolving it
    pub fn get(&self, tick: u64) -> Option<Arc<CorrelationKey>> {
        self.keys.get(&tick).map(|entry| entry.value().clone())
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether any request is outstanding
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
