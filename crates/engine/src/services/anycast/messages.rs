//! Wire messages of the anycast browse protocol
//!
//! `BrowseGet`, `BrowseData`, `BrowseEnd` and `BrowseStatus` are one-way
//! sends; correlation is by `(browse_id, sequence_number)` at the protocol
//! layer, not by transport correlation IDs. The attach handshake
//! (`ConsumerCreate`) is the only request/response exchange.

use meshq_network::{NetworkMessage, ServiceMessage};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::foundation::types::{BrowseId, DestinationName, GatheringTargetId, QueuedMessage};

/// Request one message from a hosting-side browse session
///
/// The selector travels only on the first request of a browse
/// (`sequence_number == 0`); it establishes hosting-side filter state for
/// the whole session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseGet {
    /// Destination being browsed
    pub destination: DestinationName,
    /// Gathering scope, if the browse is on behalf of a gathering consumer
    pub gathering_target: Option<GatheringTargetId>,
    /// Browse identity, unique relative to the requesting node
    pub browse_id: BrowseId,
    /// Cursor position; must match the session's expected value exactly
    pub sequence_number: u64,
    /// Raw selector, present only when `sequence_number == 0`
    pub filter: Option<String>,
}

impl NetworkMessage for BrowseGet {
    fn message_type() -> &'static str {
        "anycast.browse_get"
    }
}

/// One message delivered in reply to a `BrowseGet`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseData {
    /// Browse identity
    pub browse_id: BrowseId,
    /// Echo of the request's sequence number
    pub sequence_number: u64,
    /// The message
    pub message: QueuedMessage,
}

impl NetworkMessage for BrowseData {
    fn message_type() -> &'static str {
        "anycast.browse_data"
    }
}

/// Why a browse ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrowseEndReason {
    /// End of data; not an error
    Ok,
    /// The hosting side's message store failed
    StoreException,
    /// Sequence numbers diverged; state was lost on one side
    OutOfOrder,
    /// The selector failed to parse
    BadFilter,
}

impl fmt::Display for BrowseEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrowseEndReason::Ok => write!(f, "end of messages"),
            BrowseEndReason::StoreException => write!(f, "message store exception"),
            BrowseEndReason::OutOfOrder => write!(f, "sequence out of order"),
            BrowseEndReason::BadFilter => write!(f, "filter failed to parse"),
        }
    }
}

/// Terminal notification for a browse
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseEnd {
    /// Browse identity
    pub browse_id: BrowseId,
    /// Why the browse ended
    pub reason: BrowseEndReason,
}

impl NetworkMessage for BrowseEnd {
    fn message_type() -> &'static str {
        "anycast.browse_end"
    }
}

/// Liveness and close signalling for a browse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrowseStatusKind {
    /// Liveness ping; renews the peer's lease
    Alive,
    /// Explicit requesting-side close
    Close,
}

/// Status message for a browse
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseStatus {
    /// Gathering scope carried so the hosting side can form the session key
    pub gathering_target: Option<GatheringTargetId>,
    /// Browse identity
    pub browse_id: BrowseId,
    /// Status kind
    pub status: BrowseStatusKind,
}

impl NetworkMessage for BrowseStatus {
    fn message_type() -> &'static str {
        "anycast.browse_status"
    }
}

/// Attach handshake: ask the hosting side to accept a consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerCreate {
    /// Destination to attach to
    pub destination: DestinationName,
    /// Gathering scope of the consumer
    pub gathering_target: Option<GatheringTargetId>,
    /// Raw selector, validated by the hosting side
    pub filter: Option<String>,
    /// Identity of the attaching consumer
    pub consumer_id: Uuid,
}

impl NetworkMessage for ConsumerCreate {
    fn message_type() -> &'static str {
        "anycast.consumer_create"
    }
}

impl ServiceMessage for ConsumerCreate {
    type Response = ConsumerCreateAck;

    fn service_id() -> &'static str {
        "anycast.consumer_create"
    }
}

/// Why the hosting side rejected an attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateRejectReason {
    /// This node hosts no partition of the destination
    UnknownDestination,
    /// The selector failed to parse
    BadFilter(String),
    /// Any other rejection
    Other(String),
}

/// Attach handshake response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerCreateAck {
    /// Whether the hosting side accepted the attach
    pub accepted: bool,
    /// Rejection reason when not accepted
    pub reason: Option<CreateRejectReason>,
}

impl NetworkMessage for ConsumerCreateAck {
    fn message_type() -> &'static str {
        "anycast.consumer_create_ack"
    }
}
