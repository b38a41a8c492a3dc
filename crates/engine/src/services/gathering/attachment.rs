//! Attachment parameters kept for reattachment

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::foundation::types::{DestinationName, GatheringTargetId};

/// Handle of the consumer set (ordering group) an attachment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerSetId(Uuid);

impl ConsumerSetId {
    /// Create a fresh consumer-set handle
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConsumerSetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsumerSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything needed to re-attach a consumer to a partition that was
/// previously unreachable
///
/// Recorded once at attach time and kept, immutable, for the lifetime of
/// the consumer attachment.
#[derive(Debug, Clone)]
pub struct AttachmentDetails {
    /// Destination the consumer is attached to
    pub destination: DestinationName,
    /// Gathering scope of the consumer, if any
    pub gathering_target: Option<GatheringTargetId>,
    /// Raw selector; validated by each partition's hosting side
    pub filter: Option<String>,
    /// The application connection the consumer belongs to
    pub connection_id: Uuid,
    /// Whether the consumer pre-fetches beyond the current request
    pub read_ahead: bool,
    /// Whether selection scans forward only
    pub forward_scanning: bool,
    /// The consumer set (ordering group) to join
    pub consumer_set: ConsumerSetId,
}

impl AttachmentDetails {
    /// Details for a plain consumer of a destination
    pub fn new(destination: DestinationName) -> Self {
        Self {
            destination,
            gathering_target: None,
            filter: None,
            connection_id: Uuid::new_v4(),
            read_ahead: false,
            forward_scanning: false,
            consumer_set: ConsumerSetId::new(),
        }
    }

    /// Set the selector
    pub fn with_filter(mut self, selector: impl Into<String>) -> Self {
        self.filter = Some(selector.into());
        self
    }

    /// Set the gathering scope
    pub fn with_gathering_target(mut self, target: GatheringTargetId) -> Self {
        self.gathering_target = Some(target);
        self
    }
}
