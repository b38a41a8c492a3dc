//! Value types shared across the engine

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{EngineResult, Error};

/// Logical destination (queue) name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationName(String);

impl DestinationName {
    /// Create a new destination name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DestinationName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one remote browse, unique relative to the requesting node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrowseId(u64);

impl BrowseId {
    /// Create from a raw value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BrowseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "browse-{}", self.0)
    }
}

/// Identifier of the destination a gathering consumer gathers across
///
/// Set only when the consumer's scope is an alias narrowing the node set;
/// unset means the physical destination itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatheringTargetId(uuid::Uuid);

impl GatheringTargetId {
    /// Create a fresh random gathering target ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Create from an existing UUID
    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for GatheringTargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GatheringTargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One message held by a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Message identity
    pub id: uuid::Uuid,
    /// Application properties, matchable by filters
    pub properties: HashMap<String, String>,
    /// Opaque payload
    pub payload: Bytes,
}

impl QueuedMessage {
    /// Create a message with no properties
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            properties: HashMap::new(),
            payload: payload.into(),
        }
    }

    /// Create a message with one property set
    pub fn with_property(
        payload: impl Into<Bytes>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(payload);
        msg.properties.insert(key.into(), value.into());
        msg
    }
}

/// Message selection filter
///
/// The selector language is a single `property=value` equality; syntax
/// validation happens at parse time so a malformed selector can be
/// rejected with a distinct reason before any cursor is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFilter {
    key: String,
    value: String,
}

impl MessageFilter {
    /// Parse a `property=value` selector
    pub fn parse(selector: &str) -> EngineResult<Self> {
        let Some((key, value)) = selector.split_once('=') else {
            return Err(Error::invalid_filter(format!(
                "selector {selector:?} is not of the form property=value"
            )));
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            return Err(Error::invalid_filter(format!(
                "selector {selector:?} has an empty property name"
            )));
        }
        Ok(Self {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Whether a message matches this filter
    pub fn matches(&self, message: &QueuedMessage) -> bool {
        message.properties.get(&self.key) == Some(&self.value)
    }
}

impl fmt::Display for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// How long a caller is prepared to wait for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Do not wait at all
    NoWait,
    /// Wait up to the given duration
    Bounded(Duration),
    /// Wait indefinitely
    Infinite,
}

impl WaitTimeout {
    /// The later (more patient) of two timeouts
    pub fn later_of(self, other: Self) -> Self {
        match (self, other) {
            (WaitTimeout::Infinite, _) | (_, WaitTimeout::Infinite) => WaitTimeout::Infinite,
            (WaitTimeout::NoWait, o) => o,
            (s, WaitTimeout::NoWait) => s,
            (WaitTimeout::Bounded(a), WaitTimeout::Bounded(b)) => WaitTimeout::Bounded(a.max(b)),
        }
    }
}

/// Absolute deadline form of a [`WaitTimeout`], kept so an outstanding wait
/// can be replayed against a partition that reappears
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitDeadline {
    /// No wait outstanding
    NoWait,
    /// Wait outstanding until the given instant
    Until(Instant),
    /// Wait outstanding with no deadline
    Infinite,
}

impl WaitDeadline {
    /// Convert a relative timeout into an absolute deadline, anchored now
    pub fn from_timeout(timeout: WaitTimeout) -> Self {
        match timeout {
            WaitTimeout::NoWait => WaitDeadline::NoWait,
            WaitTimeout::Bounded(d) => WaitDeadline::Until(Instant::now() + d),
            WaitTimeout::Infinite => WaitDeadline::Infinite,
        }
    }

    /// The later of two deadlines
    pub fn later_of(self, other: Self) -> Self {
        match (self, other) {
            (WaitDeadline::Infinite, _) | (_, WaitDeadline::Infinite) => WaitDeadline::Infinite,
            (WaitDeadline::NoWait, o) => o,
            (s, WaitDeadline::NoWait) => s,
            (WaitDeadline::Until(a), WaitDeadline::Until(b)) => WaitDeadline::Until(a.max(b)),
        }
    }

    /// Remaining wait, `max(0, deadline - now)`; the infinite sentinel is
    /// preserved unchanged
    pub fn remaining(&self) -> WaitTimeout {
        match self {
            WaitDeadline::NoWait => WaitTimeout::NoWait,
            WaitDeadline::Until(deadline) => {
                WaitTimeout::Bounded(deadline.saturating_duration_since(Instant::now()))
            }
            WaitDeadline::Infinite => WaitTimeout::Infinite,
        }
    }

    /// Whether a wait is still outstanding
    pub fn is_pending(&self) -> bool {
        match self {
            WaitDeadline::NoWait => false,
            WaitDeadline::Until(deadline) => *deadline > Instant::now(),
            WaitDeadline::Infinite => true,
        }
    }
}
