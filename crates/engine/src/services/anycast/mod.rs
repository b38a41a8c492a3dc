//! Anycast remote-browse protocol
//!
//! A requesting node pulls or browses messages physically stored on the
//! node hosting a destination's partition. Each browse is one
//! [`BrowseCursor`] on the requesting side paired with one
//! [`BrowseSession`] on the hosting side; the pair exchanges
//! sequence-numbered gets with at most one request in flight, and each
//! side leases the other's liveness.

pub mod correlation;
pub mod cursor;
pub mod lease;
pub mod messages;
pub mod service;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use correlation::{CorrelationKey, CorrelationTable};
pub use cursor::{BrowseCursor, BrowseCursorRegistry};
pub use messages::{
    BrowseData, BrowseEnd, BrowseEndReason, BrowseGet, BrowseStatus, BrowseStatusKind,
    ConsumerCreate, ConsumerCreateAck, CreateRejectReason,
};
pub use service::{AnycastService, AnycastWire, RemoteConsumerAccess};
pub use session::{BrowseSession, BrowseSessionKey, BrowseSessionRegistry};
