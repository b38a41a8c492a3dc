//! meshq engine: remote consumption for a distributed message queue
//!
//! Two cooperating subsystems make up the core:
//!
//! - The **anycast browse protocol** lets one node pull or browse messages
//!   physically stored on another node: a requesting-side [`BrowseCursor`]
//!   issues sequence-numbered gets against a hosting-side
//!   [`BrowseSession`], with lease-based liveness on both ends.
//! - The **gathering consumer** fans a single logical consumer out across
//!   one local partition and the partitions hosted by every reachable
//!   remote node, selecting between them with a weighted round robin and
//!   reattaching partitions as their nodes come and go.
//!
//! The message store itself, destination administration and wire security
//! are external collaborators reached through the traits in
//! [`foundation`].
//!
//! [`BrowseCursor`]: services::anycast::BrowseCursor
//! [`BrowseSession`]: services::anycast::BrowseSession

pub mod config;
pub mod engine;
pub mod error;
pub mod foundation;
pub mod services;

pub use config::{AnycastConfig, EngineConfig, GatheringConfig};
pub use engine::QueueEngine;
pub use error::{EngineResult, Error, ErrorKind};
