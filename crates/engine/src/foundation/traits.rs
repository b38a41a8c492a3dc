//! Collaborator traits at the edge of the engine
//!
//! The message store, the single-node queue cursor and the local consumer
//! machinery are external collaborators. The engine only ever reaches them
//! through these traits; `MemoryPartition` in this crate is the reference
//! implementation used by tests.

use crate::error::EngineResult;
use crate::foundation::types::{DestinationName, MessageFilter, QueuedMessage, WaitTimeout};
use crate::services::gathering::AttachmentDetails;

/// A cursor over one partition's messages
///
/// Backed by the external single-node queue implementation (lock / unlock /
/// next). `next` yields the next matching message or `None` at end of
/// data; a store fault surfaces as an error.
pub trait MessageCursor: Send {
    /// Pull the next message, `None` at end of data
    fn next(&mut self) -> EngineResult<Option<QueuedMessage>>;

    /// Release the cursor and any locks it holds; idempotent
    fn release(&mut self);
}

/// One node's local physical storage for a logical destination
pub trait LocalPartition: Send + Sync + 'static {
    /// The destination this partition belongs to
    fn destination(&self) -> &DestinationName;

    /// Open a non-destructive cursor over the partition's messages
    fn browse_cursor(&self, filter: Option<&MessageFilter>)
    -> EngineResult<Box<dyn MessageCursor>>;

    /// Open a consuming cursor: messages it yields are removed
    fn consuming_cursor(
        &self,
        filter: Option<&MessageFilter>,
    ) -> EngineResult<Box<dyn MessageCursor>>;

    /// Attach a local consumer to this partition
    fn consumer(&self, details: &AttachmentDetails) -> EngineResult<Box<dyn PartitionConsumer>>;
}

/// A consumer attached to one local partition
///
/// The capability set is deliberately small: pull, flow control and
/// wait bookkeeping. Remote partitions implement the same capabilities
/// through the anycast protocol.
pub trait PartitionConsumer: Send {
    /// Pull the next available message without waiting
    fn pull_next(&mut self) -> EngineResult<Option<QueuedMessage>>;

    /// Report (and optionally adjust) how long the caller is prepared to
    /// wait for this partition to deliver
    fn waiting(&mut self, timeout: WaitTimeout, modify: bool) -> WaitTimeout;

    /// Mark the consumer eligible for delivery
    fn ready(&mut self);

    /// Mark the consumer ineligible for delivery
    fn not_ready(&mut self);

    /// Start message flow
    fn start(&mut self);

    /// Stop message flow
    fn stop(&mut self);

    /// Detach from the partition, releasing any held resources
    fn detach(&mut self) -> EngineResult<()>;
}
