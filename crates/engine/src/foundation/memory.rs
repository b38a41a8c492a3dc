//! In-memory partition backing
//!
//! Reference implementation of the partition traits, used by the test
//! suites and small deployments that do not need a persistent store.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::foundation::traits::{LocalPartition, MessageCursor, PartitionConsumer};
use crate::foundation::types::{DestinationName, MessageFilter, QueuedMessage, WaitTimeout};
use crate::services::gathering::AttachmentDetails;

/// In-memory partition: a queue of messages behind a lock
#[derive(Debug)]
pub struct MemoryPartition {
    destination: DestinationName,
    messages: Arc<Mutex<VecDeque<QueuedMessage>>>,
}

impl MemoryPartition {
    /// Create an empty partition for a destination
    pub fn new(destination: DestinationName) -> Self {
        Self {
            destination,
            messages: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Append a message to the partition
    pub fn enqueue(&self, message: QueuedMessage) {
        self.messages.lock().push_back(message);
    }

    /// Number of messages currently stored
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Whether the partition is empty
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

impl LocalPartition for MemoryPartition {
    fn destination(&self) -> &DestinationName {
        &self.destination
    }

    fn browse_cursor(
        &self,
        filter: Option<&MessageFilter>,
    ) -> EngineResult<Box<dyn MessageCursor>> {
        // Browsing sees a point-in-time snapshot and removes nothing
        let snapshot: Vec<QueuedMessage> = self.messages.lock().iter().cloned().collect();
        Ok(Box::new(SnapshotCursor {
            snapshot,
            position: 0,
            filter: filter.cloned(),
        }))
    }

    fn consuming_cursor(
        &self,
        filter: Option<&MessageFilter>,
    ) -> EngineResult<Box<dyn MessageCursor>> {
        Ok(Box::new(ConsumingCursor {
            messages: self.messages.clone(),
            filter: filter.cloned(),
            released: false,
        }))
    }

    fn consumer(&self, details: &AttachmentDetails) -> EngineResult<Box<dyn PartitionConsumer>> {
        let filter = details
            .filter
            .as_deref()
            .map(MessageFilter::parse)
            .transpose()?;
        Ok(Box::new(MemoryConsumer {
            messages: self.messages.clone(),
            filter,
            started: true,
            ready: true,
        }))
    }
}

struct SnapshotCursor {
    snapshot: Vec<QueuedMessage>,
    position: usize,
    filter: Option<MessageFilter>,
}

impl MessageCursor for SnapshotCursor {
    fn next(&mut self) -> EngineResult<Option<QueuedMessage>> {
        while self.position < self.snapshot.len() {
            let message = &self.snapshot[self.position];
            self.position += 1;
            let matches = self
                .filter
                .as_ref()
                .is_none_or(|f| f.matches(message));
            if matches {
                return Ok(Some(message.clone()));
            }
        }
        Ok(None)
    }

    fn release(&mut self) {
        self.position = self.snapshot.len();
    }
}

struct ConsumingCursor {
    messages: Arc<Mutex<VecDeque<QueuedMessage>>>,
    filter: Option<MessageFilter>,
    released: bool,
}

impl MessageCursor for ConsumingCursor {
    fn next(&mut self) -> EngineResult<Option<QueuedMessage>> {
        if self.released {
            return Ok(None);
        }
        Ok(take_matching(&self.messages, self.filter.as_ref()))
    }

    fn release(&mut self) {
        self.released = true;
    }
}

struct MemoryConsumer {
    messages: Arc<Mutex<VecDeque<QueuedMessage>>>,
    filter: Option<MessageFilter>,
    started: bool,
    ready: bool,
}

impl PartitionConsumer for MemoryConsumer {
    fn pull_next(&mut self) -> EngineResult<Option<QueuedMessage>> {
        if !self.started || !self.ready {
            return Ok(None);
        }
        Ok(take_matching(&self.messages, self.filter.as_ref()))
    }

    fn waiting(&mut self, timeout: WaitTimeout, _modify: bool) -> WaitTimeout {
        timeout
    }

    fn ready(&mut self) {
        self.ready = true;
    }

    fn not_ready(&mut self) {
        self.ready = false;
    }

    fn start(&mut self) {
        self.started = true;
    }

    fn stop(&mut self) {
        self.started = false;
    }

    fn detach(&mut self) -> EngineResult<()> {
        self.stop();
        Ok(())
    }
}

fn take_matching(
    messages: &Arc<Mutex<VecDeque<QueuedMessage>>>,
    filter: Option<&MessageFilter>,
) -> Option<QueuedMessage> {
    let mut messages = messages.lock();
    match filter {
        None => messages.pop_front(),
        Some(f) => {
            let pos = messages.iter().position(|m| f.matches(m))?;
            messages.remove(pos)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition_with(messages: &[&str]) -> MemoryPartition {
        let partition = MemoryPartition::new(DestinationName::from("orders"));
        for m in messages {
            partition.enqueue(QueuedMessage::new(m.as_bytes().to_vec()));
        }
        partition
    }

    #[test]
    fn browse_does_not_consume() {
        let partition = partition_with(&["a", "b"]);
        let mut cursor = partition.browse_cursor(None).unwrap();
        assert!(cursor.next().unwrap().is_some());
        assert!(cursor.next().unwrap().is_some());
        assert!(cursor.next().unwrap().is_none());
        assert_eq!(partition.len(), 2);
    }

    #[test]
    fn consuming_cursor_removes_messages() {
        let partition = partition_with(&["a", "b"]);
        let mut cursor = partition.consuming_cursor(None).unwrap();
        assert!(cursor.next().unwrap().is_some());
        assert_eq!(partition.len(), 1);
        cursor.release();
        assert!(cursor.next().unwrap().is_none());
        assert_eq!(partition.len(), 1);
    }

    #[test]
    fn filtered_consume_skips_non_matching() {
        let partition = partition_with(&[]);
        partition.enqueue(QueuedMessage::new(b"plain".as_slice()));
        partition.enqueue(QueuedMessage::with_property(
            b"red".as_slice(),
            "color",
            "red",
        ));

        let filter = MessageFilter::parse("color=red").unwrap();
        let mut cursor = partition.consuming_cursor(Some(&filter)).unwrap();
        let got = cursor.next().unwrap().unwrap();
        assert_eq!(got.payload, bytes::Bytes::from_static(b"red"));
        assert_eq!(partition.len(), 1);
    }
}
