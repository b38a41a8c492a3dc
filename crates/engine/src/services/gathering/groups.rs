//! Ordering-group membership
//!
//! Group records live in an arena indexed by the logical consumer-set
//! handle. A record exists only while it has members: the last member's
//! detach removes it, so the arena never grows without bound.

use std::collections::{HashMap, HashSet};

use crate::services::gathering::attachment::ConsumerSetId;
use crate::services::gathering::keys::ConsumerKeyId;

struct GroupRecord {
    handle: ConsumerSetId,
    members: HashSet<ConsumerKeyId>,
}

/// Arena of ordering-group records plus a handle index
#[derive(Default)]
pub struct OrderingGroupArena {
    records: Vec<Option<GroupRecord>>,
    free: Vec<usize>,
    index: HashMap<ConsumerSetId, usize>,
}

impl OrderingGroupArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member to a group, creating the group record if needed
    pub fn add_member(&mut self, handle: ConsumerSetId, member: ConsumerKeyId) {
        let slot = match self.index.get(&handle) {
            Some(slot) => *slot,
            None => {
                let record = GroupRecord {
                    handle,
                    members: HashSet::new(),
                };
                let slot = match self.free.pop() {
                    Some(slot) => {
                        self.records[slot] = Some(record);
                        slot
                    }
                    None => {
                        self.records.push(Some(record));
                        self.records.len() - 1
                    }
                };
                self.index.insert(handle, slot);
                slot
            }
        };
        if let Some(record) = self.records[slot].as_mut() {
            record.members.insert(member);
        }
    }

    /// Remove a member; the group record goes away with its last member
    pub fn remove_member(&mut self, handle: ConsumerSetId, member: &ConsumerKeyId) {
        let Some(slot) = self.index.get(&handle).copied() else {
            return;
        };
        let emptied = match self.records[slot].as_mut() {
            Some(record) => {
                record.members.remove(member);
                record.members.is_empty()
            }
            None => false,
        };
        if emptied {
            let handle = self.records[slot].take().map(|r| r.handle);
            if let Some(handle) = handle {
                self.index.remove(&handle);
            }
            self.free.push(slot);
        }
    }

    /// Number of members in a group, zero when absent
    pub fn member_count(&self, handle: ConsumerSetId) -> usize {
        self.index
            .get(&handle)
            .and_then(|slot| self.records[*slot].as_ref())
            .map(|record| record.members.len())
            .unwrap_or(0)
    }

    /// Number of live group records
    pub fn group_count(&self) -> usize {
        self.index.len()
    }

    /// Arena capacity in slots (live plus reusable)
    pub fn slot_count(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_member_detach_removes_the_group() {
        let mut arena = OrderingGroupArena::new();
        let group = ConsumerSetId::new();
        let a = ConsumerKeyId::new();
        let b = ConsumerKeyId::new();

        arena.add_member(group, a);
        arena.add_member(group, b);
        assert_eq!(arena.member_count(group), 2);

        arena.remove_member(group, &a);
        assert_eq!(arena.group_count(), 1);

        arena.remove_member(group, &b);
        assert_eq!(arena.group_count(), 0);
        assert_eq!(arena.member_count(group), 0);
    }

    #[test]
    fn slots_are_reused_after_group_removal() {
        let mut arena = OrderingGroupArena::new();

        for _ in 0..10 {
            let group = ConsumerSetId::new();
            let member = ConsumerKeyId::new();
            arena.add_member(group, member);
            arena.remove_member(group, &member);
        }

        assert_eq!(arena.group_count(), 0);
        assert_eq!(arena.slot_count(), 1);
    }

    #[test]
    fn removing_unknown_members_is_harmless() {
        let mut arena = OrderingGroupArena::new();
        let group = ConsumerSetId::new();
        arena.remove_member(group, &ConsumerKeyId::new());
        assert_eq!(arena.group_count(), 0);
    }
}
