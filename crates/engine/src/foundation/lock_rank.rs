//! Debug-only lock-order checking
//!
//! The engine has one cross-object lock-order contract: a consumer-group
//! lock is always acquired before the shared ready-consumer-point lock,
//! and the attachment-table lock before the remote-partition-map lock.
//! Ranks encode that hierarchy; acquiring a lock whose rank is not
//! strictly greater than the highest rank already held panics in debug
//! builds. Release builds compile the checks away.

#[cfg(debug_assertions)]
use std::cell::RefCell;

/// Lock ranks, lowest acquired first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockRank {
    /// Attachment table of a gathering dispatcher
    AttachmentTable = 1,
    /// Remote-partition map
    PartitionMap = 2,
    /// Per-consumer-group (gathering key) lock
    ConsumerGroup = 3,
    /// Shared ready-consumer-point lock
    ReadyPoint = 4,
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
}

/// Guard recording a rank as held for the current thread
///
/// Create one immediately after acquiring the corresponding lock and keep
/// it alive for the critical section.
#[must_use]
pub struct RankGuard {
    #[cfg(debug_assertions)]
    rank: LockRank,
}

/// Record acquisition of a lock with the given rank
pub fn acquire(rank: LockRank) -> RankGuard {
    #[cfg(debug_assertions)]
    {
        HELD.with(|held| {
            let held = held.borrow();
            if let Some(top) = held.last() {
                assert!(
                    *top < rank,
                    "lock order violation: acquiring {rank:?} while holding {top:?}"
                );
            }
        });
        HELD.with(|held| held.borrow_mut().push(rank));
        RankGuard { rank }
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = rank;
        RankGuard {}
    }
}

#[cfg(debug_assertions)]
impl Drop for RankGuard {
    fn drop(&mut self) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|r| *r == self.rank) {
                held.remove(pos);
            }
        });
    }
}
