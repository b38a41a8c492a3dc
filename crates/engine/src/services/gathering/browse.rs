//! Gathering browse cursor
//!
//! Composes the local partition's cursor with one remote browse cursor per
//! reachable node. Order is part of the contract: the local partition is
//! always consulted first, then each remote in a fixed order, and the
//! first non-empty cursor wins.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

use crate::error::EngineResult;
use crate::foundation::traits::MessageCursor;
use crate::foundation::types::QueuedMessage;
use crate::services::anycast::cursor::BrowseCursor;
use crate::services::anycast::service::RemoteConsumerAccess;

/// One component cursor of a gathering browse
pub(crate) enum GatheringLeg {
    /// The destination's local partition
    Local(Mutex<Box<dyn MessageCursor>>),
    /// A partition hosted by a remote node
    Remote(Arc<BrowseCursor>),
}

/// Browse across one local and N remote partitions as a single cursor
pub struct GatheringBrowseCursor {
    legs: Vec<GatheringLeg>,
    access: Arc<dyn RemoteConsumerAccess>,
}

impl GatheringBrowseCursor {
    pub(crate) fn new(legs: Vec<GatheringLeg>, access: Arc<dyn RemoteConsumerAccess>) -> Self {
        Self { legs, access }
    }

    /// Number of component cursors
    pub fn width(&self) -> usize {
        self.legs.len()
    }

    /// Pull the next message: local first, then each remote in order
    ///
    /// Each component is consulted at most once per call; `Ok(None)` means
    /// every component was empty.
    pub async fn next(&self) -> EngineResult<Option<QueuedMessage>> {
        for leg in &self.legs {
            let message = match leg {
                GatheringLeg::Local(cursor) => cursor.lock().next()?,
                GatheringLeg::Remote(cursor) => {
                    if !cursor.is_open() {
                        continue;
                    }
                    cursor.next().await?
                }
            };
            if message.is_some() {
                return Ok(message);
            }
        }
        Ok(None)
    }

    /// Close every component cursor
    ///
    /// Best effort: every component is closed even if one fails, and the
    /// first failure is surfaced afterwards rather than swallowed.
    pub async fn finished(&self) -> EngineResult<()> {
        let mut first_error = None;
        for leg in &self.legs {
            match leg {
                GatheringLeg::Local(cursor) => cursor.lock().release(),
                GatheringLeg::Remote(cursor) => {
                    if let Err(e) = self.access.finish_browse(cursor.browse_id()).await {
                        warn!("Component browse close failed: {}", e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
