//! Stream prioritization (RFC 7540 §5.3, retained by RFC 9113 §5.3.2 for
//! peers that still send PRIORITY).
//!
//! The scheduler decides which streams get bytes when the flow controller
//! has a budget to spend. It only sees a [`Streamable`] snapshot of each
//! stream; the flow controller owns the actual queues and windows.

mod queue;
mod wfq;

pub use queue::{IndexedQueue, NOT_IN_QUEUE, QueueOrder};
pub use wfq::{
    DEFAULT_WEIGHT, MAX_WEIGHT, MIN_WEIGHT, PriorityNode, WeightedFairQueueDistributor,
};

use crate::h2::StreamId;

/// What the scheduler needs to know about a stream's send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Streamable {
    pub stream_id: StreamId,
    pub pending_bytes: usize,
    /// At least one unit is queued, possibly of size zero.
    pub has_frame: bool,
    pub window: i32,
}

impl Streamable {
    pub const fn idle(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            pending_bytes: 0,
            has_frame: false,
            window: 0,
        }
    }

    /// Bytes that could be written right now.
    pub fn streamable_bytes(&self) -> usize {
        if self.window <= 0 {
            0
        } else {
            self.pending_bytes.min(self.window as usize)
        }
    }

    /// Eligible for allocation: something is queued and the window is not
    /// negative. A zero window still lets empty frames out.
    pub fn is_active(&self) -> bool {
        self.has_frame && self.window >= 0
    }
}
