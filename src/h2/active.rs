//! Active-stream set with reentrancy-safe iteration.
//!
//! While a traversal is in progress (`pending_iterations > 0`), activations
//! and deactivations are queued instead of applied. The connection replays
//! the queue once the last traversal finishes, so visitors can close or open
//! streams without invalidating the iteration.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::h2::StreamId;

/// A structural change that arrived during a traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingAction {
    Activate(StreamId),
    Deactivate(StreamId),
}

#[derive(Debug, Default)]
pub(crate) struct ActiveStreams {
    /// Active ids in activation order.
    streams: Vec<StreamId>,
    pending: VecDeque<PendingAction>,
    pending_iterations: usize,
}

impl ActiveStreams {
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn get(&self, index: usize) -> Option<StreamId> {
        self.streams.get(index).copied()
    }

    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.streams.contains(&stream_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.streams.iter().copied()
    }

    pub fn allow_modifications(&self) -> bool {
        self.pending_iterations == 0
    }

    /// Returns false if the id was already present.
    pub fn insert(&mut self, stream_id: StreamId) -> bool {
        if self.contains(stream_id) {
            return false;
        }
        self.streams.push(stream_id);
        true
    }

    /// Returns false if the id was not present.
    pub fn remove(&mut self, stream_id: StreamId) -> bool {
        match self.streams.iter().position(|&id| id == stream_id) {
            Some(pos) => {
                self.streams.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn defer(&mut self, action: PendingAction) {
        self.pending.push_back(action);
    }

    pub fn begin_iteration(&mut self) {
        self.pending_iterations += 1;
    }

    pub fn end_iteration(&mut self) {
        self.pending_iterations = self.pending_iterations.saturating_sub(1);
    }

    /// Next deferred action, only once no traversal is running.
    pub fn next_pending(&mut self) -> Option<PendingAction> {
        if !self.allow_modifications() {
            return None;
        }
        self.pending.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_activation_order() {
        let mut active = ActiveStreams::default();
        assert!(active.insert(5));
        assert!(active.insert(1));
        assert!(!active.insert(5));
        assert_eq!(active.iter().collect::<Vec<_>>(), [5, 1]);
        assert!(active.remove(5));
        assert!(!active.remove(5));
        assert_eq!(active.get(0), Some(1));
    }

    #[test]
    fn pending_actions_wait_for_iterations() {
        let mut active = ActiveStreams::default();
        active.begin_iteration();
        active.begin_iteration();
        assert!(!active.allow_modifications());
        active.defer(PendingAction::Deactivate(3));
        assert_eq!(active.next_pending(), None);

        active.end_iteration();
        assert_eq!(active.next_pending(), None);
        active.end_iteration();
        assert_eq!(active.next_pending(), Some(PendingAction::Deactivate(3)));
        assert_eq!(active.next_pending(), None);
    }
}
