//! Binary heap of stream ids whose positions are stored on the nodes.
//!
//! A priority node can sit in two unrelated queues at once, so instead of
//! the heap owning its elements it stores ids and asks a [`QueueOrder`] for
//! the ordering and for the node's index slot in that particular queue.
//! Removal and re-prioritization are O(log n) without any lookup table.

use alloc::vec::Vec;

use crate::h2::StreamId;

/// Index value of a node that is not in the queue.
pub const NOT_IN_QUEUE: usize = usize::MAX;

/// Ordering and index storage for one kind of queue.
pub trait QueueOrder {
    /// Whether `a` must be dequeued before `b`.
    fn precedes(&self, a: StreamId, b: StreamId) -> bool;
    fn index_of(&self, id: StreamId) -> usize;
    fn set_index(&mut self, id: StreamId, index: usize);
}

#[derive(Debug, Default, Clone)]
pub struct IndexedQueue {
    heap: Vec<StreamId>,
}

impl IndexedQueue {
    pub const fn new() -> Self {
        Self { heap: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn peek(&self) -> Option<StreamId> {
        self.heap.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.heap.iter().copied()
    }

    pub fn contains<O: QueueOrder>(&self, order: &O, id: StreamId) -> bool {
        let index = order.index_of(id);
        self.heap.get(index) == Some(&id)
    }

    /// Returns false if `id` was already queued.
    pub fn push<O: QueueOrder>(&mut self, order: &mut O, id: StreamId) -> bool {
        if self.contains(order, id) {
            return false;
        }
        self.heap.push(id);
        let index = self.heap.len() - 1;
        order.set_index(id, index);
        self.bubble_up(order, index);
        true
    }

    pub fn pop<O: QueueOrder>(&mut self, order: &mut O) -> Option<StreamId> {
        if self.heap.is_empty() {
            return None;
        }
        let top = self.heap.swap_remove(0);
        order.set_index(top, NOT_IN_QUEUE);
        if let Some(&first) = self.heap.first() {
            order.set_index(first, 0);
            self.bubble_down(order, 0);
        }
        Some(top)
    }

    pub fn remove<O: QueueOrder>(&mut self, order: &mut O, id: StreamId) -> bool {
        if !self.contains(order, id) {
            return false;
        }
        let index = order.index_of(id);
        self.heap.swap_remove(index);
        order.set_index(id, NOT_IN_QUEUE);
        if let Some(&moved) = self.heap.get(index) {
            order.set_index(moved, index);
            self.restore(order, index);
        }
        true
    }

    /// Re-sort `id` after its ordering key changed. No-op if not queued.
    pub fn priority_changed<O: QueueOrder>(&mut self, order: &mut O, id: StreamId) {
        if self.contains(order, id) {
            let index = order.index_of(id);
            self.restore(order, index);
        }
    }

    fn restore<O: QueueOrder>(&mut self, order: &mut O, index: usize) {
        if index > 0 && order.precedes(self.heap[index], self.heap[(index - 1) / 2]) {
            self.bubble_up(order, index);
        } else {
            self.bubble_down(order, index);
        }
    }

    fn bubble_up<O: QueueOrder>(&mut self, order: &mut O, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !order.precedes(self.heap[index], self.heap[parent]) {
                break;
            }
            self.swap(order, index, parent);
            index = parent;
        }
    }

    fn bubble_down<O: QueueOrder>(&mut self, order: &mut O, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut best = left;
            if right < len && order.precedes(self.heap[right], self.heap[left]) {
                best = right;
            }
            if !order.precedes(self.heap[best], self.heap[index]) {
                break;
            }
            self.swap(order, index, best);
            index = best;
        }
    }

    fn swap<O: QueueOrder>(&mut self, order: &mut O, a: usize, b: usize) {
        self.heap.swap(a, b);
        order.set_index(self.heap[a], a);
        order.set_index(self.heap[b], b);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
