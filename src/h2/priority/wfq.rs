//! Weighted fair queue over the stream dependency tree.
//!
//! Every node carries a pseudo time to write. At each level of the tree the
//! child with the smallest pseudo time is served next, and serving `n` bytes
//! advances it by `n * total_queued_weight / weight`. Heavier children
//! therefore advance slower and are picked more often, which approximates
//! weighted max-min fairness in steps of `allocation_quantum` bytes.
//!
//! Nodes live in an id-keyed arena and reference each other by id. A node
//! may outlive its stream: closed streams that still matter for priority are
//! kept in a bounded retention queue and evicted lowest-priority first.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::mem;

use tracing::trace;

use super::Streamable;
use super::queue::{IndexedQueue, NOT_IN_QUEUE, QueueOrder};
use crate::error::{Error, H2Error};
use crate::h2::{CONNECTION_STREAM_ID, StreamId};

pub const DEFAULT_WEIGHT: u16 = 16;
pub const MIN_WEIGHT: u16 = 1;
pub const MAX_WEIGHT: u16 = 256;

const ACTIVE: u8 = 0x1;
const DISTRIBUTING: u8 = 0x2;
const STREAM_RESERVED_OR_ACTIVATED: u8 = 0x4;

/// One node of the dependency tree.
#[derive(Debug)]
pub struct PriorityNode {
    stream_id: StreamId,
    parent: Option<StreamId>,
    children: BTreeSet<StreamId>,
    /// Children with an active descendant, ordered by pseudo time to write.
    pseudo_time_queue: IndexedQueue,
    streamable_bytes: usize,
    depth: usize,
    /// Active nodes in this subtree, including this one.
    active_count_for_tree: usize,
    pseudo_time_queue_index: usize,
    state_only_queue_index: usize,
    pseudo_time_to_write: u64,
    /// Bytes distributed through this node so far.
    pseudo_time: u64,
    total_queued_weights: u64,
    weight: u16,
    flags: u8,
    has_stream: bool,
}

impl PriorityNode {
    fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            parent: None,
            children: BTreeSet::new(),
            pseudo_time_queue: IndexedQueue::new(),
            streamable_bytes: 0,
            depth: 0,
            active_count_for_tree: 0,
            pseudo_time_queue_index: NOT_IN_QUEUE,
            state_only_queue_index: NOT_IN_QUEUE,
            pseudo_time_to_write: 0,
            pseudo_time: 0,
            total_queued_weights: 0,
            weight: DEFAULT_WEIGHT,
            flags: 0,
            has_stream: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn parent(&self) -> Option<StreamId> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.children.iter().copied()
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    pub fn weight(&self) -> u16 {
        self.weight
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn streamable_bytes(&self) -> usize {
        self.streamable_bytes
    }

    pub fn active_count_for_tree(&self) -> usize {
        self.active_count_for_tree
    }

    pub fn is_active(&self) -> bool {
        self.flags & ACTIVE != 0
    }

    /// Whether a stream object is currently attached.
    pub fn has_stream(&self) -> bool {
        self.has_stream
    }

    fn is_distributing(&self) -> bool {
        self.flags & DISTRIBUTING != 0
    }

    fn was_stream_reserved_or_activated(&self) -> bool {
        self.flags & STREAM_RESERVED_OR_ACTIVATED != 0
    }
}

/// Eviction order of retained nodes: the head is dropped first. Nodes that
/// never carried data outrank ones that did, then shallower nodes, then
/// higher ids.
fn state_only_cmp(a: &PriorityNode, b: &PriorityNode) -> Ordering {
    let a_used = a.was_stream_reserved_or_activated();
    if a_used != b.was_stream_reserved_or_activated() {
        return if a_used {
            Ordering::Less
        } else {
            Ordering::Greater
        };
    }
    b.depth
        .cmp(&a.depth)
        .then(a.stream_id.cmp(&b.stream_id))
}

struct PseudoTimeOrder<'a>(&'a mut BTreeMap<StreamId, PriorityNode>);

impl QueueOrder for PseudoTimeOrder<'_> {
    fn precedes(&self, a: StreamId, b: StreamId) -> bool {
        match (self.0.get(&a), self.0.get(&b)) {
            (Some(a), Some(b)) => a.pseudo_time_to_write < b.pseudo_time_to_write,
            _ => false,
        }
    }

    fn index_of(&self, id: StreamId) -> usize {
        self.0
            .get(&id)
            .map_or(NOT_IN_QUEUE, |n| n.pseudo_time_queue_index)
    }

    fn set_index(&mut self, id: StreamId, index: usize) {
        if let Some(node) = self.0.get_mut(&id) {
            node.pseudo_time_queue_index = index;
        }
    }
}

struct StateOnlyOrder<'a>(&'a mut BTreeMap<StreamId, PriorityNode>);

impl QueueOrder for StateOnlyOrder<'_> {
    fn precedes(&self, a: StreamId, b: StreamId) -> bool {
        match (self.0.get(&a), self.0.get(&b)) {
            (Some(a), Some(b)) => state_only_cmp(a, b) == Ordering::Less,
            _ => false,
        }
    }

    fn index_of(&self, id: StreamId) -> usize {
        self.0
            .get(&id)
            .map_or(NOT_IN_QUEUE, |n| n.state_only_queue_index)
    }

    fn set_index(&mut self, id: StreamId, index: usize) {
        if let Some(node) = self.0.get_mut(&id) {
            node.state_only_queue_index = index;
        }
    }
}

/// Byte distributor over the dependency tree.
#[derive(Debug)]
pub struct WeightedFairQueueDistributor {
    nodes: BTreeMap<StreamId, PriorityNode>,
    /// Nodes without a stream, kept for late PRIORITY frames.
    state_only_queue: IndexedQueue,
    max_state_only_size: usize,
    allocation_quantum: usize,
}

impl WeightedFairQueueDistributor {
    pub fn new(max_state_only_size: usize, allocation_quantum: usize) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(CONNECTION_STREAM_ID, PriorityNode::new(CONNECTION_STREAM_ID));
        Self {
            nodes,
            state_only_queue: IndexedQueue::new(),
            max_state_only_size,
            allocation_quantum: allocation_quantum.max(1),
        }
    }

    pub fn allocation_quantum(&self) -> usize {
        self.allocation_quantum
    }

    pub fn set_allocation_quantum(&mut self, quantum: usize) -> Result<(), Error> {
        if quantum == 0 {
            return Err(Error::InvalidArgument("allocation quantum must be positive"));
        }
        self.allocation_quantum = quantum;
        Ok(())
    }

    pub fn node(&self, stream_id: StreamId) -> Option<&PriorityNode> {
        self.nodes.get(&stream_id)
    }

    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.nodes.contains_key(&stream_id)
    }

    pub fn parent_of(&self, stream_id: StreamId) -> Option<StreamId> {
        self.nodes.get(&stream_id)?.parent
    }

    pub fn weight_of(&self, stream_id: StreamId) -> Option<u16> {
        self.nodes.get(&stream_id).map(|n| n.weight)
    }

    pub fn children_of(&self, stream_id: StreamId) -> Vec<StreamId> {
        self.nodes
            .get(&stream_id)
            .map(|n| n.children().collect())
            .unwrap_or_default()
    }

    pub fn is_child(&self, child: StreamId, parent: StreamId, weight: u16) -> bool {
        self.nodes
            .get(&child)
            .is_some_and(|n| n.parent == Some(parent) && n.weight == weight)
            && self
                .nodes
                .get(&parent)
                .is_some_and(|p| p.children.contains(&child))
    }

    /// Nodes currently retained without a stream.
    pub fn num_retained(&self) -> usize {
        self.state_only_queue.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    // ------------------------------------------------------------------
    // Stream lifecycle hooks
    // ------------------------------------------------------------------

    pub fn on_stream_added(&mut self, stream_id: StreamId, reserved: bool) {
        if self.nodes.contains_key(&stream_id) {
            self.state_only_queue
                .remove(&mut StateOnlyOrder(&mut self.nodes), stream_id);
        } else {
            self.nodes.insert(stream_id, PriorityNode::new(stream_id));
            let mut events = Vec::with_capacity(1);
            self.take_child(CONNECTION_STREAM_ID, stream_id, false, &mut events);
            self.notify_parent_changed(&events);
        }
        if let Some(node) = self.nodes.get_mut(&stream_id) {
            node.has_stream = true;
            if reserved {
                node.flags |= STREAM_RESERVED_OR_ACTIVATED;
            }
        }
    }

    pub fn on_stream_active(&mut self, stream_id: StreamId) {
        if let Some(node) = self.nodes.get_mut(&stream_id) {
            node.flags |= STREAM_RESERVED_OR_ACTIVATED;
        }
    }

    pub fn on_stream_closed(&mut self, stream_id: StreamId) {
        self.set_streamable(stream_id, 0, false);
        if let Some(node) = self.nodes.get_mut(&stream_id) {
            node.has_stream = false;
        }
    }

    /// Retain the node if there is room or it outranks the lowest retained
    /// node, otherwise drop it from the tree.
    pub fn on_stream_removed(&mut self, stream_id: StreamId) {
        let Some(node) = self.nodes.get_mut(&stream_id) else {
            return;
        };
        node.has_stream = false;
        if self.max_state_only_size == 0 {
            self.discard(stream_id);
            return;
        }
        if self.state_only_queue.len() >= self.max_state_only_size {
            let Some(lowest) = self.state_only_queue.peek() else {
                return;
            };
            let keep_new = match (self.nodes.get(&lowest), self.nodes.get(&stream_id)) {
                (Some(lowest), Some(removed)) => state_only_cmp(lowest, removed) == Ordering::Less,
                _ => false,
            };
            if !keep_new {
                self.discard(stream_id);
                return;
            }
            self.state_only_queue
                .pop(&mut StateOnlyOrder(&mut self.nodes));
            trace!(stream_id = lowest, "evicting retained priority node");
            self.discard(lowest);
        }
        self.state_only_queue
            .push(&mut StateOnlyOrder(&mut self.nodes), stream_id);
    }

    fn discard(&mut self, stream_id: StreamId) {
        if let Some(parent) = self.parent_of(stream_id) {
            self.remove_child(parent, stream_id);
        }
        self.state_only_queue
            .remove(&mut StateOnlyOrder(&mut self.nodes), stream_id);
        self.nodes.remove(&stream_id);
    }

    // ------------------------------------------------------------------
    // Tree maintenance
    // ------------------------------------------------------------------

    /// Make `child` depend on `parent` with `weight`. With `exclusive`,
    /// the parent's other children move under `child`.
    pub fn update_dependency_tree(
        &mut self,
        child: StreamId,
        parent: StreamId,
        weight: u16,
        exclusive: bool,
    ) -> Result<(), Error> {
        if child == CONNECTION_STREAM_ID {
            return Err(Error::InvalidArgument("the connection stream has no parent"));
        }
        if child == parent {
            return Err(Error::stream(
                child,
                H2Error::ProtocolError,
                "a stream cannot depend on itself",
            ));
        }
        if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&weight) {
            return Err(Error::InvalidArgument("weight must be between 1 and 256"));
        }

        if !self.nodes.contains_key(&child) {
            if self.max_state_only_size == 0 {
                return Ok(());
            }
            self.nodes.insert(child, PriorityNode::new(child));
            self.state_only_queue
                .push(&mut StateOnlyOrder(&mut self.nodes), child);
        }

        if !self.nodes.contains_key(&parent) {
            if self.max_state_only_size == 0 {
                return Ok(());
            }
            self.nodes.insert(parent, PriorityNode::new(parent));
            self.state_only_queue
                .push(&mut StateOnlyOrder(&mut self.nodes), parent);
            let mut events = Vec::with_capacity(1);
            self.take_child(CONNECTION_STREAM_ID, parent, false, &mut events);
            self.notify_parent_changed(&events);
        }

        let Some(node) = self.nodes.get_mut(&child) else {
            return Ok(());
        };
        let old_parent = node.parent;
        let old_weight = node.weight;
        let queued = node.active_count_for_tree != 0;
        node.weight = weight;
        // Only queued nodes count toward the parent's queued weight.
        if queued
            && let Some(p) = old_parent.and_then(|p| self.nodes.get_mut(&p))
        {
            p.total_queued_weights =
                p.total_queued_weights.saturating_sub(u64::from(old_weight)) + u64::from(weight);
        }

        let parent_children = self.nodes.get(&parent).map_or(0, |p| p.children.len());
        if old_parent != Some(parent) || (exclusive && parent_children != 1) {
            let mut events = Vec::new();
            if self.is_descendant_of(parent, child)
                && let Some(old_parent) = old_parent
            {
                self.take_child(old_parent, parent, false, &mut events);
            }
            self.take_child(parent, child, exclusive, &mut events);
            self.notify_parent_changed(&events);
        }

        // Depth feeds the eviction order, so evict only after re-parenting.
        while self.state_only_queue.len() > self.max_state_only_size {
            let Some(evicted) = self
                .state_only_queue
                .pop(&mut StateOnlyOrder(&mut self.nodes))
            else {
                break;
            };
            trace!(stream_id = evicted, "evicting retained priority node");
            self.discard(evicted);
        }
        Ok(())
    }

    fn is_descendant_of(&self, node: StreamId, ancestor: StreamId) -> bool {
        let mut next = self.parent_of(node);
        while let Some(id) = next {
            if id == ancestor {
                return true;
            }
            next = self.parent_of(id);
        }
        false
    }

    fn take_child(
        &mut self,
        parent: StreamId,
        child: StreamId,
        exclusive: bool,
        events: &mut Vec<StreamId>,
    ) {
        let old_parent = self.parent_of(child);
        if old_parent != Some(parent) {
            events.push(child);
            self.set_parent(child, Some(parent));
            if let Some(old) = old_parent.and_then(|p| self.nodes.get_mut(&p)) {
                old.children.remove(&child);
            }
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.insert(child);
            }
        }

        if !exclusive {
            return;
        }
        // Counts along the new chains must be whole before the siblings move.
        let settled = mem::take(events);
        self.notify_parent_changed(&settled);

        let Some(p) = self.nodes.get_mut(&parent) else {
            return;
        };
        let mut former = mem::take(&mut p.children);
        if former.remove(&child) {
            p.children.insert(child);
        }
        for grandchild in former {
            events.push(grandchild);
            self.set_parent(grandchild, Some(child));
            if let Some(c) = self.nodes.get_mut(&child) {
                c.children.insert(grandchild);
            }
        }
    }

    /// Detach `child` from `parent`; its children move up to `parent` with
    /// their weights scaled by the removed node's share.
    fn remove_child(&mut self, parent: StreamId, child: StreamId) {
        let removed = self
            .nodes
            .get_mut(&parent)
            .is_some_and(|p| p.children.remove(&child));
        if !removed {
            return;
        }
        let mut events = vec![child];
        self.set_parent(child, None);

        let grandchildren = self.children_of(child);
        if !grandchildren.is_empty() {
            let total_weight: u64 = grandchildren
                .iter()
                .filter_map(|g| self.weight_of(*g))
                .map(u64::from)
                .sum();
            let child_weight = u64::from(self.weight_of(child).unwrap_or(DEFAULT_WEIGHT));
            for grandchild in grandchildren {
                if let Some(g) = self.nodes.get_mut(&grandchild) {
                    let scaled = u64::from(g.weight) * child_weight / total_weight.max(1);
                    g.weight = scaled.clamp(1, u64::from(MAX_WEIGHT)) as u16;
                }
                self.take_child(parent, grandchild, false, &mut events);
            }
        }
        self.notify_parent_changed(&events);
    }

    fn set_parent(&mut self, child: StreamId, new_parent: Option<StreamId>) {
        let Some(node) = self.nodes.get(&child) else {
            return;
        };
        let count = node.active_count_for_tree;
        // A subtree without active nodes is not in its parent's queue.
        if count != 0
            && let Some(old) = node.parent
        {
            self.remove_pseudo_time_queue(old, child);
            self.active_count_change_for_tree(old, -(count as isize));
        }
        let depth = new_parent
            .and_then(|p| self.nodes.get(&p))
            .map_or(usize::MAX, |p| p.depth.saturating_add(1));
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = new_parent;
            node.depth = depth;
        }
    }

    fn notify_parent_changed(&mut self, events: &[StreamId]) {
        for &id in events {
            self.state_only_queue
                .priority_changed(&mut StateOnlyOrder(&mut self.nodes), id);
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            let count = node.active_count_for_tree;
            if count != 0
                && let Some(parent) = node.parent
            {
                self.offer_and_initialize_pseudo_time(parent, id);
                self.active_count_change_for_tree(parent, count as isize);
            }
        }
    }

    // ------------------------------------------------------------------
    // Activity tracking
    // ------------------------------------------------------------------

    /// Refresh a stream's streamable bytes after its queue or window changed.
    pub fn update_streamable_bytes(&mut self, streamable: &Streamable) {
        self.set_streamable(
            streamable.stream_id,
            streamable.streamable_bytes(),
            streamable.is_active(),
        );
    }

    fn set_streamable(&mut self, stream_id: StreamId, bytes: usize, active: bool) {
        let Some(node) = self.nodes.get(&stream_id) else {
            return;
        };
        if node.is_active() != active {
            self.active_count_change_for_tree(stream_id, if active { 1 } else { -1 });
        }
        if let Some(node) = self.nodes.get_mut(&stream_id) {
            if active {
                node.flags |= ACTIVE;
            } else {
                node.flags &= !ACTIVE;
            }
            node.streamable_bytes = bytes;
        }
    }

    /// Apply `increment` to the active count of `stream_id` and every
    /// ancestor, queueing or dequeuing subtrees that change emptiness.
    fn active_count_change_for_tree(&mut self, stream_id: StreamId, increment: isize) {
        let mut current = stream_id;
        loop {
            let Some(node) = self.nodes.get_mut(&current) else {
                return;
            };
            node.active_count_for_tree = node.active_count_for_tree.saturating_add_signed(increment);
            let count = node.active_count_for_tree;
            let distributing = node.is_distributing();
            let Some(parent) = node.parent else {
                return;
            };
            if count == 0 {
                self.remove_pseudo_time_queue(parent, current);
            } else if count as isize == increment && !distributing {
                // A polled node is re-offered once distribution unwinds.
                self.offer_and_initialize_pseudo_time(parent, current);
            }
            current = parent;
        }
    }

    // ------------------------------------------------------------------
    // Pseudo-time queues
    // ------------------------------------------------------------------

    fn with_pseudo_time_queue<R>(
        &mut self,
        parent: StreamId,
        f: impl FnOnce(&mut IndexedQueue, &mut PseudoTimeOrder<'_>) -> R,
    ) -> Option<R> {
        let mut queue = mem::take(&mut self.nodes.get_mut(&parent)?.pseudo_time_queue);
        let result = f(&mut queue, &mut PseudoTimeOrder(&mut self.nodes));
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.pseudo_time_queue = queue;
        }
        Some(result)
    }

    fn offer_and_initialize_pseudo_time(&mut self, parent: StreamId, child: StreamId) {
        let Some(pseudo_time) = self.nodes.get(&parent).map(|p| p.pseudo_time) else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(&child) {
            node.pseudo_time_to_write = pseudo_time;
        }
        self.offer_pseudo_time_queue(parent, child);
    }

    fn offer_pseudo_time_queue(&mut self, parent: StreamId, child: StreamId) {
        let weight = u64::from(self.weight_of(child).unwrap_or(DEFAULT_WEIGHT));
        let pushed = self
            .with_pseudo_time_queue(parent, |q, order| q.push(order, child))
            .unwrap_or(false);
        if pushed && let Some(p) = self.nodes.get_mut(&parent) {
            p.total_queued_weights += weight;
        }
    }

    fn poll_pseudo_time_queue(&mut self, parent: StreamId) -> Option<StreamId> {
        let child = self.with_pseudo_time_queue(parent, |q, order| q.pop(order))??;
        let weight = u64::from(self.weight_of(child).unwrap_or(DEFAULT_WEIGHT));
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.total_queued_weights = p.total_queued_weights.saturating_sub(weight);
        }
        Some(child)
    }

    fn remove_pseudo_time_queue(&mut self, parent: StreamId, child: StreamId) {
        let weight = u64::from(self.weight_of(child).unwrap_or(DEFAULT_WEIGHT));
        let removed = self
            .with_pseudo_time_queue(parent, |q, order| q.remove(order, child))
            .unwrap_or(false);
        if removed && let Some(p) = self.nodes.get_mut(&parent) {
            p.total_queued_weights = p.total_queued_weights.saturating_sub(weight);
        }
    }

    // ------------------------------------------------------------------
    // Distribution
    // ------------------------------------------------------------------

    /// Hand out up to `max_bytes` across active streams.
    ///
    /// `writer(stream_id, n)` must write `n` bytes for that stream and return
    /// its refreshed queue state. Keeps going past an exhausted budget while
    /// progress is made, so zero-length frames still go out. Returns whether
    /// any stream is still active afterwards.
    pub fn distribute(
        &mut self,
        max_bytes: usize,
        writer: &mut dyn FnMut(StreamId, usize) -> Result<Streamable, Error>,
    ) -> Result<bool, Error> {
        if self.active_count(CONNECTION_STREAM_ID) == 0 {
            return Ok(false);
        }
        let mut remaining = max_bytes;
        loop {
            let before = self.active_count(CONNECTION_STREAM_ID);
            let queue_empty = self
                .nodes
                .get(&CONNECTION_STREAM_ID)
                .is_none_or(|c| c.pseudo_time_queue.is_empty());
            if queue_empty {
                break;
            }
            let sent = self.distribute_to_children(remaining, CONNECTION_STREAM_ID, writer)?;
            remaining = remaining.saturating_sub(sent);
            let after = self.active_count(CONNECTION_STREAM_ID);
            if after == 0 || (remaining == 0 && before == after) {
                break;
            }
        }
        Ok(self.active_count(CONNECTION_STREAM_ID) != 0)
    }

    fn active_count(&self, stream_id: StreamId) -> usize {
        self.nodes
            .get(&stream_id)
            .map_or(0, |n| n.active_count_for_tree)
    }

    fn distribute_node(
        &mut self,
        max_bytes: usize,
        stream_id: StreamId,
        writer: &mut dyn FnMut(StreamId, usize) -> Result<Streamable, Error>,
    ) -> Result<usize, Error> {
        let Some(node) = self.nodes.get(&stream_id) else {
            return Ok(0);
        };
        if !node.is_active() {
            return self.distribute_to_children(max_bytes, stream_id, writer);
        }
        let nsent = max_bytes.min(node.streamable_bytes);
        let streamable = writer(stream_id, nsent)?;
        self.update_streamable_bytes(&streamable);
        if nsent == 0 && max_bytes != 0 {
            // It had its chance to write empty frames; park it until its
            // queue or window changes so descendants can use the bytes.
            let bytes = self.nodes.get(&stream_id).map_or(0, |n| n.streamable_bytes);
            self.set_streamable(stream_id, bytes, false);
        }
        Ok(nsent)
    }

    fn distribute_to_children(
        &mut self,
        max_bytes: usize,
        parent: StreamId,
        writer: &mut dyn FnMut(StreamId, usize) -> Result<Streamable, Error>,
    ) -> Result<usize, Error> {
        let Some(old_total) = self.nodes.get(&parent).map(|p| p.total_queued_weights) else {
            return Ok(0);
        };
        let Some(child) = self.poll_pseudo_time_queue(parent) else {
            return Ok(0);
        };
        let next = self
            .nodes
            .get(&parent)
            .and_then(|p| p.pseudo_time_queue.peek());

        let (child_ptw, child_weight) = match self.nodes.get_mut(&child) {
            Some(node) => {
                node.flags |= DISTRIBUTING;
                (node.pseudo_time_to_write, u64::from(node.weight))
            }
            None => return Ok(0),
        };
        let budget = match next.and_then(|n| self.nodes.get(&n)) {
            Some(next) => {
                let gap = next.pseudo_time_to_write.saturating_sub(child_ptw);
                let share = gap.saturating_mul(child_weight) / old_total.max(1)
                    + self.allocation_quantum as u64;
                max_bytes.min(usize::try_from(share).unwrap_or(usize::MAX))
            }
            None => max_bytes,
        };

        let result = self.distribute_node(budget, child, writer);

        if let Ok(nsent) = result {
            let nsent = nsent as u64;
            let parent_pseudo_time = match self.nodes.get_mut(&parent) {
                Some(p) => {
                    p.pseudo_time += nsent;
                    p.pseudo_time
                }
                None => 0,
            };
            if let Some(node) = self.nodes.get_mut(&child) {
                node.pseudo_time_to_write = node.pseudo_time_to_write.min(parent_pseudo_time)
                    + nsent * old_total / u64::from(node.weight.max(1));
            }
        }
        let still_active = match self.nodes.get_mut(&child) {
            Some(node) => {
                node.flags &= !DISTRIBUTING;
                node.active_count_for_tree != 0
            }
            None => false,
        };
        // Re-offer on the way back up so equal pseudo times take turns.
        if still_active {
            self.offer_pseudo_time_queue(parent, child);
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
