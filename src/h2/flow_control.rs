//! HTTP/2 outbound flow control (RFC 9113 §5.2, §6.9).
//!
//! Every stream carries a [`FlowState`] in its property bag: the send window
//! granted by the peer and a FIFO of queued write units. The connection has
//! one more `FlowState` for the connection-level window. When bytes may be
//! written, [`RemoteFlowController`] asks the priority scheduler how to split
//! the budget and drains each stream's queue accordingly.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::fmt;

use tracing::{debug, error, warn};

use crate::error::{Error, H2Error};
use crate::h2::active::ActiveStreams;
use crate::h2::config::{ConnectionConfig, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};
use crate::h2::flow_controlled::FlowControlled;
use crate::h2::io::FrameWriter;
use crate::h2::listener::WritabilityListener;
use crate::h2::priority::{Streamable, WeightedFairQueueDistributor};
use crate::h2::property::PropertyKey;
use crate::h2::stream::StreamState;
use crate::h2::{StreamId, StreamMap};

/// Bytes moved by one `write_allocated_bytes` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriteOutcome {
    /// Bytes handed to the writer.
    pub written: usize,
    /// Queued bytes discarded because a write failed.
    pub dropped: usize,
}

/// Send-side flow-control state of one stream, or of the connection.
pub struct FlowState {
    stream_id: StreamId,
    /// Signed: a SETTINGS change can push it below zero.
    window: i32,
    pending_bytes: usize,
    queue: VecDeque<Box<dyn FlowControlled>>,
    marked_writable: bool,
    cancelled: bool,
}

impl fmt::Debug for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowState")
            .field("stream_id", &self.stream_id)
            .field("window", &self.window)
            .field("pending_bytes", &self.pending_bytes)
            .field("queued", &self.queue.len())
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

impl FlowState {
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            window: 0,
            pending_bytes: 0,
            queue: VecDeque::new(),
            marked_writable: false,
            cancelled: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn window(&self) -> i32 {
        self.window
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn has_frame(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_writable(&self) -> bool {
        i64::from(self.window) > self.pending_bytes as i64 && !self.cancelled
    }

    pub(crate) fn streamable(&self) -> Streamable {
        Streamable {
            stream_id: self.stream_id,
            pending_bytes: self.pending_bytes,
            has_frame: self.has_frame(),
            window: self.window,
        }
    }

    pub(crate) fn set_window(&mut self, window: i32) {
        self.window = window;
    }

    /// Apply a signed window delta. Overflow past 2^31-1 is a
    /// FLOW_CONTROL_ERROR, scoped to the connection for stream 0.
    pub fn increment_window(&mut self, delta: i32) -> Result<(), Error> {
        self.window = self.checked_window(delta).ok_or(Error::for_stream(
            self.stream_id,
            H2Error::FlowControlError,
            "window size overflow",
        ))?;
        Ok(())
    }

    fn checked_window(&self, delta: i32) -> Option<i32> {
        let next = i64::from(self.window) + i64::from(delta);
        if next > i64::from(MAX_WINDOW_SIZE) {
            return None;
        }
        i32::try_from(next).ok()
    }

    /// Queue `unit`, merging it into the tail when possible. Returns the
    /// increase in pending bytes.
    pub(crate) fn enqueue(&mut self, mut unit: Box<dyn FlowControlled>) -> Result<usize, Error> {
        if self.cancelled {
            let err = Error::stream(
                self.stream_id,
                H2Error::StreamClosed,
                "stream closed before write could take place",
            );
            unit.error(&err);
            return Err(err);
        }
        if let Some(last) = self.queue.back_mut() {
            let before = last.size();
            if last.merge(unit.as_mut()) {
                let added = last.size().saturating_sub(before);
                self.pending_bytes += added;
                return Ok(added);
            }
        }
        let added = unit.size();
        self.pending_bytes += added;
        self.queue.push_back(unit);
        Ok(added)
    }

    /// Write up to `allocated` bytes from the head of the queue, bounded by
    /// this window and the connection window.
    pub(crate) fn write_allocated_bytes(
        &mut self,
        allocated: usize,
        connection: &mut FlowState,
        writer: &mut dyn FrameWriter,
    ) -> WriteOutcome {
        let mut allocated = allocated;
        let mut outcome = WriteOutcome::default();
        let mut failure = None;

        while !self.cancelled {
            let writable_window = self.window.min(connection.window).max(0) as usize;
            let Some(unit) = self.queue.front_mut() else {
                break;
            };
            let max_bytes = allocated.min(writable_window);
            if max_bytes == 0 && unit.size() > 0 {
                break;
            }

            let before = unit.size();
            let result = unit.write(writer, max_bytes);
            let written = before.saturating_sub(unit.size());
            let finished = unit.size() == 0;
            allocated = allocated.saturating_sub(written);
            self.consume(written, connection);
            outcome.written += written;

            match result {
                Ok(()) if finished => {
                    if let Some(mut done) = self.queue.pop_front() {
                        done.write_complete();
                    }
                }
                Ok(()) => {}
                Err(e) => {
                    warn!(stream_id = self.stream_id, error = %e, "flow-controlled write failed");
                    self.cancelled = true;
                    failure = Some(e);
                }
            }
        }

        if let Some(cause) = failure {
            outcome.dropped = self.cancel_with(&cause);
            debug!(stream_id = self.stream_id, cause = %cause, dropped = outcome.dropped, "queue cancelled after write failure");
        }
        outcome
    }

    fn consume(&mut self, written: usize, connection: &mut FlowState) {
        let n = i32::try_from(written).unwrap_or(i32::MAX);
        self.window = self.window.saturating_sub(n);
        connection.window = connection.window.saturating_sub(n);
        self.pending_bytes = self.pending_bytes.saturating_sub(written);
    }

    /// Fail every queued unit. Returns the pending bytes that were dropped.
    pub(crate) fn cancel(&mut self, code: H2Error) -> usize {
        let err = Error::stream(
            self.stream_id,
            code,
            "stream closed before write could take place",
        );
        self.cancel_with(&err)
    }

    /// Fail every queued unit with `cause`.
    pub(crate) fn cancel_with(&mut self, cause: &Error) -> usize {
        self.cancelled = true;
        let mut dropped = 0;
        while let Some(mut unit) = self.queue.pop_front() {
            let size = unit.size();
            dropped += size;
            self.pending_bytes = self.pending_bytes.saturating_sub(size);
            unit.error(cause);
        }
        dropped
    }
}

fn flow_state_mut<'a>(
    streams: &'a mut StreamMap,
    key: &PropertyKey,
    stream_id: StreamId,
) -> Option<&'a mut FlowState> {
    streams
        .get_mut(&stream_id)?
        .property_mut::<FlowState>(key)
        .ok()
        .flatten()
}

/// Outbound flow control for one connection.
///
/// Stream state is reached through the connection's stream map, so every
/// operation takes the map (and the active set when it needs to visit all
/// active streams) from the owning [`H2Connection`](super::H2Connection).
pub struct RemoteFlowController {
    key: PropertyKey,
    connection: FlowState,
    distributor: WeightedFairQueueDistributor,
    initial_window_size: i32,
    total_pending_bytes: usize,
    channel_writable: bool,
    in_write_pending_bytes: bool,
    min_writable_chunk: usize,
    listener: Option<Box<dyn WritabilityListener>>,
}

impl fmt::Debug for RemoteFlowController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFlowController")
            .field("connection", &self.connection)
            .field("initial_window_size", &self.initial_window_size)
            .field("total_pending_bytes", &self.total_pending_bytes)
            .field("channel_writable", &self.channel_writable)
            .finish()
    }
}

impl RemoteFlowController {
    pub(crate) fn new(key: PropertyKey, config: &ConnectionConfig) -> Self {
        let mut connection = FlowState::new(0);
        connection.set_window(DEFAULT_WINDOW_SIZE);
        Self {
            key,
            connection,
            distributor: WeightedFairQueueDistributor::new(
                config.max_state_only_size,
                config.allocation_quantum,
            ),
            initial_window_size: config.initial_window_size,
            total_pending_bytes: 0,
            channel_writable: true,
            in_write_pending_bytes: false,
            min_writable_chunk: config.min_writable_chunk,
            listener: None,
        }
    }

    pub fn distributor(&self) -> &WeightedFairQueueDistributor {
        &self.distributor
    }

    pub(crate) fn distributor_mut(&mut self) -> &mut WeightedFairQueueDistributor {
        &mut self.distributor
    }

    pub fn initial_window_size(&self) -> i32 {
        self.initial_window_size
    }

    pub fn connection_window_size(&self) -> i32 {
        self.connection.window
    }

    pub fn total_pending_bytes(&self) -> usize {
        self.total_pending_bytes
    }

    pub(crate) fn set_listener(&mut self, listener: Option<Box<dyn WritabilityListener>>) {
        self.listener = listener;
    }

    // ------------------------------------------------------------------
    // Stream lifecycle hooks
    // ------------------------------------------------------------------

    pub(crate) fn on_stream_added(&mut self, streams: &mut StreamMap, stream_id: StreamId) {
        let Some(stream) = streams.get_mut(&stream_id) else {
            return;
        };
        let reserved = matches!(
            stream.state(),
            StreamState::ReservedLocal | StreamState::ReservedRemote
        );
        if let Err(e) = stream.set_property(&self.key, FlowState::new(stream_id)) {
            error!(stream_id, error = %e, "failed to attach flow state");
        }
        self.distributor.on_stream_added(stream_id, reserved);
    }

    pub(crate) fn on_stream_active(
        &mut self,
        streams: &mut StreamMap,
        active: &ActiveStreams,
        stream_id: StreamId,
    ) {
        self.distributor.on_stream_active(stream_id);
        let key = self.key;
        let initial = self.initial_window_size;
        if let Some(state) = flow_state_mut(streams, &key, stream_id) {
            state.set_window(initial);
            self.distributor.update_streamable_bytes(&state.streamable());
        }
        self.check_connection_then_stream(streams, active, stream_id);
    }

    pub(crate) fn on_stream_half_closed(
        &mut self,
        streams: &mut StreamMap,
        active: &ActiveStreams,
        stream_id: StreamId,
    ) {
        let half_closed_local = streams
            .get(&stream_id)
            .is_some_and(|s| s.state() == StreamState::HalfClosedLocal);
        if half_closed_local {
            self.cancel(streams, active, stream_id, H2Error::StreamClosed);
        }
    }

    pub(crate) fn on_stream_closed(
        &mut self,
        streams: &mut StreamMap,
        active: &ActiveStreams,
        stream_id: StreamId,
    ) {
        self.cancel(streams, active, stream_id, H2Error::StreamClosed);
        self.distributor.on_stream_closed(stream_id);
    }

    pub(crate) fn on_stream_removed(&mut self, streams: &mut StreamMap, stream_id: StreamId) {
        let key = self.key;
        let state = streams
            .get_mut(&stream_id)
            .and_then(|s| s.remove_property::<FlowState>(&key).ok().flatten());
        if let Some(mut state) = state {
            // Reserved streams are never closed through the active set.
            let dropped = state.cancel(H2Error::StreamClosed);
            self.total_pending_bytes = self.total_pending_bytes.saturating_sub(dropped);
        }
        self.distributor.on_stream_removed(stream_id);
    }

    // ------------------------------------------------------------------
    // Application API
    // ------------------------------------------------------------------

    /// Queue `unit` on `stream_id`. On failure the unit's error callback has
    /// already been invoked.
    pub(crate) fn add_flow_controlled(
        &mut self,
        streams: &mut StreamMap,
        active: &ActiveStreams,
        stream_id: StreamId,
        mut unit: Box<dyn FlowControlled>,
    ) -> Result<(), Error> {
        let key = self.key;
        let Some(state) = flow_state_mut(streams, &key, stream_id) else {
            let err = Error::StreamNotFound(stream_id);
            unit.error(&err);
            return Err(err);
        };
        let added = state.enqueue(unit)?;
        self.total_pending_bytes += added;
        self.distributor.update_streamable_bytes(&state.streamable());
        self.check_connection_then_stream(streams, active, stream_id);
        Ok(())
    }

    pub(crate) fn has_flow_controlled(&self, streams: &StreamMap, stream_id: StreamId) -> bool {
        streams
            .get(&stream_id)
            .and_then(|s| s.property::<FlowState>(&self.key).ok().flatten())
            .is_some_and(FlowState::has_frame)
    }

    pub(crate) fn window_size(&self, streams: &StreamMap, stream_id: StreamId) -> Option<i32> {
        if stream_id == 0 {
            return Some(self.connection.window);
        }
        streams
            .get(&stream_id)?
            .property::<FlowState>(&self.key)
            .ok()
            .flatten()
            .map(FlowState::window)
    }

    pub(crate) fn increment_window_size(
        &mut self,
        streams: &mut StreamMap,
        active: &ActiveStreams,
        stream_id: StreamId,
        delta: i32,
    ) -> Result<(), Error> {
        if stream_id == 0 {
            self.connection.increment_window(delta)?;
            if self.is_writable_connection() != self.connection.marked_writable {
                self.check_all_writability_changed(streams, active);
            }
            return Ok(());
        }
        let key = self.key;
        let state = flow_state_mut(streams, &key, stream_id).ok_or(Error::StreamNotFound(stream_id))?;
        state.increment_window(delta)?;
        self.distributor.update_streamable_bytes(&state.streamable());
        self.notify_if_changed(state);
        Ok(())
    }

    /// Re-base every active stream's window by the change in the initial
    /// window (SETTINGS_INITIAL_WINDOW_SIZE).
    pub(crate) fn set_initial_window_size(
        &mut self,
        streams: &mut StreamMap,
        active: &ActiveStreams,
        new_window_size: i32,
    ) -> Result<(), Error> {
        if new_window_size < 0 {
            return Err(Error::InvalidArgument("initial window size must not be negative"));
        }
        let delta = new_window_size - self.initial_window_size;
        let key = self.key;

        // Nothing changes unless every stream can take the delta.
        let overflows = active.iter().any(|stream_id| {
            streams
                .get(&stream_id)
                .and_then(|s| s.property::<FlowState>(&key).ok().flatten())
                .is_some_and(|state| state.checked_window(delta).is_none())
        });
        if overflows {
            return Err(Error::connection(
                H2Error::FlowControlError,
                "initial window change overflowed a stream window",
            ));
        }

        self.initial_window_size = new_window_size;
        for stream_id in active.iter() {
            let Some(state) = flow_state_mut(streams, &key, stream_id) else {
                continue;
            };
            state.increment_window(delta)?;
            self.distributor.update_streamable_bytes(&state.streamable());
        }

        if self.is_writable_connection() {
            self.check_all_writability_changed(streams, active);
        }
        Ok(())
    }

    /// Distribute the writable budget across active streams until it is
    /// spent, nothing is left to write, or the transport fills up.
    pub(crate) fn write_pending_bytes(
        &mut self,
        streams: &mut StreamMap,
        active: &ActiveStreams,
        writer: &mut dyn FrameWriter,
    ) -> Result<(), Error> {
        // Nested calls are no-ops.
        if self.in_write_pending_bytes {
            return Ok(());
        }
        self.in_write_pending_bytes = true;
        self.channel_writable = writer.is_writable();
        let result = self.distribute_writable_bytes(streams, writer);
        self.in_write_pending_bytes = false;
        self.channel_writable = writer.is_writable();
        self.check_all_writability_changed(streams, active);
        result
    }

    fn distribute_writable_bytes(
        &mut self,
        streams: &mut StreamMap,
        writer: &mut dyn FrameWriter,
    ) -> Result<(), Error> {
        let key = self.key;
        let mut budget = self.writable_bytes(writer);
        loop {
            let connection = &mut self.connection;
            let total_pending = &mut self.total_pending_bytes;
            let more = self.distributor.distribute(budget, &mut |stream_id: StreamId, allocated: usize| {
                let Some(state) = flow_state_mut(streams, &key, stream_id) else {
                    return Ok(Streamable::idle(stream_id));
                };
                let outcome = state.write_allocated_bytes(allocated, connection, &mut *writer);
                *total_pending = total_pending.saturating_sub(outcome.written + outcome.dropped);
                Ok(state.streamable())
            })?;
            if !more {
                break;
            }
            budget = self.writable_bytes(writer);
            if budget == 0 || !writer.is_writable() {
                break;
            }
        }
        Ok(())
    }

    /// min(connection window, transport capacity floored at the minimum chunk).
    fn writable_bytes(&self, writer: &dyn FrameWriter) -> usize {
        let window = self.connection.window.max(0) as usize;
        let channel = writer.bytes_before_unwritable();
        let usable = if channel > 0 {
            channel.max(self.min_writable_chunk)
        } else {
            0
        };
        window.min(usable)
    }

    // ------------------------------------------------------------------
    // Writability
    // ------------------------------------------------------------------

    pub(crate) fn is_writable(&self, streams: &StreamMap, stream_id: StreamId) -> bool {
        if stream_id == 0 {
            return self.is_writable_connection();
        }
        self.is_writable_connection()
            && streams
                .get(&stream_id)
                .and_then(|s| s.property::<FlowState>(&self.key).ok().flatten())
                .is_some_and(FlowState::is_writable)
    }

    fn is_writable_connection(&self) -> bool {
        i64::from(self.connection.window) - self.total_pending_bytes as i64 > 0
            && self.channel_writable
    }

    pub(crate) fn channel_writability_changed(
        &mut self,
        streams: &mut StreamMap,
        active: &ActiveStreams,
        writable: bool,
    ) {
        self.channel_writable = writable;
        if self.connection.marked_writable != self.is_writable_connection() {
            self.check_all_writability_changed(streams, active);
        }
    }

    fn cancel(
        &mut self,
        streams: &mut StreamMap,
        active: &ActiveStreams,
        stream_id: StreamId,
        code: H2Error,
    ) {
        let key = self.key;
        let Some(state) = flow_state_mut(streams, &key, stream_id) else {
            return;
        };
        let dropped = state.cancel(code);
        self.total_pending_bytes = self.total_pending_bytes.saturating_sub(dropped);
        self.distributor.update_streamable_bytes(&state.streamable());
        self.check_connection_then_stream(streams, active, stream_id);
    }

    fn notify_if_changed(&mut self, state: &mut FlowState) {
        let writable = self.is_writable_connection() && state.is_writable();
        if writable == state.marked_writable {
            return;
        }
        state.marked_writable = writable;
        if let Some(listener) = self.listener.as_mut() {
            listener.writability_changed(state.stream_id, writable);
        }
    }

    fn check_connection_then_stream(
        &mut self,
        streams: &mut StreamMap,
        active: &ActiveStreams,
        stream_id: StreamId,
    ) {
        if self.is_writable_connection() != self.connection.marked_writable {
            self.check_all_writability_changed(streams, active);
            return;
        }
        let key = self.key;
        if let Some(state) = flow_state_mut(streams, &key, stream_id) {
            self.notify_if_changed(state);
        }
    }

    fn check_all_writability_changed(&mut self, streams: &mut StreamMap, active: &ActiveStreams) {
        self.connection.marked_writable = self.is_writable_connection();
        let key = self.key;
        for stream_id in active.iter() {
            if let Some(state) = flow_state_mut(streams, &key, stream_id) {
                self.notify_if_changed(state);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
