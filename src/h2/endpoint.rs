//! One side's view of stream-id allocation and stream limits.

use crate::error::{Error, H2Error};
use crate::h2::stream::StreamState;
use crate::h2::{MAX_STREAM_ID, StreamId};

/// Which endpoint of the connection a stream was created by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

/// Stream-id counters and limits of one endpoint.
///
/// The server endpoint allocates even ids starting at 2, the client odd ids
/// starting at 1 (RFC 9113 §5.1.1).
#[derive(Debug)]
pub struct Endpoint {
    side: Side,
    server: bool,
    next_stream_id_to_create: StreamId,
    next_reservation_stream_id: StreamId,
    last_stream_known_by_peer: Option<StreamId>,
    push_to_allowed: bool,
    max_active_streams: usize,
    max_reserved_streams: usize,
    max_streams: usize,
    num_active_streams: usize,
    num_streams: usize,
}

impl Endpoint {
    pub(crate) fn new(side: Side, server: bool, max_reserved_streams: usize) -> Self {
        let (next, reservation) = if server { (2, 0) } else { (1, 1) };
        Self {
            side,
            server,
            next_stream_id_to_create: next,
            next_reservation_stream_id: reservation,
            last_stream_known_by_peer: None,
            // A client can be pushed to by default, a server never.
            push_to_allowed: !server,
            max_active_streams: usize::MAX,
            max_reserved_streams,
            max_streams: usize::MAX,
            num_active_streams: 0,
            num_streams: 0,
        }
    }

    /// Which end of the connection this is.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Whether this endpoint creates even-numbered streams.
    pub fn is_server(&self) -> bool {
        self.server
    }

    /// Whether `stream_id` has the parity of streams this endpoint creates.
    pub fn is_valid_stream_id(&self, stream_id: StreamId) -> bool {
        stream_id > 0 && stream_id <= MAX_STREAM_ID && self.server == (stream_id & 1 == 0)
    }

    /// Whether `stream_id` is ours and at or below the last one created.
    pub fn may_have_created_stream(&self, stream_id: StreamId) -> bool {
        self.is_valid_stream_id(stream_id) && stream_id <= self.last_stream_created()
    }

    /// Highest id this endpoint has created so far, or 0.
    pub fn last_stream_created(&self) -> StreamId {
        if self.next_stream_id_to_create > 1 {
            self.next_stream_id_to_create - 2
        } else {
            0
        }
    }

    /// Id the next locally initiated stream should use.
    pub fn next_stream_id(&self) -> StreamId {
        self.next_stream_id_to_create
    }

    /// Allocate an id for a push reservation or a new stream.
    pub fn increment_and_get_next_stream_id(&mut self) -> Result<StreamId, Error> {
        if self.next_reservation_stream_id <= MAX_STREAM_ID {
            self.next_reservation_stream_id += 2;
        }
        if self.next_reservation_stream_id > MAX_STREAM_ID {
            return Err(Error::connection(
                H2Error::RefusedStream,
                "stream ids exhausted for this endpoint",
            ));
        }
        Ok(self.next_reservation_stream_id)
    }

    pub(crate) fn increment_expected_stream_id(&mut self, stream_id: StreamId) {
        if stream_id > self.next_reservation_stream_id {
            self.next_reservation_stream_id = stream_id;
        }
        self.next_stream_id_to_create = stream_id.saturating_add(2);
    }

    /// No stream ids are left to create.
    pub fn is_exhausted(&self) -> bool {
        self.next_stream_id_to_create > MAX_STREAM_ID
    }

    /// Whether another stream fits under the active limit.
    pub fn can_open_stream(&self) -> bool {
        self.num_active_streams < self.max_active_streams
    }

    /// Active streams created by this endpoint.
    pub fn num_active_streams(&self) -> usize {
        self.num_active_streams
    }

    /// Streams created by this endpoint and not yet closed, reserved included.
    pub fn num_streams(&self) -> usize {
        self.num_streams
    }

    /// Limit on concurrently active streams (SETTINGS_MAX_CONCURRENT_STREAMS).
    pub fn max_active_streams(&self) -> usize {
        self.max_active_streams
    }

    /// Limit on streams reserved by PUSH_PROMISE.
    pub fn max_reserved_streams(&self) -> usize {
        self.max_reserved_streams
    }

    /// Change the active limit. Existing streams are not closed.
    pub fn set_max_active_streams(&mut self, max_active_streams: usize) {
        self.max_active_streams = max_active_streams;
        self.update_max_streams();
    }

    /// Change the reservation limit.
    pub fn set_max_reserved_streams(&mut self, max_reserved_streams: usize) {
        self.max_reserved_streams = max_reserved_streams;
        self.update_max_streams();
    }

    fn update_max_streams(&mut self) {
        self.max_streams = self
            .max_active_streams
            .saturating_add(self.max_reserved_streams);
    }

    /// Whether the peer may push to this endpoint.
    pub fn allows_push_to(&self) -> bool {
        self.push_to_allowed
    }

    /// Whether the peer may push to this endpoint (SETTINGS_ENABLE_PUSH).
    pub fn allow_push_to(&mut self, allow: bool) -> Result<(), Error> {
        if allow && self.server {
            return Err(Error::InvalidArgument("servers do not allow push"));
        }
        self.push_to_allowed = allow;
        Ok(())
    }

    /// Last id the peer said it would process, from a GOAWAY.
    pub fn last_stream_known_by_peer(&self) -> Option<StreamId> {
        self.last_stream_known_by_peer
    }

    pub(crate) fn set_last_stream_known_by_peer(&mut self, stream_id: StreamId) {
        self.last_stream_known_by_peer = Some(stream_id);
    }

    pub(crate) fn stream_added(&mut self) {
        self.num_streams += 1;
    }

    pub(crate) fn stream_closed(&mut self) {
        self.num_streams = self.num_streams.saturating_sub(1);
    }

    pub(crate) fn stream_activated(&mut self) {
        self.num_active_streams += 1;
    }

    pub(crate) fn stream_deactivated(&mut self) {
        self.num_active_streams = self.num_active_streams.saturating_sub(1);
    }

    /// Admission check for a new stream in `state`.
    ///
    /// Id and parity violations are connection errors, limit violations are
    /// stream errors so only the new stream gets refused.
    pub(crate) fn check_new_stream_allowed(
        &self,
        stream_id: StreamId,
        state: StreamState,
        connection_closed: bool,
    ) -> Result<(), Error> {
        if let Some(last) = self.last_stream_known_by_peer
            && stream_id > last
        {
            return Err(Error::stream(
                stream_id,
                H2Error::RefusedStream,
                "cannot create stream greater than last stream id from GOAWAY",
            ));
        }
        if !self.is_valid_stream_id(stream_id) {
            if stream_id > MAX_STREAM_ID {
                return Err(Error::connection(
                    H2Error::RefusedStream,
                    "stream ids exhausted for this endpoint",
                ));
            }
            return Err(Error::connection(
                H2Error::ProtocolError,
                "stream id has the wrong parity for this endpoint",
            ));
        }
        if stream_id < self.next_stream_id_to_create {
            return Err(Error::connection(
                H2Error::ProtocolError,
                "stream id is not greater than the last created stream",
            ));
        }
        if self.is_exhausted() {
            return Err(Error::connection(
                H2Error::RefusedStream,
                "stream ids exhausted for this endpoint",
            ));
        }
        let reserved = matches!(state, StreamState::ReservedLocal | StreamState::ReservedRemote);
        let within_limits = if reserved {
            self.num_streams < self.max_streams
        } else {
            self.can_open_stream()
        };
        if !within_limits {
            return Err(Error::stream(
                stream_id,
                H2Error::RefusedStream,
                "maximum active streams violated for this endpoint",
            ));
        }
        if connection_closed {
            return Err(Error::connection(
                H2Error::InternalError,
                "attempted to create stream after connection was closed",
            ));
        }
        Ok(())
    }
}
