//! HTTP/2 stream state machine (RFC 9113 §5.1).
//!
//! ```text
//!                          +--------+
//!                  send PP |        | recv PP
//!                 ,--------+  idle  +--------.
//!                /         |        |         \
//!               v          +--------+          v
//!        +----------+          |           +----------+
//!        |          |          | send H /  |          |
//! ,------+ reserved |          | recv H    | reserved +------.
//! |      | (local)  |          |           | (remote) |      |
//! |      +---+------+          v           +------+---+      |
//! |          |             +--------+             |          |
//! |          |     recv ES |        | send ES     |          |
//! |   send H |     ,-------+  open  +-------.     | recv H   |
//! |          |    /        |        |        \    |          |
//! |          v   v         +---+----+         v   v          |
//! |      +----------+          |           +----------+      |
//! |      |   half-  |          |           |   half-  |      |
//! |      |  closed  |          | send R /  |  closed  |      |
//! |      | (remote) |          | recv R    | (local)  |      |
//! |      +----+-----+          |           +-----+----+      |
//! |           |                |                 |           |
//! |           | send ES /      |       recv ES / |           |
//! |           |  send R /      v        send R / |           |
//! |           |  recv R    +--------+   recv R   |           |
//! | send R /  `----------->|        |<-----------'  send R / |
//! | recv R                 | closed |               recv R   |
//! `----------------------->|        |<-----------------------'
//!                          +--------+
//! ```
//!
//! Transitions that need the rest of the connection (counters, the active
//! set, listeners) live on [`H2Connection`](super::H2Connection); this module
//! only holds the per-stream data.

use core::any::Any;

use crate::error::{Error, H2Error};
use crate::h2::StreamId;
use crate::h2::property::{ConnectionId, PropertyKey, PropertyMap};

/// HTTP/2 stream states (RFC 9113 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// Whether we may still send on this stream.
    pub fn local_side_open(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Whether the peer may still send on this stream.
    pub fn remote_side_open(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// States that count towards the active-stream set.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            StreamState::Open | StreamState::HalfClosedLocal | StreamState::HalfClosedRemote
        )
    }

    /// State reached when a stream in `self` is opened by HEADERS.
    ///
    /// `local` is true when the stream is created by the local endpoint.
    /// A half-closed open means END_STREAM travelled with those HEADERS.
    pub fn activated(self, stream_id: StreamId, local: bool, half_closed: bool) -> Result<Self, Error> {
        match self {
            StreamState::Idle if half_closed => Ok(if local {
                StreamState::HalfClosedLocal
            } else {
                StreamState::HalfClosedRemote
            }),
            StreamState::Idle => Ok(StreamState::Open),
            StreamState::ReservedLocal => Ok(StreamState::HalfClosedRemote),
            StreamState::ReservedRemote => Ok(StreamState::HalfClosedLocal),
            _ => Err(Error::stream(
                stream_id,
                H2Error::ProtocolError,
                "attempting to open a stream in an invalid state",
            )),
        }
    }
}

const META_RESET_SENT: u8 = 0x01;
const META_HEADERS_SENT: u8 = 0x02;
const META_TRAILERS_SENT: u8 = 0x04;
const META_PUSH_PROMISE_SENT: u8 = 0x08;
const META_HEADERS_RECEIVED: u8 = 0x10;
const META_TRAILERS_RECEIVED: u8 = 0x20;

/// An HTTP/2 stream.
///
/// Stream 0 is the virtual connection stream. It lives in the stream map so
/// that lookups and property storage work uniformly, but it never changes
/// state and is rejected by every lifecycle operation.
#[derive(Debug)]
pub struct H2Stream {
    id: StreamId,
    state: StreamState,
    flags: u8,
    properties: PropertyMap,
}

impl H2Stream {
    pub(crate) fn new(id: StreamId, state: StreamState, owner: ConnectionId) -> Self {
        Self {
            id,
            state,
            flags: 0,
            properties: PropertyMap::new(owner),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: StreamState) {
        self.state = state;
    }

    pub fn is_connection_stream(&self) -> bool {
        self.id == 0
    }

    // ------------------------------------------------------------------
    // Meta flags
    // ------------------------------------------------------------------

    pub fn is_reset_sent(&self) -> bool {
        self.flags & META_RESET_SENT != 0
    }

    pub fn reset_sent(&mut self) {
        self.flags |= META_RESET_SENT;
    }

    /// Record that HEADERS went out. The second non-informational block is
    /// the trailers.
    pub fn headers_sent(&mut self, informational: bool) {
        if informational {
            return;
        }
        if self.flags & META_HEADERS_SENT == 0 {
            self.flags |= META_HEADERS_SENT;
        } else {
            self.flags |= META_TRAILERS_SENT;
        }
    }

    pub fn is_headers_sent(&self) -> bool {
        self.flags & META_HEADERS_SENT != 0
    }

    pub fn is_trailers_sent(&self) -> bool {
        self.flags & META_TRAILERS_SENT != 0
    }

    pub fn headers_received(&mut self, informational: bool) {
        if informational {
            return;
        }
        if self.flags & META_HEADERS_RECEIVED == 0 {
            self.flags |= META_HEADERS_RECEIVED;
        } else {
            self.flags |= META_TRAILERS_RECEIVED;
        }
    }

    pub fn is_headers_received(&self) -> bool {
        self.flags & META_HEADERS_RECEIVED != 0
    }

    pub fn is_trailers_received(&self) -> bool {
        self.flags & META_TRAILERS_RECEIVED != 0
    }

    pub fn push_promise_sent(&mut self) {
        self.flags |= META_PUSH_PROMISE_SENT;
    }

    pub fn is_push_promise_sent(&self) -> bool {
        self.flags & META_PUSH_PROMISE_SENT != 0
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub fn set_property<T: Any>(&mut self, key: &PropertyKey, value: T) -> Result<Option<T>, Error> {
        self.properties.set(key, value)
    }

    pub fn property<T: Any>(&self, key: &PropertyKey) -> Result<Option<&T>, Error> {
        self.properties.get(key)
    }

    pub fn property_mut<T: Any>(&mut self, key: &PropertyKey) -> Result<Option<&mut T>, Error> {
        self.properties.get_mut(key)
    }

    pub fn remove_property<T: Any>(&mut self, key: &PropertyKey) -> Result<Option<T>, Error> {
        self.properties.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_opens_to_open() {
        let s = StreamState::Idle.activated(1, true, false).unwrap();
        assert_eq!(s, StreamState::Open);
        assert!(s.local_side_open());
        assert!(s.remote_side_open());
    }

    #[test]
    fn half_closed_open_depends_on_side() {
        assert_eq!(
            StreamState::Idle.activated(1, true, true).unwrap(),
            StreamState::HalfClosedLocal
        );
        assert_eq!(
            StreamState::Idle.activated(2, false, true).unwrap(),
            StreamState::HalfClosedRemote
        );
    }

    #[test]
    fn reserved_streams_open_half_closed() {
        assert_eq!(
            StreamState::ReservedLocal.activated(2, true, false).unwrap(),
            StreamState::HalfClosedRemote
        );
        assert_eq!(
            StreamState::ReservedRemote.activated(2, false, false).unwrap(),
            StreamState::HalfClosedLocal
        );
    }

    #[test]
    fn open_from_closed_is_stream_error() {
        let err = StreamState::Closed.activated(7, true, false).unwrap_err();
        assert!(err.is_stream_error());
        assert_eq!(err.code(), H2Error::ProtocolError);
        assert!(StreamState::Open.activated(7, true, false).is_err());
    }

    #[test]
    fn half_closed_sides() {
        assert!(!StreamState::HalfClosedLocal.local_side_open());
        assert!(StreamState::HalfClosedLocal.remote_side_open());
        assert!(StreamState::HalfClosedRemote.local_side_open());
        assert!(!StreamState::HalfClosedRemote.remote_side_open());
        assert!(!StreamState::ReservedLocal.is_active());
        assert!(!StreamState::Closed.is_active());
    }

    #[test]
    fn second_headers_are_trailers() {
        let mut s = H2Stream::new(1, StreamState::Open, ConnectionId::next());
        s.headers_sent(true);
        assert!(!s.is_headers_sent());
        s.headers_sent(false);
        assert!(s.is_headers_sent());
        assert!(!s.is_trailers_sent());
        s.headers_sent(false);
        assert!(s.is_trailers_sent());

        s.headers_received(false);
        s.headers_received(false);
        assert!(s.is_headers_received());
        assert!(s.is_trailers_received());
    }

    #[test]
    fn reset_and_push_flags() {
        let mut s = H2Stream::new(2, StreamState::ReservedLocal, ConnectionId::next());
        assert!(!s.is_reset_sent());
        s.reset_sent();
        s.push_promise_sent();
        assert!(s.is_reset_sent());
        assert!(s.is_push_promise_sent());
        assert!(!s.is_connection_stream());
    }
}
