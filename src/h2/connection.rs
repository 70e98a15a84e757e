//! HTTP/2 connection state (RFC 9113 §5).
//!
//! [`H2Connection`] owns the stream map, the two endpoints, the active set
//! and the outbound flow controller. It is sans-io: callers feed it parsed
//! frame events (see [`on_frame`](H2Connection::on_frame)) and drain outbound
//! frames through a [`FrameWriter`].
//!
//! Closing streams from inside [`for_each_active_stream`] is safe: changes to
//! the active set are deferred until the outermost traversal finishes.
//!
//! [`for_each_active_stream`]: H2Connection::for_each_active_stream

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use tracing::{debug, error, trace};

use super::active::{ActiveStreams, PendingAction};
use super::config::{ConnectionConfig, Role};
use super::endpoint::{Endpoint, Side};
use super::flow_control::RemoteFlowController;
use super::flow_controlled::FlowControlled;
use super::io::FrameWriter;
use super::listener::{StreamListener, WritabilityListener};
use super::priority::WeightedFairQueueDistributor;
use super::property::{ConnectionId, PropertyKey, PropertyKeyRegistry};
use super::stream::{H2Stream, StreamState};
use super::{CONNECTION_STREAM_ID, StreamId, StreamMap};
use crate::error::{Error, H2Error};

/// One HTTP/2 connection.
pub struct H2Connection {
    id: ConnectionId,
    server: bool,
    /// All live streams, including the connection stream 0.
    streams: StreamMap,
    local: Endpoint,
    remote: Endpoint,
    active: ActiveStreams,
    keys: PropertyKeyRegistry,
    flow: RemoteFlowController,
    listeners: Vec<Box<dyn StreamListener>>,
    closing: bool,
    close_complete: bool,
}

impl fmt::Debug for H2Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H2Connection")
            .field("server", &self.server)
            .field("streams", &self.streams.len())
            .field("active", &self.active.len())
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("flow", &self.flow)
            .field("closing", &self.closing)
            .finish()
    }
}

impl H2Connection {
    pub fn new(role: Role, config: ConnectionConfig) -> Result<Self, Error> {
        config.validate()?;
        let id = ConnectionId::next();
        let server = role == Role::Server;

        let mut keys = PropertyKeyRegistry::new(id);
        let flow_key = keys.new_key()?;

        let mut streams = BTreeMap::new();
        streams.insert(
            CONNECTION_STREAM_ID,
            H2Stream::new(CONNECTION_STREAM_ID, StreamState::Idle, id),
        );

        Ok(Self {
            id,
            server,
            streams,
            local: Endpoint::new(Side::Local, server, config.max_reserved_streams),
            remote: Endpoint::new(Side::Remote, !server, config.max_reserved_streams),
            active: ActiveStreams::default(),
            keys,
            flow: RemoteFlowController::new(flow_key, &config),
            listeners: Vec::new(),
            closing: false,
            close_complete: false,
        })
    }

    /// Whether this side accepted the transport.
    pub fn is_server(&self) -> bool {
        self.server
    }

    /// Our endpoint: streams we create.
    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    /// Mutable access to our endpoint, for limits and GOAWAY state.
    pub fn local_mut(&mut self) -> &mut Endpoint {
        &mut self.local
    }

    /// The peer's endpoint: streams it creates.
    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    /// Mutable access to the peer's endpoint.
    pub fn remote_mut(&mut self) -> &mut Endpoint {
        &mut self.remote
    }

    /// Endpoint for `side`.
    pub fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    fn endpoint_mut(&mut self, side: Side) -> &mut Endpoint {
        match side {
            Side::Local => &mut self.local,
            Side::Remote => &mut self.remote,
        }
    }

    /// Endpoint whose parity `stream_id` has.
    fn created_by(&self, stream_id: StreamId) -> Side {
        if self.local.is_valid_stream_id(stream_id) {
            Side::Local
        } else {
            Side::Remote
        }
    }

    /// The stream 0 placeholder that carries connection-level state.
    pub fn connection_stream(&self) -> &H2Stream {
        // Inserted at construction and never removed.
        &self.streams[&CONNECTION_STREAM_ID]
    }

    /// Look up a stream that has not been removed yet.
    pub fn stream(&self, stream_id: StreamId) -> Option<&H2Stream> {
        self.streams.get(&stream_id)
    }

    /// Mutable lookup, e.g. to set properties.
    pub fn stream_mut(&mut self, stream_id: StreamId) -> Option<&mut H2Stream> {
        self.streams.get_mut(&stream_id)
    }

    fn live_stream_mut(&mut self, stream_id: StreamId) -> Result<&mut H2Stream, Error> {
        if stream_id == CONNECTION_STREAM_ID {
            return Err(Error::ConnectionStream);
        }
        self.streams
            .get_mut(&stream_id)
            .ok_or(Error::StreamNotFound(stream_id))
    }

    /// Streams currently in the active set.
    pub fn num_active_streams(&self) -> usize {
        self.active.len()
    }

    /// Streams in the map, not counting the connection stream.
    pub fn num_streams(&self) -> usize {
        self.streams.len() - 1
    }

    /// Whether either endpoint may have created `stream_id`, even if it is
    /// gone by now.
    pub fn stream_may_have_existed(&self, stream_id: StreamId) -> bool {
        self.remote.may_have_created_stream(stream_id) || self.local.may_have_created_stream(stream_id)
    }

    /// Whether we have sent GOAWAY.
    pub fn is_go_away_sent(&self) -> bool {
        self.remote.last_stream_known_by_peer().is_some()
    }

    /// Whether the peer has sent GOAWAY.
    pub fn is_go_away_received(&self) -> bool {
        self.local.last_stream_known_by_peer().is_some()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Closing and only the connection stream is left.
    pub fn is_close_complete(&self) -> bool {
        self.close_complete
    }

    /// Issue a key for attaching caller state to streams of this connection.
    pub fn new_property_key(&mut self) -> Result<PropertyKey, Error> {
        self.keys.new_key()
    }

    /// Register a listener for stream lifecycle events.
    pub fn add_listener(&mut self, listener: Box<dyn StreamListener>) {
        self.listeners.push(listener);
    }

    // ------------------------------------------------------------------
    // Stream creation
    // ------------------------------------------------------------------

    /// Create stream `stream_id` on `side` and activate it.
    ///
    /// With `half_closed` the creating side starts closed, as for a request
    /// that carries END_STREAM on its HEADERS.
    pub fn create_stream(
        &mut self,
        side: Side,
        stream_id: StreamId,
        half_closed: bool,
    ) -> Result<(), Error> {
        let state = StreamState::Idle.activated(stream_id, side == Side::Local, half_closed)?;
        let closing = self.closing;
        let endpoint = self.endpoint_mut(side);
        endpoint.check_new_stream_allowed(stream_id, state, closing)?;
        endpoint.increment_expected_stream_id(stream_id);
        self.add_stream(side, stream_id, state);
        self.activate(stream_id);
        Ok(())
    }

    /// Reserve `stream_id` for a push promise sent (local) or received
    /// (remote) on `parent`. The stream is not activated.
    pub fn reserve_push_stream(
        &mut self,
        side: Side,
        stream_id: StreamId,
        parent: StreamId,
    ) -> Result<(), Error> {
        let Some(parent_state) = self.streams.get(&parent).map(H2Stream::state) else {
            return Err(Error::connection(H2Error::ProtocolError, "parent stream missing"));
        };
        let parent_open = match side {
            Side::Local => parent_state.local_side_open(),
            Side::Remote => parent_state.remote_side_open(),
        };
        if !parent_open {
            return Err(Error::connection(
                H2Error::ProtocolError,
                "parent stream is not open for a push promise",
            ));
        }
        if !self.endpoint(side.opposite()).allows_push_to() {
            return Err(Error::connection(
                H2Error::ProtocolError,
                "server push not allowed to opposite endpoint",
            ));
        }
        let state = match side {
            Side::Local => StreamState::ReservedLocal,
            Side::Remote => StreamState::ReservedRemote,
        };
        let closing = self.closing;
        let endpoint = self.endpoint_mut(side);
        endpoint.check_new_stream_allowed(stream_id, state, closing)?;
        endpoint.increment_expected_stream_id(stream_id);
        self.add_stream(side, stream_id, state);
        Ok(())
    }

    /// Activate a reserved stream once its HEADERS are sent or received.
    pub fn open_stream(&mut self, stream_id: StreamId, half_closed: bool) -> Result<(), Error> {
        let side = self.created_by(stream_id);
        let can_open = self.endpoint(side).can_open_stream();
        let stream = self.live_stream_mut(stream_id)?;
        let state = stream
            .state()
            .activated(stream_id, side == Side::Local, half_closed)?;
        if !can_open {
            return Err(Error::connection(
                H2Error::ProtocolError,
                "maximum active streams violated for this endpoint",
            ));
        }
        stream.set_state(state);
        self.activate(stream_id);
        Ok(())
    }

    fn add_stream(&mut self, side: Side, stream_id: StreamId, state: StreamState) {
        self.streams
            .insert(stream_id, H2Stream::new(stream_id, state, self.id));
        self.endpoint_mut(side).stream_added();
        self.flow.on_stream_added(&mut self.streams, stream_id);
        self.notify_listeners(stream_id, "added", |l, s| l.on_stream_added(s));
        debug!(stream_id, ?side, ?state, "stream created");
    }

    fn activate(&mut self, stream_id: StreamId) {
        if self.active.allow_modifications() {
            self.add_to_active(stream_id);
        } else {
            trace!(stream_id, "deferring stream activation");
            self.active.defer(PendingAction::Activate(stream_id));
        }
    }

    fn add_to_active(&mut self, stream_id: StreamId) {
        if !self.streams.contains_key(&stream_id) || !self.active.insert(stream_id) {
            return;
        }
        let side = self.created_by(stream_id);
        self.endpoint_mut(side).stream_activated();
        self.flow
            .on_stream_active(&mut self.streams, &self.active, stream_id);
        self.notify_listeners(stream_id, "active", |l, s| l.on_stream_active(s));
    }

    // ------------------------------------------------------------------
    // Stream closure
    // ------------------------------------------------------------------

    /// We are done sending on `stream_id`.
    pub fn close_local_side(&mut self, stream_id: StreamId) -> Result<(), Error> {
        let stream = self.live_stream_mut(stream_id)?;
        match stream.state() {
            StreamState::Open => {
                stream.set_state(StreamState::HalfClosedLocal);
                self.notify_half_closed(stream_id);
            }
            StreamState::HalfClosedLocal => {}
            _ => self.close_stream(stream_id)?,
        }
        Ok(())
    }

    /// The peer is done sending on `stream_id`.
    pub fn close_remote_side(&mut self, stream_id: StreamId) -> Result<(), Error> {
        let stream = self.live_stream_mut(stream_id)?;
        match stream.state() {
            StreamState::Open => {
                stream.set_state(StreamState::HalfClosedRemote);
                self.notify_half_closed(stream_id);
            }
            StreamState::HalfClosedRemote => {}
            _ => self.close_stream(stream_id)?,
        }
        Ok(())
    }

    /// Close `stream_id` in both directions and drop it from the map, unless
    /// a traversal of the active set is running; then removal happens when
    /// the traversal ends. Queued writes fail right away either way.
    pub fn close_stream(&mut self, stream_id: StreamId) -> Result<(), Error> {
        let stream = self.live_stream_mut(stream_id)?;
        if stream.state() == StreamState::Closed {
            return Ok(());
        }
        stream.set_state(StreamState::Closed);
        let side = self.created_by(stream_id);
        self.endpoint_mut(side).stream_closed();
        debug!(stream_id, "stream closed");
        self.flow
            .on_stream_closed(&mut self.streams, &self.active, stream_id);
        self.deactivate(stream_id);
        Ok(())
    }

    fn notify_half_closed(&mut self, stream_id: StreamId) {
        self.flow
            .on_stream_half_closed(&mut self.streams, &self.active, stream_id);
        self.notify_listeners(stream_id, "half_closed", |l, s| l.on_stream_half_closed(s));
    }

    fn deactivate(&mut self, stream_id: StreamId) {
        if self.active.allow_modifications() {
            self.remove_from_active(stream_id);
        } else {
            trace!(stream_id, "deferring stream deactivation");
            self.active.defer(PendingAction::Deactivate(stream_id));
        }
    }

    fn remove_from_active(&mut self, stream_id: StreamId) {
        if self.active.remove(stream_id) {
            let side = self.created_by(stream_id);
            self.endpoint_mut(side).stream_deactivated();
            self.flow
                .on_stream_closed(&mut self.streams, &self.active, stream_id);
            self.notify_listeners(stream_id, "closed", |l, s| l.on_stream_closed(s));
        }
        self.remove_stream(stream_id);
    }

    fn remove_stream(&mut self, stream_id: StreamId) {
        if !self.streams.contains_key(&stream_id) {
            return;
        }
        self.notify_listeners(stream_id, "removed", |l, s| l.on_stream_removed(s));
        self.flow.on_stream_removed(&mut self.streams, stream_id);
        self.streams.remove(&stream_id);
        trace!(stream_id, "stream removed");
        self.check_close_complete();
    }

    /// Close the connection: every stream is closed, and close completes
    /// once only the connection stream is left.
    pub fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        debug!(streams = self.num_streams(), "closing connection");
        let ids: Vec<StreamId> = self
            .streams
            .keys()
            .copied()
            .filter(|&id| id != CONNECTION_STREAM_ID)
            .collect();
        for stream_id in ids {
            if let Err(e) = self.close_stream(stream_id) {
                trace!(stream_id, error = %e, "stream already gone");
            }
        }
        self.check_close_complete();
    }

    fn check_close_complete(&mut self) {
        if self.closing && !self.close_complete && self.streams.len() == 1 {
            self.close_complete = true;
            debug!("connection close complete");
        }
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// Visit active streams in activation order until `visitor` returns
    /// `false` or an error. Returns the stream the visit stopped at.
    ///
    /// The visitor gets the whole connection and may open or close streams;
    /// active-set changes are applied after the outermost traversal.
    pub fn for_each_active_stream<F>(&mut self, mut visitor: F) -> Result<Option<StreamId>, Error>
    where
        F: FnMut(&mut Self, StreamId) -> Result<bool, Error>,
    {
        self.active.begin_iteration();
        let mut result = Ok(None);
        let mut index = 0;
        while let Some(stream_id) = self.active.get(index) {
            match visitor(self, stream_id) {
                Ok(true) => index += 1,
                Ok(false) => {
                    result = Ok(Some(stream_id));
                    break;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.active.end_iteration();
        self.run_pending_actions();
        result
    }

    fn run_pending_actions(&mut self) {
        while let Some(action) = self.active.next_pending() {
            trace!(?action, "applying deferred action");
            match action {
                PendingAction::Activate(stream_id) => self.add_to_active(stream_id),
                PendingAction::Deactivate(stream_id) => self.remove_from_active(stream_id),
            }
        }
    }

    // ------------------------------------------------------------------
    // GOAWAY
    // ------------------------------------------------------------------

    /// Record a received GOAWAY. Local streams above `last_stream_id` were
    /// never processed by the peer and are closed.
    ///
    /// Returns `Ok(false)` if the same id was already recorded. A smaller id
    /// than before is a connection error.
    pub fn go_away_received(
        &mut self,
        last_stream_id: StreamId,
        code: H2Error,
        debug_data: &[u8],
    ) -> Result<bool, Error> {
        if !Self::record_go_away(&mut self.local, last_stream_id)? {
            return Ok(false);
        }
        debug!(last_stream_id, %code, "GOAWAY received");
        for listener in self.listeners.iter_mut() {
            if let Err(e) = listener.on_go_away_received(last_stream_id, code, debug_data) {
                error!(last_stream_id, error = %e, "stream listener failed on GOAWAY received");
            }
        }
        self.close_streams_above(last_stream_id, Side::Local)?;
        Ok(true)
    }

    /// Record a GOAWAY we sent. Remote streams above `last_stream_id` will
    /// not be processed and are closed.
    pub fn go_away_sent(
        &mut self,
        last_stream_id: StreamId,
        code: H2Error,
        debug_data: &[u8],
    ) -> Result<bool, Error> {
        if !Self::record_go_away(&mut self.remote, last_stream_id)? {
            return Ok(false);
        }
        debug!(last_stream_id, %code, "GOAWAY sent");
        for listener in self.listeners.iter_mut() {
            if let Err(e) = listener.on_go_away_sent(last_stream_id, code, debug_data) {
                error!(last_stream_id, error = %e, "stream listener failed on GOAWAY sent");
            }
        }
        self.close_streams_above(last_stream_id, Side::Remote)?;
        Ok(true)
    }

    fn record_go_away(endpoint: &mut Endpoint, last_stream_id: StreamId) -> Result<bool, Error> {
        match endpoint.last_stream_known_by_peer() {
            Some(current) if last_stream_id == current => Ok(false),
            Some(current) if last_stream_id < current => Err(Error::connection(
                H2Error::ProtocolError,
                "GOAWAY last stream id must not decrease",
            )),
            _ => {
                endpoint.set_last_stream_known_by_peer(last_stream_id);
                Ok(true)
            }
        }
    }

    fn close_streams_above(&mut self, last_stream_id: StreamId, side: Side) -> Result<(), Error> {
        self.for_each_active_stream(|conn, stream_id| {
            if stream_id > last_stream_id && conn.endpoint(side).is_valid_stream_id(stream_id) {
                conn.close_stream(stream_id)?;
            }
            Ok(true)
        })
        .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Flow control and priority
    // ------------------------------------------------------------------

    pub fn flow_controller(&self) -> &RemoteFlowController {
        &self.flow
    }

    /// Queue a flow-controlled write on `stream_id`. On failure the unit has
    /// already been told through its error callback.
    pub fn add_flow_controlled(
        &mut self,
        stream_id: StreamId,
        mut unit: Box<dyn FlowControlled>,
    ) -> Result<(), Error> {
        if stream_id == CONNECTION_STREAM_ID {
            let err = Error::ConnectionStream;
            unit.error(&err);
            return Err(err);
        }
        self.flow
            .add_flow_controlled(&mut self.streams, &self.active, stream_id, unit)
    }

    pub fn has_flow_controlled(&self, stream_id: StreamId) -> bool {
        self.flow.has_flow_controlled(&self.streams, stream_id)
    }

    /// Apply a WINDOW_UPDATE; stream 0 is the connection window.
    pub fn increment_window_size(&mut self, stream_id: StreamId, delta: i32) -> Result<(), Error> {
        self.flow
            .increment_window_size(&mut self.streams, &self.active, stream_id, delta)
    }

    /// Apply a new SETTINGS_INITIAL_WINDOW_SIZE. Queued bytes are not
    /// written; call [`write_pending_bytes`](Self::write_pending_bytes).
    pub fn set_initial_window_size(&mut self, window_size: i32) -> Result<(), Error> {
        self.flow
            .set_initial_window_size(&mut self.streams, &self.active, window_size)
    }

    pub fn initial_window_size(&self) -> i32 {
        self.flow.initial_window_size()
    }

    /// Send window of `stream_id`, or of the connection for stream 0.
    pub fn window_size(&self, stream_id: StreamId) -> Option<i32> {
        self.flow.window_size(&self.streams, stream_id)
    }

    pub fn connection_window_size(&self) -> i32 {
        self.flow.connection_window_size()
    }

    /// Write as much queued data as the windows and `writer` allow.
    pub fn write_pending_bytes(&mut self, writer: &mut dyn FrameWriter) -> Result<(), Error> {
        self.flow
            .write_pending_bytes(&mut self.streams, &self.active, writer)
    }

    pub fn is_writable(&self, stream_id: StreamId) -> bool {
        self.flow.is_writable(&self.streams, stream_id)
    }

    /// The transport became writable or stopped being writable.
    pub fn channel_writability_changed(&mut self, writable: bool) {
        self.flow
            .channel_writability_changed(&mut self.streams, &self.active, writable);
    }

    pub fn set_writability_listener(&mut self, listener: Option<Box<dyn WritabilityListener>>) {
        self.flow.set_listener(listener);
    }

    /// Make `child` depend on `parent` (PRIORITY, or the priority block of
    /// HEADERS).
    pub fn update_dependency_tree(
        &mut self,
        child: StreamId,
        parent: StreamId,
        weight: u16,
        exclusive: bool,
    ) -> Result<(), Error> {
        self.flow
            .distributor_mut()
            .update_dependency_tree(child, parent, weight, exclusive)
    }

    pub fn priority(&self) -> &WeightedFairQueueDistributor {
        self.flow.distributor()
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    fn notify_listeners<F>(&mut self, stream_id: StreamId, event: &'static str, mut f: F)
    where
        F: FnMut(&mut dyn StreamListener, &mut H2Stream) -> Result<(), Error>,
    {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        for listener in self.listeners.iter_mut() {
            if let Err(e) = f(listener.as_mut(), stream) {
                error!(stream_id, event, error = %e, "stream listener failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
