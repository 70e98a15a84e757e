//! Inbound frame handling and error translation.
//!
//! Applies parsed frame events to the connection state and turns protocol
//! errors into RST_STREAM or GOAWAY. Inbound flow control (our receive
//! window) is left to the codec layer; only frames that move the stream
//! state machine or the send side are handled here.

use tracing::{debug, trace, warn};

use super::connection::H2Connection;
use super::endpoint::Side;
use super::frame::H2Frame;
use super::io::FrameWriter;
use super::stream::StreamState;
use super::{CONNECTION_STREAM_ID, StreamId};
use crate::error::{Error, H2Error};
use crate::h2::config::H2Settings;

/// What [`H2Connection::reset_stream`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// RST_STREAM was written.
    Written,
    /// A reset had already been sent; nothing was written.
    AlreadySent,
    /// The peer never learned about the stream, so it was closed without
    /// writing anything.
    Unannounced,
}

impl H2Connection {
    /// Apply one inbound frame.
    ///
    /// Errors come back as [`Error::Connection`] or [`Error::Stream`]; pass
    /// them to [`handle_error`](Self::handle_error).
    pub fn on_frame(&mut self, frame: H2Frame<'_>) -> Result<(), Error> {
        trace!(
            frame_type = frame.frame_type(),
            stream_id = frame.stream_id(),
            "inbound frame"
        );
        match frame {
            H2Frame::Headers {
                stream_id,
                end_stream,
                priority,
            } => {
                self.on_headers(stream_id, end_stream)?;
                if let Some(p) = priority {
                    self.update_dependency_tree(stream_id, p.dependency, p.weight(), p.exclusive)?;
                }
                Ok(())
            }
            H2Frame::Data {
                stream_id,
                len,
                end_stream,
            } => self.on_data(stream_id, len, end_stream),
            H2Frame::RstStream { stream_id, code } => self.on_rst_stream(stream_id, code),
            H2Frame::Settings(settings) => self.on_settings(&settings),
            H2Frame::PushPromise {
                stream_id,
                promised_id,
            } => {
                require_stream(stream_id)?;
                self.reserve_push_stream(Side::Remote, promised_id, stream_id)
            }
            H2Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.on_window_update(stream_id, increment),
            H2Frame::GoAway {
                last_stream_id,
                code,
                debug,
            } => self.go_away_received(last_stream_id, code, debug).map(|_| ()),
            H2Frame::Priority {
                stream_id,
                priority,
            } => {
                require_stream(stream_id)?;
                self.update_dependency_tree(
                    stream_id,
                    priority.dependency,
                    priority.weight(),
                    priority.exclusive,
                )
            }
        }
    }

    fn on_headers(&mut self, stream_id: StreamId, end_stream: bool) -> Result<(), Error> {
        require_stream(stream_id)?;
        let Some(state) = self.stream(stream_id).map(|s| s.state()) else {
            if self.remote().may_have_created_stream(stream_id) {
                return Err(Error::stream(
                    stream_id,
                    H2Error::StreamClosed,
                    "HEADERS received on closed stream",
                ));
            }
            self.create_stream(Side::Remote, stream_id, end_stream)?;
            if let Some(stream) = self.stream_mut(stream_id) {
                stream.headers_received(false);
            }
            return Ok(());
        };

        match state {
            StreamState::ReservedRemote => self.open_stream(stream_id, false)?,
            s if s.remote_side_open() => {}
            _ => {
                return Err(Error::stream(
                    stream_id,
                    H2Error::StreamClosed,
                    "HEADERS received after remote side closed",
                ));
            }
        }
        if let Some(stream) = self.stream_mut(stream_id) {
            stream.headers_received(false);
        }
        if end_stream {
            self.close_remote_side(stream_id)?;
        }
        Ok(())
    }

    fn on_data(&mut self, stream_id: StreamId, len: usize, end_stream: bool) -> Result<(), Error> {
        require_stream(stream_id)?;
        let open = self
            .stream(stream_id)
            .is_some_and(|s| s.state().remote_side_open());
        if !open {
            if !self.stream_may_have_existed(stream_id) {
                return Err(Error::connection(
                    H2Error::ProtocolError,
                    "DATA received on idle stream",
                ));
            }
            return Err(Error::stream(
                stream_id,
                H2Error::StreamClosed,
                "DATA received after remote side closed",
            ));
        }
        trace!(stream_id, len, end_stream, "data received");
        if end_stream {
            self.close_remote_side(stream_id)?;
        }
        Ok(())
    }

    fn on_rst_stream(&mut self, stream_id: StreamId, code: H2Error) -> Result<(), Error> {
        require_stream(stream_id)?;
        let Some(state) = self.stream(stream_id).map(|s| s.state()) else {
            if !self.stream_may_have_existed(stream_id) {
                return Err(Error::connection(
                    H2Error::ProtocolError,
                    "RST_STREAM received for idle stream",
                ));
            }
            return Ok(());
        };
        if state == StreamState::Idle {
            return Err(Error::connection(
                H2Error::ProtocolError,
                "RST_STREAM received for idle stream",
            ));
        }
        debug!(stream_id, %code, "stream reset by peer");
        self.close_stream(stream_id)
    }

    fn on_settings(&mut self, settings: &H2Settings) -> Result<(), Error> {
        if let Some(push) = settings.enable_push {
            if !self.is_server() && push {
                return Err(Error::connection(
                    H2Error::ProtocolError,
                    "server sent SETTINGS_ENABLE_PUSH",
                ));
            }
            if self.is_server() {
                self.remote_mut().allow_push_to(push)?;
            }
        }
        if let Some(max) = settings.max_concurrent_streams {
            self.local_mut()
                .set_max_active_streams(usize::try_from(max).unwrap_or(usize::MAX));
        }
        if let Some(window) = settings.initial_window_size {
            let window = i32::try_from(window).map_err(|_| {
                Error::connection(
                    H2Error::FlowControlError,
                    "SETTINGS_INITIAL_WINDOW_SIZE above maximum window",
                )
            })?;
            self.set_initial_window_size(window)?;
        }
        Ok(())
    }

    fn on_window_update(&mut self, stream_id: StreamId, increment: u32) -> Result<(), Error> {
        if increment == 0 {
            return Err(Error::for_stream(
                stream_id,
                H2Error::ProtocolError,
                "WINDOW_UPDATE with zero increment",
            ));
        }
        let Ok(delta) = i32::try_from(increment) else {
            return Err(Error::for_stream(
                stream_id,
                H2Error::FlowControlError,
                "WINDOW_UPDATE increment above maximum window",
            ));
        };
        if stream_id != CONNECTION_STREAM_ID && self.stream(stream_id).is_none() {
            if !self.stream_may_have_existed(stream_id) {
                return Err(Error::connection(
                    H2Error::ProtocolError,
                    "WINDOW_UPDATE received for idle stream",
                ));
            }
            // Closed streams can still see updates in flight.
            return Ok(());
        }
        self.increment_window_size(stream_id, delta)
    }

    /// Reset `stream_id` with `code` and close it.
    ///
    /// Nothing is written when a reset was already sent, or when the stream
    /// is idle or was opened locally without anything sent yet.
    pub fn reset_stream(
        &mut self,
        stream_id: StreamId,
        code: H2Error,
        writer: &mut dyn FrameWriter,
    ) -> Result<ResetOutcome, Error> {
        if stream_id == CONNECTION_STREAM_ID {
            return Err(Error::ConnectionStream);
        }
        let local = self.local().is_valid_stream_id(stream_id);
        let Some(stream) = self.stream_mut(stream_id) else {
            writer.write_rst_stream(stream_id, code)?;
            return Ok(ResetOutcome::Written);
        };
        if stream.is_reset_sent() {
            return Ok(ResetOutcome::AlreadySent);
        }
        stream.reset_sent();

        let unannounced = stream.state() == StreamState::Idle
            || (local && !stream.is_headers_sent() && !stream.is_push_promise_sent());
        let outcome = if unannounced {
            ResetOutcome::Unannounced
        } else {
            writer.write_rst_stream(stream_id, code)?;
            ResetOutcome::Written
        };
        debug!(stream_id, %code, ?outcome, "stream reset");
        self.close_stream(stream_id)?;
        Ok(outcome)
    }

    /// Translate `err` into frames: a stream error resets the stream, any
    /// other error sends GOAWAY and closes the connection.
    pub fn handle_error(&mut self, err: &Error, writer: &mut dyn FrameWriter) -> Result<(), Error> {
        if let Error::Stream {
            stream_id, code, ..
        } = *err
        {
            warn!(stream_id, %code, error = %err, "stream error");
            self.reset_stream(stream_id, code, writer)?;
            return Ok(());
        }

        let code = err.code();
        let last_stream_id = self.remote().last_stream_created();
        let debug_data: &[u8] = match err {
            Error::Connection { reason, .. } => reason.as_bytes(),
            _ => &[],
        };
        warn!(last_stream_id, %code, error = %err, "connection error");
        match self.go_away_sent(last_stream_id, code, debug_data) {
            Ok(true) => writer.write_go_away(last_stream_id, code, debug_data)?,
            Ok(false) => {}
            Err(e) => debug!(error = %e, "GOAWAY not sent again"),
        }
        self.close();
        Ok(())
    }
}

fn require_stream(stream_id: StreamId) -> Result<(), Error> {
    if stream_id == CONNECTION_STREAM_ID {
        return Err(Error::connection(
            H2Error::ProtocolError,
            "frame requires a stream identifier",
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h2::config::{ConnectionConfig, MAX_WINDOW_SIZE, Role};
    use crate::h2::frame::H2Priority;
    use crate::h2::io::{FrameQueue, OutboundFrame};

    fn server() -> H2Connection {
        H2Connection::new(Role::Server, ConnectionConfig::default()).unwrap()
    }

    fn headers(stream_id: StreamId, end_stream: bool) -> H2Frame<'static> {
        H2Frame::Headers {
            stream_id,
            end_stream,
            priority: None,
        }
    }

    #[test]
    fn request_lifecycle() {
        let mut conn = server();
        conn.on_frame(headers(1, false)).unwrap();
        let stream = conn.stream(1).unwrap();
        assert_eq!(stream.state(), StreamState::Open);
        assert!(stream.is_headers_received());

        conn.on_frame(H2Frame::Data {
            stream_id: 1,
            len: 100,
            end_stream: true,
        })
        .unwrap();
        assert_eq!(conn.stream(1).unwrap().state(), StreamState::HalfClosedRemote);

        let err = conn
            .on_frame(H2Frame::Data {
                stream_id: 1,
                len: 1,
                end_stream: false,
            })
            .unwrap_err();
        assert_eq!(err.code(), H2Error::StreamClosed);
        assert!(err.is_stream_error());
    }

    #[test]
    fn trailers_close_remote_side() {
        let mut conn = server();
        conn.on_frame(headers(1, false)).unwrap();
        conn.on_frame(headers(1, true)).unwrap();
        let stream = conn.stream(1).unwrap();
        assert!(stream.is_trailers_received());
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
    }

    #[test]
    fn headers_with_priority() {
        let mut conn = server();
        conn.on_frame(headers(1, false)).unwrap();
        conn.on_frame(H2Frame::Headers {
            stream_id: 3,
            end_stream: true,
            priority: Some(H2Priority::new(1, 200, false)),
        })
        .unwrap();
        assert!(conn.priority().is_child(3, 1, 200));
        assert_eq!(conn.stream(3).unwrap().state(), StreamState::HalfClosedRemote);
    }

    #[test]
    fn stream_zero_frames_are_connection_errors() {
        let mut conn = server();
        for frame in [
            headers(0, false),
            H2Frame::RstStream {
                stream_id: 0,
                code: H2Error::Cancel,
            },
            H2Frame::Priority {
                stream_id: 0,
                priority: H2Priority::new(1, 16, false),
            },
        ] {
            let err = conn.on_frame(frame).unwrap_err();
            assert!(err.is_connection_error());
            assert_eq!(err.code(), H2Error::ProtocolError);
        }
    }

    #[test]
    fn rst_stream_on_idle_is_connection_error() {
        let mut conn = server();
        let err = conn
            .on_frame(H2Frame::RstStream {
                stream_id: 5,
                code: H2Error::Cancel,
            })
            .unwrap_err();
        assert!(err.is_connection_error());

        conn.on_frame(headers(5, false)).unwrap();
        conn.on_frame(H2Frame::RstStream {
            stream_id: 5,
            code: H2Error::Cancel,
        })
        .unwrap();
        assert!(conn.stream(5).is_none());
        // A late reset for a closed stream is ignored.
        conn.on_frame(H2Frame::RstStream {
            stream_id: 5,
            code: H2Error::Cancel,
        })
        .unwrap();
    }

    #[test]
    fn window_update_rules() {
        let mut conn = server();
        conn.on_frame(headers(1, false)).unwrap();

        let zero = conn
            .on_frame(H2Frame::WindowUpdate {
                stream_id: 1,
                increment: 0,
            })
            .unwrap_err();
        assert!(zero.is_stream_error());
        assert_eq!(zero.code(), H2Error::ProtocolError);

        let zero_conn = conn
            .on_frame(H2Frame::WindowUpdate {
                stream_id: 0,
                increment: 0,
            })
            .unwrap_err();
        assert!(zero_conn.is_connection_error());

        conn.on_frame(H2Frame::WindowUpdate {
            stream_id: 1,
            increment: 1000,
        })
        .unwrap();
        assert_eq!(conn.window_size(1), Some(66_535));

        let overflow = conn
            .on_frame(H2Frame::WindowUpdate {
                stream_id: 0,
                increment: MAX_WINDOW_SIZE as u32,
            })
            .unwrap_err();
        assert!(overflow.is_connection_error());
        assert_eq!(overflow.code(), H2Error::FlowControlError);
    }

    #[test]
    fn settings_apply_to_endpoints_and_windows() {
        let mut conn = server();
        conn.on_frame(headers(1, false)).unwrap();
        let settings = H2Settings::from_params(&[(0x2, 0), (0x3, 10), (0x4, 1000)]).unwrap();
        conn.on_frame(H2Frame::Settings(settings)).unwrap();
        assert!(!conn.remote().allows_push_to());
        assert_eq!(conn.local().max_active_streams(), 10);
        assert_eq!(conn.initial_window_size(), 1000);
        assert_eq!(conn.window_size(1), Some(1000));
    }

    #[test]
    fn client_rejects_enable_push() {
        let mut conn = H2Connection::new(Role::Client, ConnectionConfig::default()).unwrap();
        let settings = H2Settings::from_params(&[(0x2, 1)]).unwrap();
        let err = conn.on_frame(H2Frame::Settings(settings)).unwrap_err();
        assert!(err.is_connection_error());
    }

    #[test]
    fn push_promise_reserves_remote_stream() {
        let mut conn = H2Connection::new(Role::Client, ConnectionConfig::default()).unwrap();
        conn.create_stream(Side::Local, 1, true).unwrap();
        conn.on_frame(H2Frame::PushPromise {
            stream_id: 1,
            promised_id: 2,
        })
        .unwrap();
        assert_eq!(conn.stream(2).unwrap().state(), StreamState::ReservedRemote);

        conn.on_frame(headers(2, false)).unwrap();
        assert_eq!(conn.stream(2).unwrap().state(), StreamState::HalfClosedLocal);
        conn.on_frame(H2Frame::Data {
            stream_id: 2,
            len: 0,
            end_stream: true,
        })
        .unwrap();
        assert!(conn.stream(2).is_none());
    }

    #[test]
    fn reset_outcomes_are_distinguishable() {
        let mut conn = server();
        let mut out = FrameQueue::new();
        conn.on_frame(headers(1, false)).unwrap();

        assert_eq!(
            conn.reset_stream(1, H2Error::Cancel, &mut out).unwrap(),
            ResetOutcome::Written
        );
        assert!(matches!(
            out.poll_frame(),
            Some(OutboundFrame::RstStream {
                stream_id: 1,
                code: H2Error::Cancel
            })
        ));
        assert!(conn.stream(1).is_none());

        // Local stream with nothing sent yet.
        conn.create_stream(Side::Local, 2, false).unwrap();
        assert_eq!(
            conn.reset_stream(2, H2Error::Cancel, &mut out).unwrap(),
            ResetOutcome::Unannounced
        );
        assert!(out.is_empty());
        assert_eq!(conn.reset_stream(0, H2Error::Cancel, &mut out), Err(Error::ConnectionStream));
    }

    #[test]
    fn second_reset_is_not_written() {
        let mut conn = server();
        let mut out = FrameQueue::new();
        conn.on_frame(headers(1, false)).unwrap();
        let mut seen = alloc::vec::Vec::new();
        conn.for_each_active_stream(|c, id| {
            // Removal is deferred, so the stream is still visible here.
            seen.push(c.reset_stream(id, H2Error::Cancel, &mut out)?);
            seen.push(c.reset_stream(id, H2Error::Cancel, &mut out)?);
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen, [ResetOutcome::Written, ResetOutcome::AlreadySent]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn reset_during_traversal_drops_queued_data() {
        use alloc::rc::Rc;
        use core::cell::RefCell;

        use crate::h2::flow_controlled::DataFrame;

        let mut conn = server();
        let mut out = FrameQueue::new();
        conn.on_frame(headers(1, false)).unwrap();
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        let unit = DataFrame::new(1, bytes::Bytes::from(alloc::vec![7u8; 100]), false)
            .on_complete(move |r| *s.borrow_mut() = r.err().map(|e| e.code()));
        conn.add_flow_controlled(1, alloc::boxed::Box::new(unit)).unwrap();

        conn.for_each_active_stream(|c, id| {
            c.reset_stream(id, H2Error::Cancel, &mut out)?;
            c.write_pending_bytes(&mut out)?;
            Ok(true)
        })
        .unwrap();
        conn.write_pending_bytes(&mut out).unwrap();

        assert_eq!(
            out.poll_frame(),
            Some(OutboundFrame::RstStream {
                stream_id: 1,
                code: H2Error::Cancel
            })
        );
        assert!(out.is_empty());
        assert_eq!(*seen.borrow(), Some(H2Error::StreamClosed));
        assert!(!conn.has_flow_controlled(1));
        assert_eq!(conn.connection_window_size(), 65_535);
    }

    #[test]
    fn connection_error_sends_goaway_and_closes() {
        let mut conn = server();
        let mut out = FrameQueue::new();
        conn.on_frame(headers(1, false)).unwrap();
        conn.on_frame(headers(3, false)).unwrap();

        let err = conn.on_frame(headers(2, false)).unwrap_err();
        assert!(err.is_connection_error());
        conn.handle_error(&err, &mut out).unwrap();

        match out.poll_frame() {
            Some(OutboundFrame::GoAway {
                last_stream_id,
                code,
                ..
            }) => {
                assert_eq!(last_stream_id, 3);
                assert_eq!(code, H2Error::ProtocolError);
            }
            other => panic!("expected GOAWAY, got {other:?}"),
        }
        assert!(conn.is_go_away_sent());
        assert!(conn.is_close_complete());
    }

    #[test]
    fn stream_error_resets_only_that_stream() {
        let mut conn = server();
        let mut out = FrameQueue::new();
        conn.on_frame(headers(1, true)).unwrap();
        conn.on_frame(headers(3, false)).unwrap();
        let err = conn
            .on_frame(H2Frame::Data {
                stream_id: 1,
                len: 5,
                end_stream: false,
            })
            .unwrap_err();
        conn.handle_error(&err, &mut out).unwrap();
        assert!(conn.stream(1).is_none());
        assert!(conn.stream(3).is_some());
        assert!(!conn.is_closing());
        assert_eq!(out.len(), 1);
    }
}
