//! Parsed inbound frame events (RFC 9113 §6).
//!
//! The wire codec lives outside this crate. It hands the connection one
//! [`H2Frame`] per decoded frame, with CONTINUATION already assembled and
//! padding stripped.

use crate::error::H2Error;
use crate::h2::StreamId;
use crate::h2::config::H2Settings;

// Frame type constants (RFC 9113 §6).
pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;

/// Stream dependency as carried by PRIORITY and HEADERS (RFC 7540 §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H2Priority {
    pub exclusive: bool,
    pub dependency: StreamId,
    /// Wire value, one less than the weight.
    pub weight: u8,
}

impl H2Priority {
    pub const fn new(dependency: StreamId, weight: u16, exclusive: bool) -> Self {
        let wire = if weight == 0 {
            0
        } else if weight > 256 {
            255
        } else {
            (weight - 1) as u8
        };
        Self {
            exclusive,
            dependency,
            weight: wire,
        }
    }

    /// Effective weight in 1..=256.
    pub const fn weight(&self) -> u16 {
        self.weight as u16 + 1
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H2Frame<'a> {
    Data {
        stream_id: StreamId,
        /// Flow-controlled length, padding included.
        len: usize,
        end_stream: bool,
    },
    Headers {
        stream_id: StreamId,
        end_stream: bool,
        priority: Option<H2Priority>,
    },
    Priority {
        stream_id: StreamId,
        priority: H2Priority,
    },
    RstStream {
        stream_id: StreamId,
        code: H2Error,
    },
    /// A non-ACK SETTINGS frame, already validated.
    Settings(H2Settings),
    PushPromise {
        stream_id: StreamId,
        promised_id: StreamId,
    },
    GoAway {
        last_stream_id: StreamId,
        code: H2Error,
        debug: &'a [u8],
    },
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
}

impl H2Frame<'_> {
    pub fn frame_type(&self) -> u8 {
        match self {
            H2Frame::Data { .. } => FRAME_DATA,
            H2Frame::Headers { .. } => FRAME_HEADERS,
            H2Frame::Priority { .. } => FRAME_PRIORITY,
            H2Frame::RstStream { .. } => FRAME_RST_STREAM,
            H2Frame::Settings(_) => FRAME_SETTINGS,
            H2Frame::PushPromise { .. } => FRAME_PUSH_PROMISE,
            H2Frame::GoAway { .. } => FRAME_GOAWAY,
            H2Frame::WindowUpdate { .. } => FRAME_WINDOW_UPDATE,
        }
    }

    /// Stream the frame is addressed to; 0 for connection-level frames.
    pub fn stream_id(&self) -> StreamId {
        match *self {
            H2Frame::Data { stream_id, .. }
            | H2Frame::Headers { stream_id, .. }
            | H2Frame::Priority { stream_id, .. }
            | H2Frame::RstStream { stream_id, .. }
            | H2Frame::PushPromise { stream_id, .. }
            | H2Frame::WindowUpdate { stream_id, .. } => stream_id,
            H2Frame::Settings(_) | H2Frame::GoAway { .. } => 0,
        }
    }
}
