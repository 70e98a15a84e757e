//! Outbound frame sink for HTTP/2 connections.
//!
//! The core never serializes frames itself. It hands decisions to a
//! [`FrameWriter`]; [`FrameQueue`] is an owning implementation that buffers
//! them until the transport drains it with `poll_frame()`.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use bytes::Bytes;

use crate::error::{Error, H2Error};
use crate::h2::StreamId;

/// A decoded header block: `(name, value)` pairs.
pub type HeaderBlock = Vec<(Bytes, Bytes)>;

/// Most padding one DATA frame can carry, pad-length octet included.
pub const MAX_PADDING: usize = 256;

/// Frame header size (RFC 9113 §4.1).
pub const FRAME_HEADER_LEN: usize = 9;

/// Sink for frames the connection decides to emit.
pub trait FrameWriter {
    fn write_data(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        padding: usize,
        end_stream: bool,
    ) -> Result<(), Error>;

    fn write_headers(
        &mut self,
        stream_id: StreamId,
        headers: &[(Bytes, Bytes)],
        end_stream: bool,
    ) -> Result<(), Error>;

    fn write_rst_stream(&mut self, stream_id: StreamId, code: H2Error) -> Result<(), Error>;

    fn write_go_away(
        &mut self,
        last_stream_id: StreamId,
        code: H2Error,
        debug_data: &[u8],
    ) -> Result<(), Error>;

    /// Whether the transport accepts more data right now.
    fn is_writable(&self) -> bool {
        true
    }

    /// Bytes the transport can take before it stops being writable.
    fn bytes_before_unwritable(&self) -> usize {
        usize::MAX
    }
}

/// A frame waiting in a [`FrameQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Data {
        stream_id: StreamId,
        data: Bytes,
        padding: usize,
        end_stream: bool,
    },
    Headers {
        stream_id: StreamId,
        headers: HeaderBlock,
        end_stream: bool,
    },
    RstStream {
        stream_id: StreamId,
        code: H2Error,
    },
    GoAway {
        last_stream_id: StreamId,
        code: H2Error,
        debug_data: Bytes,
    },
}

impl OutboundFrame {
    pub fn stream_id(&self) -> StreamId {
        match self {
            OutboundFrame::Data { stream_id, .. }
            | OutboundFrame::Headers { stream_id, .. }
            | OutboundFrame::RstStream { stream_id, .. } => *stream_id,
            OutboundFrame::GoAway { .. } => 0,
        }
    }

    /// Bytes counted against flow-control windows.
    pub fn flow_controlled_len(&self) -> usize {
        match self {
            OutboundFrame::Data { data, padding, .. } => data.len() + padding,
            _ => 0,
        }
    }

    /// Approximate size on the wire, used for transport accounting.
    pub fn encoded_len(&self) -> usize {
        let payload = match self {
            OutboundFrame::Data { data, padding, .. } => {
                data.len() + padding + usize::from(*padding > 0)
            }
            OutboundFrame::Headers { headers, .. } => {
                headers.iter().map(|(n, v)| n.len() + v.len()).sum()
            }
            OutboundFrame::RstStream { .. } => 4,
            OutboundFrame::GoAway { debug_data, .. } => 8 + debug_data.len(),
        };
        FRAME_HEADER_LEN + payload
    }
}

/// Owning outbound buffer with a high-water mark.
#[derive(Debug)]
pub struct FrameQueue {
    frames: VecDeque<OutboundFrame>,
    buffered: usize,
    high_water_mark: usize,
}

impl FrameQueue {
    pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

    pub fn new() -> Self {
        Self::with_high_water_mark(Self::DEFAULT_HIGH_WATER_MARK)
    }

    pub fn with_high_water_mark(high_water_mark: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            buffered: 0,
            high_water_mark,
        }
    }

    /// Next frame for the transport, in write order.
    pub fn poll_frame(&mut self) -> Option<OutboundFrame> {
        let frame = self.frames.pop_front()?;
        self.buffered = self.buffered.saturating_sub(frame.encoded_len());
        Some(frame)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    fn push(&mut self, frame: OutboundFrame) {
        self.buffered += frame.encoded_len();
        self.frames.push_back(frame);
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameWriter for FrameQueue {
    fn write_data(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        padding: usize,
        end_stream: bool,
    ) -> Result<(), Error> {
        if padding > MAX_PADDING {
            return Err(Error::InvalidArgument("padding must be at most 256 bytes"));
        }
        self.push(OutboundFrame::Data {
            stream_id,
            data,
            padding,
            end_stream,
        });
        Ok(())
    }

    fn write_headers(
        &mut self,
        stream_id: StreamId,
        headers: &[(Bytes, Bytes)],
        end_stream: bool,
    ) -> Result<(), Error> {
        self.push(OutboundFrame::Headers {
            stream_id,
            headers: headers.to_vec(),
            end_stream,
        });
        Ok(())
    }

    fn write_rst_stream(&mut self, stream_id: StreamId, code: H2Error) -> Result<(), Error> {
        self.push(OutboundFrame::RstStream { stream_id, code });
        Ok(())
    }

    fn write_go_away(
        &mut self,
        last_stream_id: StreamId,
        code: H2Error,
        debug_data: &[u8],
    ) -> Result<(), Error> {
        self.push(OutboundFrame::GoAway {
            last_stream_id,
            code,
            debug_data: Bytes::copy_from_slice(debug_data),
        });
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.buffered < self.high_water_mark
    }

    fn bytes_before_unwritable(&self) -> usize {
        self.high_water_mark.saturating_sub(self.buffered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_tracks_buffered_bytes() {
        let mut q = FrameQueue::with_high_water_mark(100);
        assert_eq!(q.bytes_before_unwritable(), 100);
        q.write_data(1, Bytes::from_static(&[0u8; 50]), 0, false)
            .unwrap();
        assert_eq!(q.buffered(), 59);
        assert!(q.is_writable());
        q.write_data(1, Bytes::from_static(&[0u8; 50]), 0, true)
            .unwrap();
        assert!(!q.is_writable());
        assert_eq!(q.bytes_before_unwritable(), 0);

        let first = q.poll_frame().unwrap();
        assert_eq!(first.flow_controlled_len(), 50);
        assert!(q.is_writable());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn control_frames_are_not_flow_controlled() {
        let mut q = FrameQueue::new();
        q.write_rst_stream(3, H2Error::Cancel).unwrap();
        q.write_go_away(3, H2Error::NoError, b"bye").unwrap();
        let rst = q.poll_frame().unwrap();
        assert_eq!(rst.stream_id(), 3);
        assert_eq!(rst.flow_controlled_len(), 0);
        let goaway = q.poll_frame().unwrap();
        assert_eq!(goaway.stream_id(), 0);
        assert!(q.poll_frame().is_none());
        assert_eq!(q.buffered(), 0);
    }

    #[test]
    fn oversized_padding_rejected() {
        let mut q = FrameQueue::new();
        assert!(q.write_data(1, Bytes::new(), 300, false).is_err());
        assert!(q.is_empty());
    }
}
