//! Flow-controlled write units.
//!
//! A unit sits in its stream's queue until the scheduler grants it bytes.
//! DATA is the only unit that actually consumes window; trailers are queued
//! behind it so they never overtake the body.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::Error;
use crate::h2::StreamId;
use crate::h2::config::MAX_WINDOW_SIZE;
use crate::h2::io::{FrameWriter, HeaderBlock, MAX_PADDING};

/// Callback fired once when a unit is fully written or fails.
pub type Completion = Box<dyn FnOnce(Result<(), &Error>)>;

/// An outbound item whose transmission is gated by the flow-control window.
pub trait FlowControlled {
    /// Bytes still to be written, counted against the window.
    fn size(&self) -> usize;

    /// Write at most `allowed` bytes. Called with 0 to let empty frames out.
    fn write(&mut self, writer: &mut dyn FrameWriter, allowed: usize) -> Result<(), Error>;

    /// Absorb `next` into this unit if possible. On success `next` is
    /// dropped by the caller.
    fn merge(&mut self, next: &mut dyn FlowControlled) -> bool {
        let _ = next;
        false
    }

    /// The unit has been fully written.
    fn write_complete(&mut self) {}

    /// The unit will never be written.
    fn error(&mut self, cause: &Error);

    /// Downcast hook for [`DataFrame::merge`].
    fn as_data_mut(&mut self) -> Option<&mut DataFrame> {
        None
    }
}

/// DATA payload for one stream.
pub struct DataFrame {
    stream_id: StreamId,
    data: Bytes,
    padding: usize,
    end_stream: bool,
    completions: Vec<Completion>,
}

impl DataFrame {
    pub fn new(stream_id: StreamId, data: Bytes, end_stream: bool) -> Self {
        Self {
            stream_id,
            data,
            padding: 0,
            end_stream,
            completions: Vec::new(),
        }
    }

    /// Padding bytes (including the pad-length octet) sent with the data.
    pub fn with_padding(mut self, padding: usize) -> Result<Self, Error> {
        if padding > MAX_PADDING {
            return Err(Error::InvalidArgument("padding must be at most 256 bytes"));
        }
        self.padding = padding;
        Ok(self)
    }

    pub fn on_complete(mut self, f: impl FnOnce(Result<(), &Error>) + 'static) -> Self {
        self.completions.push(Box::new(f));
        self
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_end_stream(&self) -> bool {
        self.end_stream
    }

    fn finish(&mut self, result: Result<(), &Error>) {
        for completion in self.completions.drain(..) {
            completion(result);
        }
    }
}

impl fmt::Debug for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFrame")
            .field("stream_id", &self.stream_id)
            .field("len", &self.data.len())
            .field("padding", &self.padding)
            .field("end_stream", &self.end_stream)
            .finish()
    }
}

impl FlowControlled for DataFrame {
    fn size(&self) -> usize {
        self.data.len() + self.padding
    }

    fn write(&mut self, writer: &mut dyn FrameWriter, allowed: usize) -> Result<(), Error> {
        let queued = self.data.len();
        if !self.end_stream {
            if queued == 0 {
                // Only padding is left; it is pointless without data.
                self.padding = 0;
                return Ok(());
            }
            if allowed == 0 {
                return Ok(());
            }
        }
        let n = queued.min(allowed);
        let padding = (allowed - n).min(self.padding);
        let end_stream = self.end_stream && n == queued && padding == self.padding;
        // Nothing is consumed unless the writer takes the frame.
        writer.write_data(self.stream_id, self.data.slice(..n), padding, end_stream)?;
        self.data = self.data.slice(n..);
        self.padding -= padding;
        Ok(())
    }

    fn merge(&mut self, next: &mut dyn FlowControlled) -> bool {
        if self.end_stream {
            return false;
        }
        let Some(next) = next.as_data_mut() else {
            return false;
        };
        if next.stream_id != self.stream_id
            || self.size() + next.size() > MAX_WINDOW_SIZE as usize
        {
            return false;
        }
        let mut combined = BytesMut::with_capacity(self.data.len() + next.data.len());
        combined.extend_from_slice(&self.data);
        combined.extend_from_slice(&next.data);
        self.data = combined.freeze();
        self.padding = self.padding.max(next.padding);
        self.end_stream = next.end_stream;
        self.completions.append(&mut next.completions);
        true
    }

    fn write_complete(&mut self) {
        self.finish(Ok(()));
    }

    fn error(&mut self, cause: &Error) {
        self.data.clear();
        self.padding = 0;
        self.finish(Err(cause));
    }

    fn as_data_mut(&mut self) -> Option<&mut DataFrame> {
        Some(self)
    }
}

/// Trailing HEADERS, ordered behind any queued DATA on the same stream.
pub struct HeadersFrame {
    stream_id: StreamId,
    headers: HeaderBlock,
    end_stream: bool,
    written: bool,
    completions: Vec<Completion>,
}

impl HeadersFrame {
    pub fn new(stream_id: StreamId, headers: HeaderBlock, end_stream: bool) -> Self {
        Self {
            stream_id,
            headers,
            end_stream,
            written: false,
            completions: Vec::new(),
        }
    }

    pub fn on_complete(mut self, f: impl FnOnce(Result<(), &Error>) + 'static) -> Self {
        self.completions.push(Box::new(f));
        self
    }
}

impl fmt::Debug for HeadersFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadersFrame")
            .field("stream_id", &self.stream_id)
            .field("fields", &self.headers.len())
            .field("end_stream", &self.end_stream)
            .finish()
    }
}

impl FlowControlled for HeadersFrame {
    fn size(&self) -> usize {
        0
    }

    fn write(&mut self, writer: &mut dyn FrameWriter, _allowed: usize) -> Result<(), Error> {
        if self.written {
            return Ok(());
        }
        writer.write_headers(self.stream_id, &self.headers, self.end_stream)?;
        self.written = true;
        Ok(())
    }

    fn write_complete(&mut self) {
        for completion in self.completions.drain(..) {
            completion(Ok(()));
        }
    }

    fn error(&mut self, cause: &Error) {
        for completion in self.completions.drain(..) {
            completion(Err(cause));
        }
    }
}
