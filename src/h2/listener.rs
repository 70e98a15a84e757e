//! Callbacks fired by the connection as streams change state.

use crate::error::{Error, H2Error};
use crate::h2::StreamId;
use crate::h2::stream::H2Stream;

/// Observer of stream lifecycle events.
///
/// Errors returned from a callback are logged and otherwise ignored; they
/// never abort the operation that fired the event.
pub trait StreamListener {
    /// The stream was inserted into the stream map.
    fn on_stream_added(&mut self, stream: &mut H2Stream) -> Result<(), Error> {
        let _ = stream;
        Ok(())
    }

    /// The stream entered the active set.
    fn on_stream_active(&mut self, stream: &mut H2Stream) -> Result<(), Error> {
        let _ = stream;
        Ok(())
    }

    /// Open stream went half-closed; `stream.state()` tells which side.
    fn on_stream_half_closed(&mut self, stream: &mut H2Stream) -> Result<(), Error> {
        let _ = stream;
        Ok(())
    }

    /// The stream left the active set.
    fn on_stream_closed(&mut self, stream: &mut H2Stream) -> Result<(), Error> {
        let _ = stream;
        Ok(())
    }

    /// The stream is about to be dropped from the stream map.
    fn on_stream_removed(&mut self, stream: &mut H2Stream) -> Result<(), Error> {
        let _ = stream;
        Ok(())
    }

    fn on_go_away_sent(
        &mut self,
        last_stream_id: StreamId,
        code: H2Error,
        debug_data: &[u8],
    ) -> Result<(), Error> {
        let _ = (last_stream_id, code, debug_data);
        Ok(())
    }

    fn on_go_away_received(
        &mut self,
        last_stream_id: StreamId,
        code: H2Error,
        debug_data: &[u8],
    ) -> Result<(), Error> {
        let _ = (last_stream_id, code, debug_data);
        Ok(())
    }
}

/// Notified when a stream flips between writable and not writable.
pub trait WritabilityListener {
    fn writability_changed(&mut self, stream_id: StreamId, writable: bool);
}
