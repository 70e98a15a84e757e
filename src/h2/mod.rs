//! HTTP/2 connection core (RFC 9113).
//!
//! Stream registry, outbound flow control and priority scheduling for one
//! connection. Sans-io like the rest of the crate: parsed frames go in
//! through [`H2Connection::on_frame`], outbound frames leave through a
//! [`FrameWriter`] when [`H2Connection::write_pending_bytes`] is called.

use alloc::collections::BTreeMap;

mod active;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod flow_control;
pub mod flow_controlled;
pub mod frame;
mod inbound;
pub mod io;
pub mod listener;
pub mod priority;
pub mod property;
pub mod stream;

pub use config::{ConnectionConfig, H2Settings, Role};
pub use connection::H2Connection;
pub use endpoint::{Endpoint, Side};
pub use flow_control::{FlowState, RemoteFlowController};
pub use flow_controlled::{DataFrame, FlowControlled, HeadersFrame};
pub use frame::{H2Frame, H2Priority};
pub use inbound::ResetOutcome;
pub use io::{FrameQueue, FrameWriter, OutboundFrame};
pub use listener::{StreamListener, WritabilityListener};
pub use priority::{Streamable, WeightedFairQueueDistributor};
pub use property::PropertyKey;
pub use stream::{H2Stream, StreamState};

/// HTTP/2 stream identifier (31 bits).
pub type StreamId = u32;

/// The virtual stream carrying connection-level state.
pub const CONNECTION_STREAM_ID: StreamId = 0;

pub const MAX_STREAM_ID: StreamId = 0x7fff_ffff;

pub(crate) type StreamMap = BTreeMap<StreamId, H2Stream>;
