//! Connection tunables and peer SETTINGS (RFC 9113 §6.5).

use crate::error::{Error, H2Error};

pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Default stream and connection window (RFC 9113 §6.9.2).
pub const DEFAULT_WINDOW_SIZE: i32 = 65_535;
/// Largest legal flow-control window.
pub const MAX_WINDOW_SIZE: i32 = i32::MAX;
pub const DEFAULT_MAX_RESERVED_STREAMS: usize = 100;
/// Closed-stream priority nodes kept around for late PRIORITY frames.
pub const DEFAULT_MAX_STATE_ONLY_SIZE: usize = 5;
pub const DEFAULT_ALLOCATION_QUANTUM: usize = 1024;
/// Floor for the per-round write budget when the transport is writable.
pub const DEFAULT_MIN_WRITABLE_CHUNK: usize = 32 * 1024;

/// Connection role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Local tunables of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Push reservations allowed on top of the active-stream limit.
    pub max_reserved_streams: usize,
    /// Initial send window for new streams until the peer says otherwise.
    pub initial_window_size: i32,
    /// Retained priority nodes for streams that no longer exist.
    pub max_state_only_size: usize,
    /// Granularity of the weighted fair queue, in bytes.
    pub allocation_quantum: usize,
    pub min_writable_chunk: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reserved_streams: DEFAULT_MAX_RESERVED_STREAMS,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_state_only_size: DEFAULT_MAX_STATE_ONLY_SIZE,
            allocation_quantum: DEFAULT_ALLOCATION_QUANTUM,
            min_writable_chunk: DEFAULT_MIN_WRITABLE_CHUNK,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.allocation_quantum == 0 {
            return Err(Error::InvalidArgument("allocation quantum must be positive"));
        }
        if self.initial_window_size < 0 {
            return Err(Error::InvalidArgument("initial window size must not be negative"));
        }
        Ok(())
    }
}

/// SETTINGS received from the peer. Only parameters present in the frame are
/// set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct H2Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

impl H2Settings {
    /// Build from decoded `(identifier, value)` pairs, validating each.
    pub fn from_params(params: &[(u16, u32)]) -> Result<Self, Error> {
        let mut settings = Self::default();
        for &(id, value) in params {
            settings.apply(id, value)?;
        }
        Ok(settings)
    }

    /// Apply a settings parameter with RFC 9113 §6.5.2 validation.
    pub fn apply(&mut self, id: u16, value: u32) -> Result<(), Error> {
        match id {
            SETTINGS_HEADER_TABLE_SIZE => self.header_table_size = Some(value),
            SETTINGS_ENABLE_PUSH => {
                if value > 1 {
                    return Err(Error::connection(
                        H2Error::ProtocolError,
                        "SETTINGS_ENABLE_PUSH must be 0 or 1",
                    ));
                }
                self.enable_push = Some(value != 0);
            }
            SETTINGS_MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
            SETTINGS_INITIAL_WINDOW_SIZE => {
                if value > MAX_WINDOW_SIZE as u32 {
                    return Err(Error::connection(
                        H2Error::FlowControlError,
                        "SETTINGS_INITIAL_WINDOW_SIZE above maximum window",
                    ));
                }
                self.initial_window_size = Some(value);
            }
            SETTINGS_MAX_FRAME_SIZE => {
                if !(16384..=16_777_215).contains(&value) {
                    return Err(Error::connection(
                        H2Error::ProtocolError,
                        "SETTINGS_MAX_FRAME_SIZE out of range",
                    ));
                }
                self.max_frame_size = Some(value);
            }
            SETTINGS_MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
            _ => {} // Unknown settings are ignored (RFC 9113 §6.5.2)
        }
        Ok(())
    }
}
