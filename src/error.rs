use crate::h2::StreamId;

/// HTTP/2 error codes (RFC 9113 §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum H2Error {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl H2Error {
    pub const fn to_code(self) -> u32 {
        self as u32
    }

    /// Parse a wire error code. Unknown codes are treated as `InternalError`
    /// (RFC 9113 §7: they MUST NOT trigger special behavior).
    pub fn from_code(code: u32) -> Self {
        match code {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }
}

impl core::fmt::Display for H2Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?} (0x{:x})", self.to_code())
    }
}

/// Top-level crate error.
///
/// `Connection` and `Stream` are the two protocol tiers: the first is fatal
/// and ends in GOAWAY, the second only resets the offending stream. The
/// remaining variants are API misuse and never reach the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Fatal protocol error, the connection must be torn down.
    #[error("connection error {code}: {reason}")]
    Connection { code: H2Error, reason: &'static str },
    /// The stream must be reset, the connection survives.
    #[error("stream {stream_id} error {code}: {reason}")]
    Stream {
        stream_id: StreamId,
        code: H2Error,
        reason: &'static str,
    },
    /// Caller passed a value outside the accepted range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The operation is not supported on the virtual connection stream.
    #[error("operation not supported on the connection stream")]
    ConnectionStream,
    #[error("stream {0} not found")]
    StreamNotFound(StreamId),
    /// A property key issued by one connection was used on another.
    #[error("property key does not belong to this connection")]
    PropertyKeyMismatch,
    #[error("no property keys left")]
    PropertyKeysExhausted,
}

impl Error {
    pub const fn connection(code: H2Error, reason: &'static str) -> Self {
        Error::Connection { code, reason }
    }

    pub const fn stream(stream_id: StreamId, code: H2Error, reason: &'static str) -> Self {
        Error::Stream {
            stream_id,
            code,
            reason,
        }
    }

    /// Stream error for `stream_id`, promoted to a connection error when the
    /// id is the connection stream.
    pub const fn for_stream(stream_id: StreamId, code: H2Error, reason: &'static str) -> Self {
        if stream_id == 0 {
            Self::connection(code, reason)
        } else {
            Self::stream(stream_id, code, reason)
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }

    pub fn is_stream_error(&self) -> bool {
        matches!(self, Error::Stream { .. })
    }

    /// The HTTP/2 code to put on the wire for this error.
    pub fn code(&self) -> H2Error {
        match self {
            Error::Connection { code, .. } | Error::Stream { code, .. } => *code,
            _ => H2Error::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_match_rfc() {
        assert_eq!(H2Error::FlowControlError.to_code(), 0x3);
        assert_eq!(H2Error::from_code(0x7), H2Error::RefusedStream);
    }

    #[test]
    fn unknown_code_is_internal_error() {
        assert_eq!(H2Error::from_code(0xff), H2Error::InternalError);
    }

    #[test]
    fn connection_stream_promotes_to_connection_error() {
        let err = Error::for_stream(0, H2Error::FlowControlError, "overflow");
        assert!(err.is_connection_error());
        let err = Error::for_stream(3, H2Error::FlowControlError, "overflow");
        assert!(err.is_stream_error());
        assert_eq!(err.code(), H2Error::FlowControlError);
    }

    #[test]
    fn misuse_maps_to_internal_error() {
        assert_eq!(Error::ConnectionStream.code(), H2Error::InternalError);
        assert!(!Error::StreamNotFound(7).is_connection_error());
    }

    #[test]
    fn display_includes_stream_and_code() {
        let err = Error::stream(5, H2Error::RefusedStream, "max streams");
        let text = alloc::format!("{err}");
        assert!(text.contains("stream 5"));
        assert!(text.contains("RefusedStream"));
    }
}
