//! HTTP/2 error types
//!
//! This module defines error types for HTTP/2 operations, mapping to
//! the error codes defined in RFC 7540 Section 7.
//!
//! Errors fall into three groups:
//!
//! - rejections returned before any mutation (`PushDisabled`,
//!   `ConcurrencyLimitExceeded`), which never tear anything down
//! - connection-fatal protocol violations (`IllegalStreamTransition`,
//!   `HeaderDecompression`, `Protocol`, ...), always followed by teardown
//! - transport failures, of which a small allow-list counts as an
//!   ordinary disconnect (see [`Error::is_benign_disconnect`])

use super::stream::{StreamEvent, StreamId, StreamState};
use std::fmt;
use std::io;

/// HTTP/2 errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the session layer
    #[error("HTTP error: {0}")]
    Http(#[from] crate::http::Error),

    /// Error from the TLS layer
    #[error("TLS error: {0}")]
    Tls(#[from] crate::http::tls::TlsError),

    /// Transport, TLS or preface failure before the connection opened
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// ALPN negotiated something other than h2
    #[error("ALPN negotiation failed: expected h2, got {0:?}")]
    AlpnFailed(Option<Vec<u8>>),

    /// Creating a stream would exceed the peer's concurrency limit
    #[error("Concurrency limit exceeded: {active} streams, peer allows {limit}")]
    ConcurrencyLimitExceeded { active: usize, limit: u32 },

    /// Server push is not possible on this connection
    #[error("Push disabled: {0}")]
    PushDisabled(&'static str),

    /// A stream event outside the legal edge set
    #[error("Illegal transition on stream {stream_id}: {event:?} in state {from:?}")]
    IllegalStreamTransition {
        stream_id: StreamId,
        from: StreamState,
        event: StreamEvent,
    },

    /// Malformed header block or desynchronized compression context
    #[error("Header decompression failed: {0}")]
    HeaderDecompression(String),

    /// A header block kept growing through CONTINUATION frames past our limit
    #[error("Header block on stream {stream_id} exceeds {limit} octets")]
    HeaderBlockTooLarge { stream_id: StreamId, limit: usize },

    /// The push announcement was committed but could not be written
    #[error("Push transmission failed for stream {stream_id}: {reason}")]
    PushTransmissionFailed { stream_id: StreamId, reason: String },

    /// Protocol error detected (RFC 7540 Section 7 - Error code 0x1)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Flow control error (RFC 7540 Section 7 - Error code 0x3)
    #[error("Flow control error: {0}")]
    FlowControl(String),

    /// Stream closed (RFC 7540 Section 7 - Error code 0x5)
    #[error("Stream closed: {0}")]
    StreamClosed(u32),

    /// Frame size error (RFC 7540 Section 7 - Error code 0x6)
    #[error("Frame size error: {0}")]
    FrameSize(String),

    /// Refused stream (RFC 7540 Section 7 - Error code 0x7)
    #[error("Refused stream: {0}")]
    RefusedStream(u32),

    /// Compression error on the encoding side
    #[error("Compression error: {0}")]
    Compression(String),

    /// Invalid frame type
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    /// Stream not found
    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    /// Invalid settings value
    #[error("Invalid settings value: {0}")]
    InvalidSettings(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Whether this error is an ordinary disconnect rather than a failure
    ///
    /// Clean EOF and the usual "peer went away" socket errors are swallowed
    /// after teardown instead of being reported.
    pub fn is_benign_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => is_benign_io(e),
            Error::Http(crate::http::Error::Io(e)) => is_benign_io(e),
            Error::Http(crate::http::Error::ConnectionClosed) => true,
            Error::ConnectionClosed => true,
            _ => false,
        }
    }

    /// Whether this error ends the whole connection
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(
            self,
            Error::ConcurrencyLimitExceeded { .. }
                | Error::PushDisabled(_)
                | Error::PushTransmissionFailed { .. }
                | Error::RefusedStream(_)
                | Error::StreamNotFound(_)
        )
    }

    /// RFC 7540 error code to report to the peer for this error
    pub fn error_code(&self) -> ErrorCode {
        if self.is_benign_disconnect() {
            return ErrorCode::NoError;
        }
        match self {
            Error::Handshake(_)
            | Error::Protocol(_)
            | Error::IllegalStreamTransition { .. }
            | Error::InvalidFrameType(_)
            | Error::InvalidSettings(_)
            | Error::PushDisabled(_) => ErrorCode::ProtocolError,
            Error::HeaderDecompression(_) => ErrorCode::CompressionError,
            Error::HeaderBlockTooLarge { .. } => ErrorCode::EnhanceYourCalm,
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::StreamClosed(_) => ErrorCode::StreamClosed,
            Error::RefusedStream(_) | Error::ConcurrencyLimitExceeded { .. } => ErrorCode::RefusedStream,
            Error::AlpnFailed(_) | Error::Tls(_) => ErrorCode::InadequateSecurity,
            _ => ErrorCode::InternalError,
        }
    }
}

fn is_benign_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// HTTP/2 error codes as defined in RFC 7540 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Create error code from u32
    ///
    /// Unknown codes are mapped to `InternalError` as RFC 7540 Section 7
    /// allows; the raw value is kept by the frame that carried it.
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            _ => ErrorCode::InternalError,
        }
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;
