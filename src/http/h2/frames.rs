//! HTTP/2 frame objects
//!
//! Structured frames as produced by [`codec::parse`](super::codec::parse) and
//! consumed by [`codec::serialize`](super::codec::serialize). Header blocks
//! are carried as opaque, already-compressed bytes.

use super::error::ErrorCode;
use super::settings::Settings;
use super::stream::StreamId;
use bytes::Bytes;
use std::fmt;

/// HTTP/2 frame types (RFC 7540 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    /// Convert frame type to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Create frame type from u8
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::Goaway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }

    /// Get frame type name
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// HTTP/2 frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// END_STREAM flag (0x1)
    pub const END_STREAM: u8 = 0x1;

    /// ACK flag (0x1) - used for SETTINGS and PING
    pub const ACK: u8 = 0x1;

    /// END_HEADERS flag (0x4)
    pub const END_HEADERS: u8 = 0x4;

    /// PADDED flag (0x8)
    pub const PADDED: u8 = 0x8;

    /// PRIORITY flag (0x20)
    pub const PRIORITY: u8 = 0x20;

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Set `flag` when `on` is true
    pub fn set_if(&mut self, flag: u8, on: bool) {
        if on {
            self.0 |= flag;
        }
    }

    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// DATA frame (RFC 7540 Section 6.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: StreamId,
    pub data: Bytes,
    pub end_stream: bool,
    /// Bytes of padding (including the pad length octet) counted against
    /// flow control on receipt
    pub padding: u32,
}

impl DataFrame {
    pub fn new(stream_id: StreamId, data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            stream_id,
            data,
            end_stream,
            padding: 0,
        }
    }

    /// Size of the frame payload for flow-control accounting
    pub fn flow_controlled_len(&self) -> usize {
        self.data.len() + self.padding as usize
    }
}

/// HEADERS frame (RFC 7540 Section 6.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    pub stream_id: StreamId,
    /// Header block fragment
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<PrioritySpec>,
}

impl HeadersFrame {
    pub fn new(stream_id: StreamId, header_block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        HeadersFrame {
            stream_id,
            header_block,
            end_stream,
            end_headers,
            priority: None,
        }
    }
}

/// Priority specification (RFC 7540 Section 6.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub stream_dependency: StreamId,
    pub exclusive: bool,
    pub weight: u8,
}

/// PRIORITY frame (RFC 7540 Section 6.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFrame {
    pub stream_id: StreamId,
    pub priority: PrioritySpec,
}

/// RST_STREAM frame (RFC 7540 Section 6.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub error_code: ErrorCode,
}

impl RstStreamFrame {
    pub fn new(stream_id: StreamId, error_code: ErrorCode) -> Self {
        RstStreamFrame { stream_id, error_code }
    }
}

/// SETTINGS frame (RFC 7540 Section 6.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    pub ack: bool,
    pub settings: Settings,
}

impl SettingsFrame {
    pub fn new(settings: Settings) -> Self {
        SettingsFrame { ack: false, settings }
    }

    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            settings: Settings::default(),
        }
    }
}

/// PUSH_PROMISE frame (RFC 7540 Section 6.6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromiseFrame {
    /// Originating stream
    pub stream_id: StreamId,
    pub promised_stream_id: StreamId,
    pub header_block: Bytes,
    pub end_headers: bool,
}

impl PushPromiseFrame {
    pub fn new(stream_id: StreamId, promised_stream_id: StreamId, header_block: Bytes) -> Self {
        PushPromiseFrame {
            stream_id,
            promised_stream_id,
            header_block,
            end_headers: true,
        }
    }
}

/// PING frame (RFC 7540 Section 6.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        PingFrame { ack: false, data }
    }

    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }
}

/// GOAWAY frame (RFC 7540 Section 6.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoawayFrame {
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoawayFrame {
    pub fn new(last_stream_id: StreamId, error_code: ErrorCode, debug_data: Bytes) -> Self {
        GoawayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }
    }
}

/// WINDOW_UPDATE frame (RFC 7540 Section 6.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    /// 0 for the connection window
    pub stream_id: StreamId,
    pub size_increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: StreamId, size_increment: u32) -> Self {
        WindowUpdateFrame {
            stream_id,
            size_increment,
        }
    }
}

/// CONTINUATION frame (RFC 7540 Section 6.10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    pub stream_id: StreamId,
    pub header_block: Bytes,
    pub end_headers: bool,
}

/// A parsed HTTP/2 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    Goaway(GoawayFrame),
    WindowUpdate(WindowUpdateFrame),
    Continuation(ContinuationFrame),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Data(_) => FrameType::Data,
            Frame::Headers(_) => FrameType::Headers,
            Frame::Priority(_) => FrameType::Priority,
            Frame::RstStream(_) => FrameType::RstStream,
            Frame::Settings(_) => FrameType::Settings,
            Frame::PushPromise(_) => FrameType::PushPromise,
            Frame::Ping(_) => FrameType::Ping,
            Frame::Goaway(_) => FrameType::Goaway,
            Frame::WindowUpdate(_) => FrameType::WindowUpdate,
            Frame::Continuation(_) => FrameType::Continuation,
        }
    }

    /// Stream the frame is addressed to (0 for connection-level frames)
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Data(f) => f.stream_id,
            Frame::Headers(f) => f.stream_id,
            Frame::Priority(f) => f.stream_id,
            Frame::RstStream(f) => f.stream_id,
            Frame::PushPromise(f) => f.stream_id,
            Frame::WindowUpdate(f) => f.stream_id,
            Frame::Continuation(f) => f.stream_id,
            Frame::Settings(_) | Frame::Ping(_) | Frame::Goaway(_) => 0,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stream={}", self.frame_type().name(), self.stream_id())
    }
}
