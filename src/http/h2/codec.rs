//! HTTP/2 frame encoding and decoding
//!
//! Byte-level layout of every frame type (RFC 7540 Section 4.1 and 6).
//! [`serialize`] turns a [`Frame`] into wire bytes, [`parse`] does the
//! inverse given an already-read header and payload, and [`read_frame`]
//! pulls one frame off any blocking reader.
//!
//! Header blocks bigger than the peer's maximum frame size are split into a
//! HEADERS/PUSH_PROMISE frame followed by CONTINUATION frames in one
//! contiguous buffer, so a single queue entry always carries a complete
//! block.

use super::error::{Error, ErrorCode, Result};
use super::frames::*;
use super::settings::{Settings, MAX_MAX_FRAME_SIZE};
use super::stream::StreamId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Read;

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Decoded 9-byte frame header
///
/// The type is kept raw so that unknown frame types reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    pub frame_type: u8,
    pub flags: FrameFlags,
    pub stream_id: StreamId,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, flags: FrameFlags, stream_id: StreamId, length: usize) -> Self {
        FrameHeader {
            length,
            frame_type: frame_type.as_u8(),
            flags,
            stream_id,
        }
    }

    /// Encode into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_uint(self.length as u64, 3);
        buf.put_u8(self.frame_type);
        buf.put_u8(self.flags.as_u8());
        // Reserved bit is always sent as zero
        buf.put_u32(self.stream_id & 0x7FFF_FFFF);
    }

    /// Decode from exactly nine bytes
    pub fn decode(bytes: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
        let stream_id = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & 0x7FFF_FFFF;

        FrameHeader {
            length,
            frame_type: bytes[3],
            flags: FrameFlags::from_u8(bytes[4]),
            stream_id,
        }
    }
}

/// Serialize a frame into wire bytes
pub fn serialize(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::new();
    serialize_into(frame, &mut buf);
    buf.freeze()
}

/// Append the wire encoding of `frame` to `buf`
pub fn serialize_into(frame: &Frame, buf: &mut BytesMut) {
    match frame {
        Frame::Data(f) => {
            let mut flags = FrameFlags::empty();
            flags.set_if(FrameFlags::END_STREAM, f.end_stream);
            put_frame(buf, FrameType::Data, flags, f.stream_id, &f.data);
        }
        Frame::Headers(f) => {
            let mut flags = FrameFlags::empty();
            flags.set_if(FrameFlags::END_STREAM, f.end_stream);
            flags.set_if(FrameFlags::END_HEADERS, f.end_headers);
            flags.set_if(FrameFlags::PRIORITY, f.priority.is_some());

            let priority_len = if f.priority.is_some() { 5 } else { 0 };
            FrameHeader::new(FrameType::Headers, flags, f.stream_id, priority_len + f.header_block.len())
                .encode(buf);
            if let Some(priority) = &f.priority {
                put_priority(buf, priority);
            }
            buf.put_slice(&f.header_block);
        }
        Frame::Priority(f) => {
            FrameHeader::new(FrameType::Priority, FrameFlags::empty(), f.stream_id, 5).encode(buf);
            put_priority(buf, &f.priority);
        }
        Frame::RstStream(f) => {
            FrameHeader::new(FrameType::RstStream, FrameFlags::empty(), f.stream_id, 4).encode(buf);
            buf.put_u32(f.error_code.as_u32());
        }
        Frame::Settings(f) => {
            if f.ack {
                put_frame(buf, FrameType::Settings, FrameFlags::from_u8(FrameFlags::ACK), 0, &[]);
            } else {
                put_frame(buf, FrameType::Settings, FrameFlags::empty(), 0, &f.settings.encode_payload());
            }
        }
        Frame::PushPromise(f) => {
            let mut flags = FrameFlags::empty();
            flags.set_if(FrameFlags::END_HEADERS, f.end_headers);
            FrameHeader::new(FrameType::PushPromise, flags, f.stream_id, 4 + f.header_block.len()).encode(buf);
            buf.put_u32(f.promised_stream_id & 0x7FFF_FFFF);
            buf.put_slice(&f.header_block);
        }
        Frame::Ping(f) => {
            let mut flags = FrameFlags::empty();
            flags.set_if(FrameFlags::ACK, f.ack);
            put_frame(buf, FrameType::Ping, flags, 0, &f.data);
        }
        Frame::Goaway(f) => {
            FrameHeader::new(FrameType::Goaway, FrameFlags::empty(), 0, 8 + f.debug_data.len()).encode(buf);
            buf.put_u32(f.last_stream_id & 0x7FFF_FFFF);
            buf.put_u32(f.error_code.as_u32());
            buf.put_slice(&f.debug_data);
        }
        Frame::WindowUpdate(f) => {
            FrameHeader::new(FrameType::WindowUpdate, FrameFlags::empty(), f.stream_id, 4).encode(buf);
            buf.put_u32(f.size_increment & 0x7FFF_FFFF);
        }
        Frame::Continuation(f) => {
            let mut flags = FrameFlags::empty();
            flags.set_if(FrameFlags::END_HEADERS, f.end_headers);
            put_frame(buf, FrameType::Continuation, flags, f.stream_id, &f.header_block);
        }
    }
}

fn put_frame(buf: &mut BytesMut, frame_type: FrameType, flags: FrameFlags, stream_id: StreamId, payload: &[u8]) {
    FrameHeader::new(frame_type, flags, stream_id, payload.len()).encode(buf);
    buf.put_slice(payload);
}

fn put_priority(buf: &mut BytesMut, priority: &PrioritySpec) {
    let mut dep = priority.stream_dependency & 0x7FFF_FFFF;
    if priority.exclusive {
        dep |= 0x8000_0000;
    }
    buf.put_u32(dep);
    buf.put_u8(priority.weight);
}

/// Serialize a complete header block as HEADERS + CONTINUATION frames
pub fn serialize_headers(stream_id: StreamId, block: &[u8], end_stream: bool, max_frame_size: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(block.len() + FRAME_HEADER_SIZE);
    let max = max_frame_size as usize;
    let (first, rest) = block.split_at(block.len().min(max));

    let mut flags = FrameFlags::empty();
    flags.set_if(FrameFlags::END_STREAM, end_stream);
    flags.set_if(FrameFlags::END_HEADERS, rest.is_empty());
    put_frame(&mut buf, FrameType::Headers, flags, stream_id, first);
    put_continuations(&mut buf, stream_id, rest, max);

    buf.freeze()
}

/// Serialize a complete push announcement as PUSH_PROMISE + CONTINUATION frames
pub fn serialize_push_promise(
    stream_id: StreamId,
    promised_stream_id: StreamId,
    block: &[u8],
    max_frame_size: u32,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(block.len() + FRAME_HEADER_SIZE + 4);
    let max = max_frame_size as usize;
    // The promised stream id shares the first frame with the block
    let (first, rest) = block.split_at(block.len().min(max - 4));

    let mut flags = FrameFlags::empty();
    flags.set_if(FrameFlags::END_HEADERS, rest.is_empty());
    FrameHeader::new(FrameType::PushPromise, flags, stream_id, 4 + first.len()).encode(&mut buf);
    buf.put_u32(promised_stream_id & 0x7FFF_FFFF);
    buf.put_slice(first);
    put_continuations(&mut buf, stream_id, rest, max);

    buf.freeze()
}

fn put_continuations(buf: &mut BytesMut, stream_id: StreamId, rest: &[u8], max: usize) {
    let mut chunks = rest.chunks(max).peekable();
    while let Some(chunk) = chunks.next() {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_HEADERS, chunks.peek().is_none());
        put_frame(buf, FrameType::Continuation, flags, stream_id, chunk);
    }
}

/// Parse a frame from its header and payload
///
/// Unknown frame types fail with [`Error::InvalidFrameType`].
pub fn parse(header: FrameHeader, mut payload: Bytes) -> Result<Frame> {
    let frame_type = FrameType::from_u8(header.frame_type).ok_or(Error::InvalidFrameType(header.frame_type))?;
    let flags = header.flags;
    let stream_id = header.stream_id;

    let require_stream = |what: &str| {
        if stream_id == 0 {
            Err(Error::Protocol(format!("{} frame on stream 0", what)))
        } else {
            Ok(())
        }
    };
    let require_connection = |what: &str| {
        if stream_id != 0 {
            Err(Error::Protocol(format!("{} frame on stream {}", what, stream_id)))
        } else {
            Ok(())
        }
    };

    let frame = match frame_type {
        FrameType::Data => {
            require_stream("DATA")?;
            let padding = strip_padding(flags, &mut payload)?;
            Frame::Data(DataFrame {
                stream_id,
                data: payload,
                end_stream: flags.is_end_stream(),
                padding,
            })
        }
        FrameType::Headers => {
            require_stream("HEADERS")?;
            strip_padding(flags, &mut payload)?;
            let priority = if flags.is_priority() {
                if payload.len() < 5 {
                    return Err(Error::FrameSize("HEADERS too short for priority".to_string()));
                }
                Some(take_priority(&mut payload))
            } else {
                None
            };
            Frame::Headers(HeadersFrame {
                stream_id,
                header_block: payload,
                end_stream: flags.is_end_stream(),
                end_headers: flags.is_end_headers(),
                priority,
            })
        }
        FrameType::Priority => {
            require_stream("PRIORITY")?;
            require_len("PRIORITY", &payload, 5)?;
            Frame::Priority(PriorityFrame {
                stream_id,
                priority: take_priority(&mut payload),
            })
        }
        FrameType::RstStream => {
            require_stream("RST_STREAM")?;
            require_len("RST_STREAM", &payload, 4)?;
            Frame::RstStream(RstStreamFrame::new(stream_id, ErrorCode::from_u32(payload.get_u32())))
        }
        FrameType::Settings => {
            require_connection("SETTINGS")?;
            if flags.is_ack() {
                if !payload.is_empty() {
                    return Err(Error::FrameSize("SETTINGS ACK with payload".to_string()));
                }
                Frame::Settings(SettingsFrame::ack())
            } else {
                Frame::Settings(SettingsFrame::new(Settings::decode_payload(&payload)?))
            }
        }
        FrameType::PushPromise => {
            require_stream("PUSH_PROMISE")?;
            strip_padding(flags, &mut payload)?;
            if payload.len() < 4 {
                return Err(Error::FrameSize("PUSH_PROMISE too short".to_string()));
            }
            let promised_stream_id = payload.get_u32() & 0x7FFF_FFFF;
            Frame::PushPromise(PushPromiseFrame {
                stream_id,
                promised_stream_id,
                header_block: payload,
                end_headers: flags.is_end_headers(),
            })
        }
        FrameType::Ping => {
            require_connection("PING")?;
            require_len("PING", &payload, 8)?;
            let mut data = [0u8; 8];
            payload.copy_to_slice(&mut data);
            Frame::Ping(PingFrame { ack: flags.is_ack(), data })
        }
        FrameType::Goaway => {
            require_connection("GOAWAY")?;
            if payload.len() < 8 {
                return Err(Error::FrameSize("GOAWAY too short".to_string()));
            }
            let last_stream_id = payload.get_u32() & 0x7FFF_FFFF;
            let error_code = ErrorCode::from_u32(payload.get_u32());
            Frame::Goaway(GoawayFrame::new(last_stream_id, error_code, payload))
        }
        FrameType::WindowUpdate => {
            require_len("WINDOW_UPDATE", &payload, 4)?;
            Frame::WindowUpdate(WindowUpdateFrame::new(stream_id, payload.get_u32() & 0x7FFF_FFFF))
        }
        FrameType::Continuation => {
            require_stream("CONTINUATION")?;
            Frame::Continuation(ContinuationFrame {
                stream_id,
                header_block: payload,
                end_headers: flags.is_end_headers(),
            })
        }
    };

    Ok(frame)
}

fn require_len(what: &str, payload: &Bytes, len: usize) -> Result<()> {
    if payload.len() != len {
        return Err(Error::FrameSize(format!(
            "{} payload must be {} bytes, got {}",
            what,
            len,
            payload.len()
        )));
    }
    Ok(())
}

/// Remove padding in place, returning the padded overhead
fn strip_padding(flags: FrameFlags, payload: &mut Bytes) -> Result<u32> {
    if !flags.is_padded() {
        return Ok(0);
    }
    if payload.is_empty() {
        return Err(Error::FrameSize("PADDED frame without pad length".to_string()));
    }
    let pad_len = payload.get_u8() as usize;
    if pad_len > payload.len() {
        return Err(Error::Protocol(format!(
            "Padding length {} exceeds payload length {}",
            pad_len,
            payload.len()
        )));
    }
    payload.truncate(payload.len() - pad_len);
    Ok(pad_len as u32 + 1)
}

fn take_priority(payload: &mut Bytes) -> PrioritySpec {
    let dep = payload.get_u32();
    PrioritySpec {
        stream_dependency: dep & 0x7FFF_FFFF,
        exclusive: dep & 0x8000_0000 != 0,
        weight: payload.get_u8(),
    }
}

/// Read one raw frame from a blocking reader
///
/// Frames larger than `max_frame_size` (our advertised limit) fail with
/// [`Error::FrameSize`] before their payload is read.
pub fn read_frame<R: Read>(reader: &mut R, max_frame_size: u32) -> Result<(FrameHeader, Bytes)> {
    let mut head = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut head)?;
    let header = FrameHeader::decode(&head);

    if header.length > max_frame_size.min(MAX_MAX_FRAME_SIZE) as usize {
        return Err(Error::FrameSize(format!(
            "Frame payload of {} bytes exceeds limit {}",
            header.length, max_frame_size
        )));
    }

    let mut payload = vec![0u8; header.length];
    reader.read_exact(&mut payload)?;

    Ok((header, Bytes::from(payload)))
}
