//! HTTP/2 frame types and binary serialization.
//!
//! Implements the RFC 7540 frame layer: the 9-byte header codec, typed
//! payload parsers with padding and priority handling, and serializers for
//! everything the server emits. Parsers return `FrameError` — the RFC §7
//! error code plus a debug string — which the connection maps to GOAWAY or
//! RST_STREAM at the appropriate scope.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::StreamId;

/// Frame header size (9 bytes per RFC 7540 §4.1).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Client connection preface, received before any frame (RFC 7540 §3.5).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// An RFC 7540 §7 error code paired with debug text for GOAWAY frames.
pub type FrameError = (ErrorCode, &'static str);

/// Frame type identifiers per RFC 7540 §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        match ft {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(v) => v,
        }
    }
}

/// Frame flags.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1; // Same value, different context (SETTINGS/PING)
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// HTTP/2 error codes per RFC 7540 §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
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

impl From<u32> for ErrorCode {
    fn from(v: u32) -> Self {
        match v {
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
            // Unknown codes must be treated as equivalent to INTERNAL_ERROR.
            _ => Self::InternalError,
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: StreamId,
}

impl FrameHeader {
    /// Parse a frame header from bytes. The reserved bit of the stream id
    /// is ignored on receipt (RFC 7540 §4.1).
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32);
        let frame_type = FrameType::from(buf[3]);
        let flags = buf[4];
        let stream_id = ((buf[5] as u32 & 0x7f) << 24)
            | ((buf[6] as u32) << 16)
            | ((buf[7] as u32) << 8)
            | (buf[8] as u32);

        Some(Self {
            length,
            frame_type,
            flags,
            stream_id,
        })
    }

    /// Serialize a frame header.
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u8((self.length >> 8) as u8);
        buf.put_u8(self.length as u8);
        buf.put_u8(self.frame_type.into());
        buf.put_u8(self.flags);
        buf.put_u32(self.stream_id & 0x7fff_ffff);
    }
}

/// Priority data carried by a PRIORITY frame or a HEADERS frame with the
/// PRIORITY flag. The weight is kept in its effective 1..=256 form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityData {
    pub exclusive: bool,
    pub dependency: StreamId,
    pub weight: u16,
}

impl PriorityData {
    /// RFC 7540 §5.3.5 default priority.
    pub const DEFAULT: PriorityData = PriorityData {
        exclusive: false,
        dependency: 0,
        weight: 16,
    };

    fn parse(stream_id: StreamId, payload: &mut Bytes) -> Result<Self, FrameError> {
        if payload.remaining() < 5 {
            return Err((ErrorCode::FrameSizeError, "invalid PRIORITY payload"));
        }
        let dep_raw = payload.get_u32();
        let exclusive = (dep_raw & 0x8000_0000) != 0;
        let dependency = dep_raw & 0x7fff_ffff;
        let weight = u16::from(payload.get_u8()) + 1;
        if dependency == stream_id {
            return Err((ErrorCode::ProtocolError, "stream cannot depend on itself"));
        }
        Ok(Self {
            exclusive,
            dependency,
            weight,
        })
    }

    fn serialize(&self, buf: &mut BytesMut) {
        let dep = if self.exclusive {
            self.dependency | 0x8000_0000
        } else {
            self.dependency
        };
        buf.put_u32(dep);
        buf.put_u8((self.weight.clamp(1, 256) - 1) as u8);
    }
}

/// Strip the pad-length prefix and trailing padding from a PADDED payload.
fn strip_padding(payload: &mut Bytes) -> Result<usize, FrameError> {
    if payload.remaining() < 1 {
        return Err((ErrorCode::ProtocolError, "padded frame missing pad length"));
    }
    let pad_len = payload.get_u8() as usize;
    if pad_len >= payload.remaining() {
        return Err((ErrorCode::ProtocolError, "padding exceeds payload"));
    }
    Ok(pad_len)
}

/// SETTINGS frame payload.
#[derive(Debug, Clone)]
pub struct SettingsFrame {
    /// Parameters in wire order.
    pub settings: Vec<(u16, u32)>,
    pub ack: bool,
}

impl SettingsFrame {
    pub fn new(settings: Vec<(u16, u32)>) -> Self {
        Self {
            settings,
            ack: false,
        }
    }

    pub fn ack() -> Self {
        Self {
            settings: Vec::new(),
            ack: true,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let payload_len = if self.ack { 0 } else { self.settings.len() * 6 };
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        let header = FrameHeader {
            length: payload_len as u32,
            frame_type: FrameType::Settings,
            flags: if self.ack { flags::ACK } else { 0 },
            stream_id: 0,
        };
        header.serialize(&mut buf);
        if !self.ack {
            crate::settings::encode_entries(&self.settings, &mut buf);
        }
        buf
    }

    pub fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self, FrameError> {
        if header.stream_id != 0 {
            return Err((ErrorCode::ProtocolError, "invalid stream id in SETTINGS frame"));
        }
        let ack = (header.flags & flags::ACK) != 0;
        if ack {
            if header.length != 0 {
                return Err((ErrorCode::FrameSizeError, "invalid SETTINGS frame (+ACK)"));
            }
            return Ok(Self::ack());
        }
        if header.length % 6 != 0 {
            return Err((ErrorCode::FrameSizeError, "invalid SETTINGS frame"));
        }
        let mut settings = Vec::with_capacity(payload.remaining() / 6);
        while payload.remaining() >= 6 {
            let id = payload.get_u16();
            let value = payload.get_u32();
            settings.push((id, value));
        }
        Ok(Self {
            settings,
            ack: false,
        })
    }
}

/// DATA frame.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: StreamId,
    pub data: Bytes,
    pub end_stream: bool,
}

impl DataFrame {
    pub fn new(stream_id: StreamId, data: Bytes) -> Self {
        Self {
            stream_id,
            data,
            end_stream: false,
        }
    }

    pub fn end_stream(mut self, end: bool) -> Self {
        self.end_stream = end;
        self
    }

    pub fn serialize_into(&self, buf: &mut BytesMut) {
        let header = FrameHeader {
            length: self.data.len() as u32,
            frame_type: FrameType::Data,
            flags: if self.end_stream { flags::END_STREAM } else { 0 },
            stream_id: self.stream_id,
        };
        header.serialize(buf);
        buf.extend_from_slice(&self.data);
    }

    pub fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self, FrameError> {
        if header.stream_id == 0 {
            return Err((ErrorCode::ProtocolError, "invalid stream id in DATA frame"));
        }
        let end_stream = (header.flags & flags::END_STREAM) != 0;
        let data = if (header.flags & flags::PADDED) != 0 {
            let pad_len = strip_padding(&mut payload)?;
            let data_len = payload.remaining() - pad_len;
            payload.copy_to_bytes(data_len)
        } else {
            payload
        };
        Ok(Self {
            stream_id: header.stream_id,
            data,
            end_stream,
        })
    }
}

/// HEADERS frame.
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: StreamId,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<PriorityData>,
}

impl HeadersFrame {
    pub fn new(stream_id: StreamId, header_block: Bytes) -> Self {
        Self {
            stream_id,
            header_block,
            end_stream: false,
            end_headers: true,
            priority: None,
        }
    }

    pub fn end_stream(mut self, end: bool) -> Self {
        self.end_stream = end;
        self
    }

    pub fn end_headers(mut self, end: bool) -> Self {
        self.end_headers = end;
        self
    }

    pub fn with_priority(mut self, priority: PriorityData) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn serialize(&self) -> BytesMut {
        let priority_len = if self.priority.is_some() { 5 } else { 0 };
        let payload_len = priority_len + self.header_block.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);

        let mut frame_flags = 0u8;
        if self.end_stream {
            frame_flags |= flags::END_STREAM;
        }
        if self.end_headers {
            frame_flags |= flags::END_HEADERS;
        }
        if self.priority.is_some() {
            frame_flags |= flags::PRIORITY;
        }

        let header = FrameHeader {
            length: payload_len as u32,
            frame_type: FrameType::Headers,
            flags: frame_flags,
            stream_id: self.stream_id,
        };
        header.serialize(&mut buf);
        if let Some(priority) = &self.priority {
            priority.serialize(&mut buf);
        }
        buf.extend_from_slice(&self.header_block);
        buf
    }

    pub fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self, FrameError> {
        if header.stream_id == 0 {
            return Err((ErrorCode::ProtocolError, "invalid stream id in HEADERS frame"));
        }
        let end_stream = (header.flags & flags::END_STREAM) != 0;
        let end_headers = (header.flags & flags::END_HEADERS) != 0;

        let pad_len = if (header.flags & flags::PADDED) != 0 {
            strip_padding(&mut payload)?
        } else {
            0
        };
        let priority = if (header.flags & flags::PRIORITY) != 0 {
            Some(PriorityData::parse(header.stream_id, &mut payload)?)
        } else {
            None
        };
        let block_len = payload
            .remaining()
            .checked_sub(pad_len)
            .ok_or((ErrorCode::ProtocolError, "padding exceeds payload"))?;
        let header_block = payload.copy_to_bytes(block_len);

        Ok(Self {
            stream_id: header.stream_id,
            header_block,
            end_stream,
            end_headers,
            priority,
        })
    }
}

/// CONTINUATION frame (RFC 7540 §6.10).
#[derive(Debug, Clone)]
pub struct ContinuationFrame {
    pub stream_id: StreamId,
    pub end_headers: bool,
    pub header_fragment: Bytes,
}

impl ContinuationFrame {
    pub fn new(stream_id: StreamId, header_fragment: Bytes, end_headers: bool) -> Self {
        Self {
            stream_id,
            end_headers,
            header_fragment,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.header_fragment.len());
        let header = FrameHeader {
            length: self.header_fragment.len() as u32,
            frame_type: FrameType::Continuation,
            flags: if self.end_headers { flags::END_HEADERS } else { 0 },
            stream_id: self.stream_id,
        };
        header.serialize(&mut buf);
        buf.extend_from_slice(&self.header_fragment);
        buf
    }

    pub fn parse(header: &FrameHeader, payload: Bytes) -> Result<Self, FrameError> {
        if header.stream_id == 0 {
            return Err((
                ErrorCode::ProtocolError,
                "invalid stream id in CONTINUATION frame",
            ));
        }
        Ok(Self {
            stream_id: header.stream_id,
            end_headers: (header.flags & flags::END_HEADERS) != 0,
            header_fragment: payload,
        })
    }
}

/// PRIORITY frame (RFC 7540 §6.3).
#[derive(Debug, Clone)]
pub struct PriorityFrame {
    pub stream_id: StreamId,
    pub priority: PriorityData,
}

impl PriorityFrame {
    pub fn new(stream_id: StreamId, priority: PriorityData) -> Self {
        Self {
            stream_id,
            priority,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 5);
        let header = FrameHeader {
            length: 5,
            frame_type: FrameType::Priority,
            flags: 0,
            stream_id: self.stream_id,
        };
        header.serialize(&mut buf);
        self.priority.serialize(&mut buf);
        buf
    }

    pub fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self, FrameError> {
        if header.stream_id == 0 {
            return Err((ErrorCode::ProtocolError, "invalid stream id in PRIORITY frame"));
        }
        if header.length != 5 {
            return Err((ErrorCode::FrameSizeError, "invalid PRIORITY frame"));
        }
        let priority = PriorityData::parse(header.stream_id, &mut payload)?;
        Ok(Self {
            stream_id: header.stream_id,
            priority,
        })
    }
}

/// RST_STREAM frame.
#[derive(Debug, Clone)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub error_code: ErrorCode,
}

impl RstStreamFrame {
    pub fn new(stream_id: StreamId, error_code: ErrorCode) -> Self {
        Self {
            stream_id,
            error_code,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        let header = FrameHeader {
            length: 4,
            frame_type: FrameType::RstStream,
            flags: 0,
            stream_id: self.stream_id,
        };
        header.serialize(&mut buf);
        buf.put_u32(self.error_code as u32);
        buf
    }

    pub fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self, FrameError> {
        if header.stream_id == 0 {
            return Err((
                ErrorCode::ProtocolError,
                "invalid stream id in RST_STREAM frame",
            ));
        }
        if header.length != 4 {
            return Err((ErrorCode::FrameSizeError, "invalid RST_STREAM frame"));
        }
        Ok(Self {
            stream_id: header.stream_id,
            error_code: ErrorCode::from(payload.get_u32()),
        })
    }
}

/// PING frame.
#[derive(Debug, Clone)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn ack(data: [u8; 8]) -> Self {
        Self { ack: true, data }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
        let header = FrameHeader {
            length: 8,
            frame_type: FrameType::Ping,
            flags: if self.ack { flags::ACK } else { 0 },
            stream_id: 0,
        };
        header.serialize(&mut buf);
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn parse(header: &FrameHeader, payload: &[u8]) -> Result<Self, FrameError> {
        if header.stream_id != 0 {
            return Err((ErrorCode::ProtocolError, "invalid stream id in PING frame"));
        }
        if payload.len() != 8 {
            return Err((ErrorCode::FrameSizeError, "invalid PING frame"));
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(payload);
        Ok(Self {
            ack: (header.flags & flags::ACK) != 0,
            data,
        })
    }
}

/// GOAWAY frame.
#[derive(Debug, Clone)]
pub struct GoAwayFrame {
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoAwayFrame {
    pub fn new(last_stream_id: StreamId, error_code: ErrorCode) -> Self {
        Self {
            last_stream_id,
            error_code,
            debug_data: Bytes::new(),
        }
    }

    pub fn with_debug_data(mut self, data: &'static str) -> Self {
        self.debug_data = Bytes::from_static(data.as_bytes());
        self
    }

    pub fn serialize(&self) -> BytesMut {
        let payload_len = 8 + self.debug_data.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        let header = FrameHeader {
            length: payload_len as u32,
            frame_type: FrameType::GoAway,
            flags: 0,
            stream_id: 0,
        };
        header.serialize(&mut buf);
        buf.put_u32(self.last_stream_id & 0x7fff_ffff);
        buf.put_u32(self.error_code as u32);
        buf.extend_from_slice(&self.debug_data);
        buf
    }

    pub fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self, FrameError> {
        if header.stream_id != 0 {
            return Err((ErrorCode::ProtocolError, "invalid stream id in GOAWAY frame"));
        }
        if payload.remaining() < 8 {
            return Err((ErrorCode::FrameSizeError, "invalid GOAWAY frame"));
        }
        let last_stream_id = payload.get_u32() & 0x7fff_ffff;
        let error_code = ErrorCode::from(payload.get_u32());
        let debug_data = payload.copy_to_bytes(payload.remaining());
        Ok(Self {
            last_stream_id,
            error_code,
            debug_data,
        })
    }
}

/// WINDOW_UPDATE frame.
#[derive(Debug, Clone)]
pub struct WindowUpdateFrame {
    pub stream_id: StreamId,
    pub increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: StreamId, increment: u32) -> Self {
        Self {
            stream_id,
            increment,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        let header = FrameHeader {
            length: 4,
            frame_type: FrameType::WindowUpdate,
            flags: 0,
            stream_id: self.stream_id,
        };
        header.serialize(&mut buf);
        buf.put_u32(self.increment & 0x7fff_ffff);
        buf
    }

    /// A zero increment is left to the caller: its error scope depends on
    /// whether the frame addressed the connection or a stream.
    pub fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self, FrameError> {
        if header.length != 4 {
            return Err((ErrorCode::FrameSizeError, "invalid WINDOW_UPDATE frame"));
        }
        Ok(Self {
            stream_id: header.stream_id,
            increment: payload.get_u32() & 0x7fff_ffff,
        })
    }
}

/// PUSH_PROMISE frame (RFC 7540 §6.6). The server only ever serializes
/// these; receiving one is a connection error handled at the dispatch
/// level.
#[derive(Debug, Clone)]
pub struct PushPromiseFrame {
    pub stream_id: StreamId,
    pub promised_stream_id: StreamId,
    pub header_block: Bytes,
}

impl PushPromiseFrame {
    pub fn new(stream_id: StreamId, promised_stream_id: StreamId, header_block: Bytes) -> Self {
        Self {
            stream_id,
            promised_stream_id,
            header_block,
        }
    }

    pub fn serialize_into(&self, buf: &mut BytesMut) {
        let payload_len = 4 + self.header_block.len();
        let header = FrameHeader {
            length: payload_len as u32,
            frame_type: FrameType::PushPromise,
            flags: flags::END_HEADERS,
            stream_id: self.stream_id,
        };
        header.serialize(buf);
        buf.put_u32(self.promised_stream_id & 0x7fff_ffff);
        buf.extend_from_slice(&self.header_block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_roundtrip() {
        let mut buf = BytesMut::new();
        FrameHeader {
            length: 18,
            frame_type: FrameType::Settings,
            flags: 0,
            stream_id: 0,
        }
        .serialize(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);

        let header = FrameHeader::parse(&buf).unwrap();
        assert_eq!(header.length, 18);
        assert_eq!(header.frame_type, FrameType::Settings);
        assert_eq!(header.stream_id, 0);
    }

    #[test]
    fn settings_ack_must_be_empty() {
        let header = FrameHeader {
            length: 6,
            frame_type: FrameType::Settings,
            flags: flags::ACK,
            stream_id: 0,
        };
        let err = SettingsFrame::parse(&header, Bytes::from_static(&[0; 6])).unwrap_err();
        assert_eq!(err.0, ErrorCode::FrameSizeError);
    }

    #[test]
    fn settings_payload_must_be_multiple_of_six() {
        let header = FrameHeader {
            length: 5,
            frame_type: FrameType::Settings,
            flags: 0,
            stream_id: 0,
        };
        let err = SettingsFrame::parse(&header, Bytes::from_static(&[0; 5])).unwrap_err();
        assert_eq!(err.0, ErrorCode::FrameSizeError);
    }

    #[test]
    fn data_padding_is_stripped() {
        let mut payload = BytesMut::new();
        payload.put_u8(3); // pad length
        payload.extend_from_slice(b"hello");
        payload.extend_from_slice(&[0u8; 3]);
        let header = FrameHeader {
            length: payload.len() as u32,
            frame_type: FrameType::Data,
            flags: flags::PADDED,
            stream_id: 1,
        };
        let frame = DataFrame::parse(&header, payload.freeze()).unwrap();
        assert_eq!(&frame.data[..], b"hello");
    }

    #[test]
    fn data_padding_exceeding_payload_is_rejected() {
        let mut payload = BytesMut::new();
        payload.put_u8(10);
        payload.extend_from_slice(b"hi");
        let header = FrameHeader {
            length: payload.len() as u32,
            frame_type: FrameType::Data,
            flags: flags::PADDED,
            stream_id: 1,
        };
        let err = DataFrame::parse(&header, payload.freeze()).unwrap_err();
        assert_eq!(err.0, ErrorCode::ProtocolError);
    }

    #[test]
    fn headers_priority_weight_is_effective_form() {
        let prio = PriorityData {
            exclusive: true,
            dependency: 3,
            weight: 200,
        };
        let buf = HeadersFrame::new(5, Bytes::from_static(b"\x82"))
            .with_priority(prio)
            .serialize();
        let header = FrameHeader::parse(&buf).unwrap();
        let parsed =
            HeadersFrame::parse(&header, Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..]))
                .unwrap();
        assert_eq!(parsed.priority, Some(prio));
    }

    #[test]
    fn priority_self_dependency_rejected_at_decode() {
        let buf = PriorityFrame::new(
            3,
            PriorityData {
                exclusive: false,
                dependency: 0,
                weight: 16,
            },
        )
        .serialize();
        // Rewrite the dependency to equal the frame's own stream id.
        let mut raw = buf.to_vec();
        raw[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + 4].copy_from_slice(&3u32.to_be_bytes());
        let header = FrameHeader::parse(&raw).unwrap();
        let err =
            PriorityFrame::parse(&header, Bytes::copy_from_slice(&raw[FRAME_HEADER_SIZE..]))
                .unwrap_err();
        assert_eq!(err.0, ErrorCode::ProtocolError);
    }

    #[test]
    fn goaway_roundtrip_with_debug_data() {
        let buf = GoAwayFrame::new(7, ErrorCode::NoError)
            .with_debug_data("graceful shutdown")
            .serialize();
        let header = FrameHeader::parse(&buf).unwrap();
        let frame =
            GoAwayFrame::parse(&header, Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..]))
                .unwrap();
        assert_eq!(frame.last_stream_id, 7);
        assert_eq!(frame.error_code, ErrorCode::NoError);
        assert_eq!(&frame.debug_data[..], b"graceful shutdown");
    }

    #[test]
    fn ping_requires_eight_bytes() {
        let header = FrameHeader {
            length: 4,
            frame_type: FrameType::Ping,
            flags: 0,
            stream_id: 0,
        };
        let err = PingFrame::parse(&header, &[0u8; 4]).unwrap_err();
        assert_eq!(err.0, ErrorCode::FrameSizeError);
    }
}
