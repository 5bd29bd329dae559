//! HPACK codec boundary.
//!
//! Header compression is a pure codec at this layer: the `hpack` crate owns
//! the input and output dynamic tables, and this module adapts it to the
//! shapes the connection needs — request decoding with pseudo-header
//! existence tracking and content-length extraction, response encoding, and
//! trailer flattening. Header blocks larger than the peer's max frame size
//! are split across HEADERS/PUSH_PROMISE + CONTINUATION frames here, since
//! the split must happen after compression.

use bytes::{Bytes, BytesMut};

use crate::frame::{
    ContinuationFrame, ErrorCode, FrameError, HeadersFrame, PushPromiseFrame,
};
use crate::StreamId;

/// Bits recording which pseudo-headers were present in a request block.
pub mod exists {
    pub const METHOD: u8 = 1 << 0;
    pub const SCHEME: u8 = 1 << 1;
    pub const AUTHORITY: u8 = 1 << 2;
    pub const PATH: u8 = 1 << 3;
}

/// A decoded request head.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
    pub exists_map: u8,
}

impl RequestHeaders {
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

fn is_token_char(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z')
}

fn valid_header_name(name: &[u8]) -> bool {
    !name.is_empty() && name.iter().all(|&b| is_token_char(b))
}

fn valid_header_value(value: &[u8]) -> bool {
    value
        .iter()
        .all(|&b| b == b'\t' || (0x20..=0x7e).contains(&b) || b >= 0x80)
}

fn is_connection_specific(name: &str) -> bool {
    matches!(
        name,
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
    )
}

/// Stateful header codec for one connection: one decoder (the peer's
/// dynamic table) and one encoder (ours).
pub struct HeaderCodec {
    decoder: hpack::Decoder<'static>,
    encoder: hpack::Encoder<'static>,
}

impl HeaderCodec {
    pub fn new() -> Self {
        Self {
            decoder: hpack::Decoder::new(),
            encoder: hpack::Encoder::new(),
        }
    }

    /// Decode a request header block.
    ///
    /// Hard failures (compression state damage, pseudo-header rule
    /// violations, connection-specific fields) are connection errors.
    /// Invalid characters inside a field are recoverable: the request is
    /// still returned along with a description, and the caller answers it
    /// with a 400 instead of killing the connection.
    pub fn decode_request(
        &mut self,
        block: &[u8],
    ) -> Result<(RequestHeaders, Option<&'static str>), FrameError> {
        let fields = self
            .decoder
            .decode(block)
            .map_err(|_| (ErrorCode::CompressionError, "failed to decode header block"))?;

        let mut req = RequestHeaders::default();
        let mut soft_error: Option<&'static str> = None;
        let mut seen_regular = false;

        for (name, value) in fields {
            if name.first() == Some(&b':') {
                if seen_regular {
                    return Err((
                        ErrorCode::ProtocolError,
                        "pseudo-header after regular header",
                    ));
                }
                let value = String::from_utf8_lossy(&value).into_owned();
                let (slot, bit): (&mut String, u8) = match &name[..] {
                    b":method" => {
                        if http::Method::from_bytes(value.as_bytes()).is_err() {
                            return Err((ErrorCode::ProtocolError, "invalid :method"));
                        }
                        (&mut req.method, exists::METHOD)
                    }
                    b":scheme" => (&mut req.scheme, exists::SCHEME),
                    b":authority" => (&mut req.authority, exists::AUTHORITY),
                    b":path" => (&mut req.path, exists::PATH),
                    _ => {
                        return Err((ErrorCode::ProtocolError, "unknown pseudo-header"));
                    }
                };
                if req.exists_map & bit != 0 {
                    return Err((ErrorCode::ProtocolError, "duplicate pseudo-header"));
                }
                req.exists_map |= bit;
                *slot = value;
                continue;
            }

            seen_regular = true;
            if !valid_header_name(&name) {
                soft_error.get_or_insert("invalid character in header name");
            }
            if !valid_header_value(&value) {
                soft_error.get_or_insert("invalid character in header value");
            }
            let name = String::from_utf8_lossy(&name).into_owned();
            let value = String::from_utf8_lossy(&value).into_owned();

            if is_connection_specific(&name) {
                return Err((ErrorCode::ProtocolError, "connection-specific header field"));
            }
            if name == "te" && value != "trailers" {
                return Err((ErrorCode::ProtocolError, "invalid TE header value"));
            }
            if name == "content-length" {
                let parsed: u64 = value
                    .parse()
                    .map_err(|_| (ErrorCode::ProtocolError, "invalid content-length"))?;
                if let Some(prev) = req.content_length {
                    if prev != parsed {
                        return Err((ErrorCode::ProtocolError, "conflicting content-length"));
                    }
                }
                req.content_length = Some(parsed);
            }
            req.headers.push((name, value));
        }

        Ok((req, soft_error))
    }

    /// Decode a trailing header block. Trailers must not carry
    /// pseudo-headers or invalid fields.
    pub fn decode_trailers(
        &mut self,
        block: &[u8],
    ) -> Result<Vec<(String, String)>, FrameError> {
        let fields = self
            .decoder
            .decode(block)
            .map_err(|_| (ErrorCode::CompressionError, "failed to decode header block"))?;
        let mut trailers = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            if name.first() == Some(&b':') {
                return Err((ErrorCode::ProtocolError, "pseudo-header in trailers"));
            }
            if !valid_header_name(&name) || !valid_header_value(&value) {
                return Err((ErrorCode::ProtocolError, "invalid character in trailer"));
            }
            trailers.push((
                String::from_utf8_lossy(&name).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            ));
        }
        Ok(trailers)
    }

    /// Encode response headers and stage HEADERS (+ CONTINUATION) frames.
    pub fn encode_response(
        &mut self,
        out: &mut BytesMut,
        stream_id: StreamId,
        status: u16,
        headers: &[(String, String)],
        end_stream: bool,
        max_frame_size: usize,
    ) {
        let status = http::StatusCode::from_u16(status)
            .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> =
            Vec::with_capacity(headers.len() + 1);
        fields.push((b":status".to_vec(), status.as_str().as_bytes().to_vec()));
        for (name, value) in headers {
            let name = name.to_lowercase();
            if name.starts_with(':') || is_connection_specific(&name) {
                continue;
            }
            fields.push((name.into_bytes(), value.clone().into_bytes()));
        }
        let block = self
            .encoder
            .encode(fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())));
        self.stage_headers(out, stream_id, Bytes::from(block), end_stream, max_frame_size);
    }

    /// Flatten trailers into a HEADERS frame carrying END_STREAM.
    pub fn flatten_trailers(
        &mut self,
        out: &mut BytesMut,
        stream_id: StreamId,
        trailers: &[(String, String)],
        max_frame_size: usize,
    ) {
        let fields: Vec<(Vec<u8>, Vec<u8>)> = trailers
            .iter()
            .map(|(n, v)| (n.to_lowercase().into_bytes(), v.clone().into_bytes()))
            .collect();
        let block = self
            .encoder
            .encode(fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())));
        self.stage_headers(out, stream_id, Bytes::from(block), true, max_frame_size);
    }

    /// Encode a synthesized request head into a PUSH_PROMISE
    /// (+ CONTINUATION) on `stream_id`, promising `promised_id`.
    pub fn encode_push_promise(
        &mut self,
        out: &mut BytesMut,
        stream_id: StreamId,
        promised_id: StreamId,
        req: &RequestHeaders,
        max_frame_size: usize,
    ) {
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(req.headers.len() + 4);
        fields.push((b":method".to_vec(), req.method.clone().into_bytes()));
        fields.push((b":scheme".to_vec(), req.scheme.clone().into_bytes()));
        fields.push((b":authority".to_vec(), req.authority.clone().into_bytes()));
        fields.push((b":path".to_vec(), req.path.clone().into_bytes()));
        for (name, value) in &req.headers {
            fields.push((name.clone().into_bytes(), value.clone().into_bytes()));
        }
        let block = Bytes::from(
            self.encoder
                .encode(fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice()))),
        );

        // PUSH_PROMISE payload carries a 4-byte promised-id prefix.
        let first_len = max_frame_size.saturating_sub(4).min(block.len());
        let first = block.slice(..first_len);
        if first_len == block.len() {
            PushPromiseFrame::new(stream_id, promised_id, first).serialize_into(out);
        } else {
            let mut frame = BytesMut::new();
            PushPromiseFrame::new(stream_id, promised_id, first).serialize_into(&mut frame);
            // Clear END_HEADERS on the first frame; the tail continues.
            frame[4] &= !crate::frame::flags::END_HEADERS;
            out.extend_from_slice(&frame);
            self.stage_continuations(out, stream_id, block.slice(first_len..), max_frame_size);
        }
    }

    fn stage_headers(
        &mut self,
        out: &mut BytesMut,
        stream_id: StreamId,
        block: Bytes,
        end_stream: bool,
        max_frame_size: usize,
    ) {
        if block.len() <= max_frame_size {
            let frame = HeadersFrame::new(stream_id, block)
                .end_stream(end_stream)
                .end_headers(true);
            out.extend_from_slice(&frame.serialize());
            return;
        }
        let frame = HeadersFrame::new(stream_id, block.slice(..max_frame_size))
            .end_stream(end_stream)
            .end_headers(false);
        out.extend_from_slice(&frame.serialize());
        self.stage_continuations(out, stream_id, block.slice(max_frame_size..), max_frame_size);
    }

    fn stage_continuations(
        &mut self,
        out: &mut BytesMut,
        stream_id: StreamId,
        rest: Bytes,
        max_frame_size: usize,
    ) {
        let mut offset = 0;
        while offset < rest.len() {
            let end = (offset + max_frame_size).min(rest.len());
            let last = end == rest.len();
            let frame = ContinuationFrame::new(stream_id, rest.slice(offset..end), last);
            out.extend_from_slice(&frame.serialize());
            offset = end;
        }
    }
}

impl Default for HeaderCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_request_block(fields: &[(&str, &str)]) -> Vec<u8> {
        let mut enc = hpack::Encoder::new();
        enc.encode(
            fields
                .iter()
                .map(|(n, v)| (n.as_bytes(), v.as_bytes())),
        )
    }

    #[test]
    fn decode_simple_get() {
        let block = encode_request_block(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "example.com"),
            (":path", "/"),
            ("user-agent", "test"),
        ]);
        let mut codec = HeaderCodec::new();
        let (req, soft) = codec.decode_request(&block).unwrap();
        assert!(soft.is_none());
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/");
        assert_eq!(
            req.exists_map,
            exists::METHOD | exists::SCHEME | exists::AUTHORITY | exists::PATH
        );
        assert_eq!(req.header("user-agent"), Some("test"));
    }

    #[test]
    fn content_length_is_parsed() {
        let block = encode_request_block(&[
            (":method", "POST"),
            (":scheme", "https"),
            (":authority", "h"),
            (":path", "/upload"),
            ("content-length", "42"),
        ]);
        let mut codec = HeaderCodec::new();
        let (req, _) = codec.decode_request(&block).unwrap();
        assert_eq!(req.content_length, Some(42));
    }

    #[test]
    fn pseudo_after_regular_is_fatal() {
        let block = encode_request_block(&[
            (":method", "GET"),
            ("accept", "*/*"),
            (":path", "/"),
        ]);
        let mut codec = HeaderCodec::new();
        let err = codec.decode_request(&block).unwrap_err();
        assert_eq!(err.0, ErrorCode::ProtocolError);
    }

    #[test]
    fn connection_header_is_fatal() {
        let block = encode_request_block(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "h"),
            (":path", "/"),
            ("connection", "keep-alive"),
        ]);
        let mut codec = HeaderCodec::new();
        assert!(codec.decode_request(&block).is_err());
    }

    #[test]
    fn invalid_value_character_is_recoverable() {
        let block = encode_request_block(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "h"),
            (":path", "/"),
            ("x-broken", "a\x01b"),
        ]);
        let mut codec = HeaderCodec::new();
        let (req, soft) = codec.decode_request(&block).unwrap();
        assert!(soft.is_some());
        assert_eq!(req.method, "GET");
    }

    #[test]
    fn trailers_reject_pseudo_headers() {
        let block = encode_request_block(&[(":status", "200")]);
        let mut codec = HeaderCodec::new();
        assert!(codec.decode_trailers(&block).is_err());
    }

    #[test]
    fn response_roundtrips_through_decoder() {
        let mut codec = HeaderCodec::new();
        let mut out = BytesMut::new();
        codec.encode_response(
            &mut out,
            1,
            200,
            &[("Content-Type".into(), "text/plain".into())],
            true,
            16_384,
        );

        let header = crate::frame::FrameHeader::parse(&out).unwrap();
        assert_eq!(header.frame_type, crate::frame::FrameType::Headers);
        let payload = &out[crate::frame::FRAME_HEADER_SIZE..];
        let mut peer = hpack::Decoder::new();
        let fields = peer.decode(payload).unwrap();
        assert_eq!(fields[0].0, b":status");
        assert_eq!(fields[0].1, b"200");
        assert_eq!(fields[1].0, b"content-type");
    }

    #[test]
    fn oversized_block_splits_into_continuation() {
        let mut codec = HeaderCodec::new();
        let mut out = BytesMut::new();
        let big = "x".repeat(300);
        codec.encode_response(&mut out, 1, 200, &[("x-big".into(), big)], false, 128);

        let first = crate::frame::FrameHeader::parse(&out).unwrap();
        assert_eq!(first.frame_type, crate::frame::FrameType::Headers);
        assert_eq!(first.flags & crate::frame::flags::END_HEADERS, 0);
        let second_off = crate::frame::FRAME_HEADER_SIZE + first.length as usize;
        let second = crate::frame::FrameHeader::parse(&out[second_off..]).unwrap();
        assert_eq!(second.frame_type, crate::frame::FrameType::Continuation);
    }
}
