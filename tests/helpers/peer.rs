//! A scripted HTTP/2 client sitting on the other side of a [`Connection`]:
//! it hand-encodes frames onto the server's read side and runs a mirror
//! parser over everything the server stages for writing.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use manifold::frame::{
    flags, ContinuationFrame, DataFrame, FrameHeader, FrameType, GoAwayFrame, HeadersFrame,
    PingFrame, PriorityData, PriorityFrame, RstStreamFrame, SettingsFrame, WindowUpdateFrame,
    CONNECTION_PREFACE, FRAME_HEADER_SIZE,
};
use manifold::{Config, Connection, Event, StreamId};

/// A decoded frame as observed on the wire by the peer.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl WireFrame {
    pub fn is(&self, ty: FrameType) -> bool {
        self.header.frame_type == ty
    }

    pub fn end_stream(&self) -> bool {
        self.header.flags & flags::END_STREAM != 0
    }
}

pub struct TestPeer {
    pub conn: Connection,
    pub now: Instant,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
}

impl TestPeer {
    pub fn new(config: Config) -> Self {
        Self::with_connection(Connection::new(config, Instant::now()))
    }

    pub fn with_connection(conn: Connection) -> Self {
        Self {
            conn,
            now: Instant::now(),
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
        }
    }

    /// Preface + empty SETTINGS, discarding the server's opening frames.
    pub fn handshake(config: Config) -> Self {
        let mut peer = Self::new(config);
        peer.send_preface();
        peer.feed(&SettingsFrame::new(Vec::new()).serialize());
        peer.flush();
        peer
    }

    pub fn send_preface(&mut self) {
        let preface = CONNECTION_PREFACE.to_vec();
        self.conn.feed(&preface, self.now);
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.conn.feed(bytes, self.now);
    }

    /// Advance the clock and fire due timers.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        self.conn.handle_timeout(self.now);
    }

    /// Drain the server's staged output, acknowledging each write, and
    /// decode it with the mirror parser.
    pub fn flush(&mut self) -> Vec<WireFrame> {
        let mut raw = BytesMut::new();
        while self.conn.wants_write() {
            let Some(bytes) = self.conn.begin_write(self.now) else {
                break;
            };
            raw.extend_from_slice(&bytes);
            self.conn.on_write_complete(true, self.now);
        }
        parse_frames(&raw)
    }

    pub fn events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.conn.poll_event() {
            events.push(event);
        }
        events
    }

    pub fn encode_headers(&mut self, fields: &[(&str, &str)]) -> Bytes {
        Bytes::from(
            self.encoder
                .encode(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes()))),
        )
    }

    /// Decode a server-side header block with the peer's decoder.
    pub fn decode_headers(&mut self, block: &[u8]) -> Vec<(String, String)> {
        self.decoder
            .decode(block)
            .expect("server header block decodes")
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8(n).unwrap(),
                    String::from_utf8(v).unwrap(),
                )
            })
            .collect()
    }

    pub fn send_headers(&mut self, sid: StreamId, fields: &[(&str, &str)], end_stream: bool) {
        let block = self.encode_headers(fields);
        let frame = HeadersFrame::new(sid, block).end_stream(end_stream);
        let bytes = frame.serialize();
        self.feed(&bytes);
    }

    pub fn send_headers_with_priority(
        &mut self,
        sid: StreamId,
        fields: &[(&str, &str)],
        end_stream: bool,
        priority: PriorityData,
    ) {
        let block = self.encode_headers(fields);
        let frame = HeadersFrame::new(sid, block)
            .end_stream(end_stream)
            .with_priority(priority);
        let bytes = frame.serialize();
        self.feed(&bytes);
    }

    pub fn send_get(&mut self, sid: StreamId, path: &str) {
        self.send_headers(
            sid,
            &[
                (":method", "GET"),
                (":scheme", "https"),
                (":authority", "example.com"),
                (":path", path),
            ],
            true,
        );
    }

    pub fn send_post(&mut self, sid: StreamId, path: &str, extra: &[(&str, &str)]) {
        let mut fields = vec![
            (":method", "POST"),
            (":scheme", "https"),
            (":authority", "example.com"),
            (":path", path),
        ];
        fields.extend_from_slice(extra);
        self.send_headers(sid, &fields, false);
    }

    pub fn send_data(&mut self, sid: StreamId, data: &[u8], end_stream: bool) {
        let frame = DataFrame::new(sid, Bytes::copy_from_slice(data)).end_stream(end_stream);
        let mut buf = BytesMut::new();
        frame.serialize_into(&mut buf);
        self.feed(&buf);
    }

    pub fn send_priority(&mut self, sid: StreamId, dependency: StreamId, weight: u16, exclusive: bool) {
        let bytes = PriorityFrame::new(
            sid,
            PriorityData {
                exclusive,
                dependency,
                weight,
            },
        )
        .serialize();
        self.feed(&bytes);
    }

    pub fn send_window_update(&mut self, sid: StreamId, increment: u32) {
        let bytes = WindowUpdateFrame::new(sid, increment).serialize();
        self.feed(&bytes);
    }

    pub fn send_rst_stream(&mut self, sid: StreamId, code: manifold::ErrorCode) {
        let bytes = RstStreamFrame::new(sid, code).serialize();
        self.feed(&bytes);
    }

    pub fn send_settings(&mut self, entries: Vec<(u16, u32)>) {
        let bytes = SettingsFrame::new(entries).serialize();
        self.feed(&bytes);
    }

    pub fn send_ping(&mut self, data: [u8; 8]) {
        let frame = PingFrame { ack: false, data };
        let bytes = frame.serialize();
        self.feed(&bytes);
    }

    pub fn send_continuation(&mut self, sid: StreamId, fragment: &[u8], end_headers: bool) {
        let bytes =
            ContinuationFrame::new(sid, Bytes::copy_from_slice(fragment), end_headers).serialize();
        self.feed(&bytes);
    }
}

pub fn parse_frames(mut buf: &[u8]) -> Vec<WireFrame> {
    let mut frames = Vec::new();
    while !buf.is_empty() {
        let header = FrameHeader::parse(buf).expect("complete frame header");
        let total = FRAME_HEADER_SIZE + header.length as usize;
        assert!(buf.len() >= total, "truncated frame in server output");
        frames.push(WireFrame {
            payload: Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..total]),
            header,
        });
        buf = &buf[total..];
    }
    frames
}

pub fn goaway(frames: &[WireFrame]) -> Option<GoAwayFrame> {
    frames
        .iter()
        .find(|f| f.is(FrameType::GoAway))
        .map(|f| GoAwayFrame::parse(&f.header, f.payload.clone()).expect("valid GOAWAY"))
}

pub fn rst_stream(frames: &[WireFrame]) -> Option<RstStreamFrame> {
    frames
        .iter()
        .find(|f| f.is(FrameType::RstStream))
        .map(|f| RstStreamFrame::parse(&f.header, f.payload.clone()).expect("valid RST_STREAM"))
}

pub fn data_payload(frames: &[WireFrame], sid: StreamId) -> Vec<u8> {
    let mut out = Vec::new();
    for f in frames {
        if f.is(FrameType::Data) && f.header.stream_id == sid {
            out.extend_from_slice(&f.payload);
        }
    }
    out
}
