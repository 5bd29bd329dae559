//! The HTTP/2 server connection core.
//!
//! [`Connection`] is a sans-I/O state machine driven entirely by its host:
//! bytes in via [`Connection::feed`], staged output out via
//! [`Connection::begin_write`] / [`Connection::on_write_complete`], timer
//! deadlines via [`Connection::next_timeout`] / [`Connection::handle_timeout`],
//! and application callbacks surfaced as [`Event`]s.
//!
//! One dispatch runs to completion and never blocks; every long-running
//! activity (socket readiness, timers, response production) belongs to the
//! host loop. All state is per-connection; nothing is shared.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::config::{host, Config};
use crate::error::{Error, Result};
use crate::flow::Window;
use crate::frame::{
    ContinuationFrame, DataFrame, ErrorCode, FrameError, FrameHeader, FrameType, GoAwayFrame,
    HeadersFrame, PingFrame, PriorityData, PriorityFrame, RstStreamFrame, SettingsFrame,
    WindowUpdateFrame, CONNECTION_PREFACE, FRAME_HEADER_SIZE,
};
use crate::hpack::{exists, HeaderCodec, RequestHeaders};
use crate::scheduler::{NodeId, Scheduler, CRITICAL_PUSH_WEIGHT};
use crate::settings::{PeerSettings, SETTINGS_MAX_CONCURRENT_STREAMS};
use crate::stream::{ReqBodyState, Stream, StreamCounts, StreamState};
use crate::StreamId;

/// Connection lifecycle. `HalfClosed` means a GOAWAY naming a definite
/// cutoff has been sent; `IsClosing` means no further frames will be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Open,
    HalfClosed,
    IsClosing,
}

/// Application-visible happenings, drained with [`Connection::poll_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A request is ready for dispatch. In streaming mode this fires as
    /// soon as the head (and first body chunk) is in; otherwise the body is
    /// complete and available via [`Connection::take_request_body`].
    Request(StreamId),
    /// A chunk of a streaming request body awaits consumption; read it via
    /// [`Connection::req_entity`] and acknowledge with
    /// [`Connection::proceed_request`].
    ReqBodyChunk {
        stream: StreamId,
        is_end_stream: bool,
    },
    /// Previously staged egress for this stream has been flushed; the
    /// application may produce more response bytes.
    ProceedSend(StreamId),
    /// A dispatched request was torn down before its response completed.
    Reset(StreamId),
}

/// What the frame pipeline expects next from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadExpect {
    Preface,
    Default,
    /// Mid header block: only CONTINUATION frames for this stream are legal.
    Continuation(StreamId),
}

enum ReadOutcome {
    Consumed(usize),
    Incomplete,
    ConnectionError(FrameError),
    /// Bad preface: close the socket without attempting to send anything.
    CloseImmediately,
}

#[derive(Debug, Clone, Copy)]
struct ClosedSlot {
    stream_id: StreamId,
    node: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownPhase {
    None,
    /// First GOAWAY went out; the precise one follows shortly.
    ResendGoaway,
    /// Second GOAWAY went out; force-close when the timer fires.
    CloseStraggler,
}

#[derive(Debug, Default)]
struct Timers {
    /// Doubles as the write timeout while a write is in flight.
    idle: Option<Instant>,
    graceful: Option<Instant>,
}

struct WriteState {
    buf: BytesMut,
    buf_in_flight: Option<Bytes>,
    /// A gathered write has been requested and not yet begun.
    scheduled: bool,
    /// Streams whose staged egress drained; they get a proceed callback
    /// after the next write completion.
    streams_to_proceed: VecDeque<StreamId>,
}

/// Bounded memo of paths already pushed on this connection.
struct PushMemo {
    seen: HashSet<u64>,
    order: VecDeque<u64>,
}

impl PushMemo {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns false when the key was already present.
    fn insert(&mut self, key: u64) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > host::PUSH_MEMO_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Snapshot of connection internals, in the spirit of the
/// `/.well-known/h2/state` debug resource.
#[derive(Debug, Clone)]
pub struct DebugState {
    pub state: ConnectionState,
    pub input_window: i64,
    pub output_window: i64,
    pub peer_settings: PeerSettings,
    pub pull_max_open: StreamId,
    pub pull_max_processed: StreamId,
    pub push_max_open: StreamId,
    pub streams: Vec<StreamDebug>,
    pub recently_closed: Vec<StreamId>,
}

#[derive(Debug, Clone)]
pub struct StreamDebug {
    pub id: StreamId,
    pub state: StreamState,
    pub recv_window: i64,
    pub send_window: i64,
    pub weight: u16,
    /// Stream id of the scheduler parent; 0 is the root.
    pub parent: StreamId,
    pub queued_bytes: usize,
    pub blocked_by_server: bool,
    pub dispatched: bool,
    /// For pushed streams, the pull stream the promise was sent on.
    pub push_parent: StreamId,
}

pub struct Connection {
    config: Config,
    state: ConnectionState,
    now: Instant,

    read_expect: ReadExpect,
    read_buf: BytesMut,
    reads_paused: bool,
    server_preface_sent: bool,

    peer_settings: PeerSettings,
    codec: HeaderCodec,

    streams: HashMap<StreamId, Stream>,
    counts: StreamCounts,
    pull_max_open: StreamId,
    pull_max_processed: StreamId,
    push_max_open: StreamId,

    pending_reqs: VecDeque<StreamId>,
    scheduler: Scheduler,
    recently_closed: Vec<Option<ClosedSlot>>,
    closed_next_slot: usize,

    /// Connection-level receive window.
    input_window: Window,
    /// Connection-level send window, grown by the peer's WINDOW_UPDATEs.
    output_window: Window,

    headers_unparsed: Option<BytesMut>,
    write: WriteState,
    events: VecDeque<Event>,

    is_chromium_dependency_tree: bool,
    received_any_request: bool,
    early_data: bool,
    early_data_blocked: VecDeque<StreamId>,
    push_memo: Option<PushMemo>,

    timers: Timers,
    shutdown_phase: ShutdownPhase,
    settings_sent_at: Option<Instant>,
    settings_acked_at: Option<Instant>,

    closed: bool,
}

impl Connection {
    pub fn new(config: Config, now: Instant) -> Self {
        Self {
            config,
            state: ConnectionState::Open,
            now,
            read_expect: ReadExpect::Preface,
            read_buf: BytesMut::with_capacity(16_384),
            reads_paused: false,
            server_preface_sent: false,
            peer_settings: PeerSettings::default(),
            codec: HeaderCodec::new(),
            streams: HashMap::new(),
            counts: StreamCounts::default(),
            pull_max_open: 0,
            pull_max_processed: 0,
            push_max_open: 0,
            pending_reqs: VecDeque::new(),
            scheduler: Scheduler::new(),
            recently_closed: vec![None; host::CLOSED_STREAM_PRIORITIES],
            closed_next_slot: 0,
            input_window: Window::new(host::CONNECTION_WINDOW_SIZE),
            output_window: Window::new(PeerSettings::default().initial_window_size),
            headers_unparsed: None,
            write: WriteState {
                buf: BytesMut::with_capacity(host::OUTBUF_SOFT_MAX_SIZE),
                buf_in_flight: None,
                scheduled: false,
                streams_to_proceed: VecDeque::new(),
            },
            events: VecDeque::new(),
            // Assume the client builds Chromium-shaped dependency trees
            // until an observation contradicts it.
            is_chromium_dependency_tree: true,
            received_any_request: false,
            early_data: false,
            early_data_blocked: VecDeque::new(),
            push_memo: None,
            timers: Timers::default(),
            shutdown_phase: ShutdownPhase::None,
            settings_sent_at: None,
            settings_acked_at: None,
            closed: false,
        }
    }

    /// Start a connection taken over from an HTTP/1.1 upgrade: stream 1 is
    /// already open and carries `req`; the server preface is staged for the
    /// 101 response and the client preface is still expected on the wire.
    pub fn upgraded(config: Config, req: RequestHeaders, now: Instant) -> Self {
        let mut conn = Self::new(config, now);
        conn.stage_server_preface();
        conn.open_stream(1, PriorityData::DEFAULT);
        conn.set_priority(1, PriorityData::DEFAULT, false);
        conn.set_state(1, StreamState::RecvHeaders);
        conn.pull_max_open = 1;
        conn.received_any_request = true;
        if let Some(stream) = conn.streams.get_mut(&1) {
            stream.content_length = req.content_length;
            stream.req = Some(req);
        }
        conn.execute_or_enqueue_request(1);
        conn
    }

    // ---- host-facing surface -------------------------------------------

    /// Feed bytes read from the socket.
    pub fn feed(&mut self, data: &[u8], now: Instant) {
        self.now = now;
        if self.closed {
            return;
        }
        self.read_buf.extend_from_slice(data);

        while self.state < ConnectionState::IsClosing && !self.read_buf.is_empty() {
            match self.parse_one() {
                ReadOutcome::Consumed(n) => {
                    self.read_buf.advance(n);
                }
                ReadOutcome::Incomplete => break,
                ReadOutcome::ConnectionError((code, reason)) => {
                    debug!(?code, reason, "connection error");
                    self.enqueue_goaway(code, reason);
                    self.close_connection();
                    break;
                }
                ReadOutcome::CloseImmediately => {
                    debug!("bad connection preface");
                    self.close_connection_now();
                    break;
                }
            }
        }
        if !self.closed {
            self.update_idle_timeout();
        }
    }

    /// The read side of the socket closed or failed.
    pub fn close(&mut self) {
        if !self.closed {
            self.close_connection();
        }
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Whether a gathered write should be started.
    pub fn wants_write(&self) -> bool {
        !self.closed
            && self.write.buf_in_flight.is_none()
            && (self.write.scheduled || !self.write.buf.is_empty())
    }

    /// Stage DATA frames through the scheduler, flip the output buffer and
    /// hand it to the host for a single socket write. Returns `None` when
    /// there is nothing to write (the call may still progress shutdown).
    pub fn begin_write(&mut self, now: Instant) -> Option<Bytes> {
        self.now = now;
        if self.closed || self.write.buf_in_flight.is_some() {
            return None;
        }
        self.write.scheduled = false;

        if self.state < ConnectionState::IsClosing {
            loop {
                if self.buffer_window() <= 0 {
                    break;
                }
                let Some(node) = self.scheduler.pick_active() else {
                    break;
                };
                let Some(sid) = self.scheduler.stream(node) else {
                    self.scheduler.deactivate(node);
                    continue;
                };
                if !self.streams.contains_key(&sid) {
                    self.scheduler.deactivate(node);
                    continue;
                }
                if !self.emit_stream(sid) {
                    self.scheduler.deactivate(node);
                }
            }
        }

        let out = if self.write.buf.is_empty() {
            None
        } else {
            let bytes = self.write.buf.split().freeze();
            self.write.buf_in_flight = Some(bytes.clone());
            // The idle slot carries the write timeout while a write is in
            // flight.
            self.timers.idle = Some(self.now + host::OUTBUF_WRITE_TIMEOUT);
            Some(bytes)
        };

        match self.state {
            ConnectionState::Open => {}
            ConnectionState::HalfClosed => {
                if self.counts.pull_open + self.counts.push_open == 0 {
                    self.state = ConnectionState::IsClosing;
                    self.close_connection();
                }
            }
            ConnectionState::IsClosing => {
                self.close_connection();
            }
        }

        out
    }

    /// The gathered write finished (successfully or not).
    pub fn on_write_complete(&mut self, ok: bool, now: Instant) {
        self.now = now;
        if self.closed {
            return;
        }
        debug_assert!(self.write.buf_in_flight.is_some());
        self.write.buf_in_flight = None;

        if !ok {
            self.close_connection_now();
            return;
        }

        if self.state < ConnectionState::IsClosing {
            while let Some(sid) = self.write.streams_to_proceed.pop_front() {
                if let Some(stream) = self.streams.get_mut(&sid) {
                    stream.proceed_queued = false;
                    debug_assert!(!stream.has_pending_data());
                    self.events.push_back(Event::ProceedSend(sid));
                }
            }
        }

        // Release the write-timeout use of the idle slot, then re-arm.
        self.timers.idle = None;
        self.update_idle_timeout();

        if self.state < ConnectionState::IsClosing
            && self.reads_paused
            && self.bytes_in_buf() < host::OUTBUF_SOFT_MAX_SIZE
        {
            self.reads_paused = false;
        }

        // Write more if anything accumulated during the flush; also lets
        // shutdown progress.
        self.write.scheduled = true;
    }

    pub fn reads_paused(&self) -> bool {
        self.reads_paused || self.closed
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        match (self.timers.idle, self.timers.graceful) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.now = now;
        if self.closed {
            return;
        }
        if self.timers.graceful.is_some_and(|t| t <= now) {
            self.timers.graceful = None;
            self.on_graceful_shutdown_timeout();
        }
        if self.closed {
            return;
        }
        if self.timers.idle.is_some_and(|t| t <= now) {
            self.timers.idle = None;
            self.on_idle_timeout();
        }
    }

    /// Begin a graceful shutdown: an advisory GOAWAY now, the precise one a
    /// second later, and (if configured) a forced close after that.
    pub fn initiate_graceful_shutdown(&mut self, now: Instant) {
        self.now = now;
        if self.shutdown_phase != ShutdownPhase::None || self.closed {
            return;
        }
        self.shutdown_phase = ShutdownPhase::ResendGoaway;

        // An advisory GOAWAY with the maximum stream id warns the client
        // that a shutdown is imminent without yet naming the cutoff.
        if self.state < ConnectionState::HalfClosed {
            let frame = GoAwayFrame::new(0x7fff_ffff, ErrorCode::NoError)
                .with_debug_data("graceful shutdown");
            self.write.buf.extend_from_slice(&frame.serialize());
            self.conn_request_write();
        }
        self.timers.graceful = Some(now + host::GOAWAY_RESEND_DELAY);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn received_any_request(&self) -> bool {
        self.received_any_request
    }

    /// Round-trip estimate from the SETTINGS/ACK exchange.
    pub fn settings_rtt(&self) -> Option<Duration> {
        match (self.settings_sent_at, self.settings_acked_at) {
            (Some(sent), Some(acked)) => Some(acked.duration_since(sent)),
            _ => None,
        }
    }

    /// Signal whether the transport is still within TLS early data. While
    /// set, the idle timer stays armed and replay-deferred streams park.
    pub fn set_early_data(&mut self, early: bool) {
        if self.early_data == early {
            return;
        }
        self.early_data = early;
        if !early {
            while let Some(sid) = self.early_data_blocked.pop_front() {
                let Some(stream) = self.streams.get_mut(&sid) else {
                    continue;
                };
                stream.replay_blocked = false;
                if !stream.blocked_by_server {
                    self.set_blocked_by_server(sid, true);
                }
                self.events.push_back(Event::Request(sid));
            }
        }
        if !self.closed {
            self.update_idle_timeout();
        }
    }

    /// Park a dispatched request until the TLS handshake completes, at
    /// which point it is dispatched again (the 425-and-replay policy is the
    /// application's business).
    pub fn defer_for_replay(&mut self, sid: StreamId) -> Result<()> {
        let stream = self
            .streams
            .get_mut(&sid)
            .ok_or(Error::UnknownStream(sid))?;
        if self.early_data {
            stream.replay_blocked = true;
            self.early_data_blocked.push_back(sid);
        } else {
            self.events.push_back(Event::Request(sid));
        }
        Ok(())
    }

    // ---- application-facing surface ------------------------------------

    pub fn request(&self, sid: StreamId) -> Option<&RequestHeaders> {
        self.streams.get(&sid).and_then(|s| s.req.as_ref())
    }

    /// Iterate the requests of all live, dispatched streams.
    pub fn requests(&self) -> impl Iterator<Item = (StreamId, &RequestHeaders)> {
        self.streams
            .values()
            .filter(|s| s.dispatched)
            .filter_map(|s| s.req.as_ref().map(|r| (s.id, r)))
    }

    /// Take the fully buffered request body of a non-streaming request.
    pub fn take_request_body(&mut self, sid: StreamId) -> Option<Bytes> {
        let stream = self.streams.get_mut(&sid)?;
        stream.req_body.buf.as_mut().map(|b| b.split().freeze())
    }

    /// The body chunk currently delivered to the application on a
    /// streaming request.
    pub fn req_entity(&self, sid: StreamId) -> Option<&[u8]> {
        let stream = self.streams.get(&sid)?;
        let len = stream.entity_len?;
        stream.req_body.buf.as_deref().map(|b| &b[..len])
    }

    /// Acknowledge the delivered body chunk. `ok = false` aborts the
    /// stream. On success the consumed bytes replenish the stream's
    /// receive window and, if more input is already buffered, the next
    /// chunk is delivered immediately.
    pub fn proceed_request(&mut self, sid: StreamId, ok: bool) {
        let Some(stream) = self.streams.get_mut(&sid) else {
            return;
        };
        debug_assert!(stream.req_body.streamed);
        let written = stream.entity_len.take().unwrap_or(0);
        if let Some(buf) = stream.req_body.buf.as_mut() {
            let n = written.min(buf.len());
            let _ = buf.split_to(n);
        }

        if !ok {
            // The receive side is finished before any reset frame goes
            // out; the application will not see another chunk.
            let node = stream.sched;
            stream.streaming = false;
            if stream.req_body.state < ReqBodyState::CloseDelivered {
                self.set_req_body_state(sid, ReqBodyState::CloseDelivered);
            }
            if self.state < ConnectionState::IsClosing {
                self.stream_send_error(sid, ErrorCode::StreamClosed);
                self.scheduler.deactivate(node);
                self.close_stream(sid);
            }
            return;
        }

        let body_state = self
            .streams
            .get(&sid)
            .map(|s| s.req_body.state)
            .unwrap_or(ReqBodyState::CloseDelivered);
        match body_state {
            ReqBodyState::Open => {
                if written > 0 {
                    self.update_stream_input_window(sid, written as u64);
                }
                let stream = self.streams.get_mut(&sid).expect("stream is live");
                let window_open = stream.input_window.window.available() > 0;
                if stream.blocked_by_server && window_open {
                    self.set_blocked_by_server(sid, false);
                    self.update_idle_timeout();
                }
                let has_more = self
                    .streams
                    .get(&sid)
                    .and_then(|s| s.req_body.buf.as_ref())
                    .is_some_and(|b| !b.is_empty());
                if has_more {
                    self.write_streaming_body(sid);
                }
            }
            ReqBodyState::CloseQueued => {
                self.write_streaming_body(sid);
            }
            // Final chunk acknowledged; the response side decides when the
            // stream closes.
            ReqBodyState::CloseDelivered => {}
            ReqBodyState::None | ReqBodyState::OpenBeforeFirstFrame => {
                debug_assert!(false, "proceed on a stream without a delivered chunk");
            }
        }
    }

    /// Stage response headers. With `end_stream` the response is complete
    /// (no DATA frames follow) and the stream closes.
    pub fn send_response(
        &mut self,
        sid: StreamId,
        status: u16,
        headers: &[(String, String)],
        end_stream: bool,
    ) -> Result<()> {
        if self.state == ConnectionState::IsClosing {
            return Err(Error::Closing);
        }
        let stream = self
            .streams
            .get_mut(&sid)
            .ok_or(Error::UnknownStream(sid))?;
        if !stream.dispatched || stream.response_started {
            return Err(Error::InvalidStreamState {
                stream: sid,
                state: stream.state,
            });
        }
        self.start_response(sid, status, headers, end_stream);
        Ok(())
    }

    /// Queue response body bytes; `end_stream` marks the final chunk.
    pub fn send_body(&mut self, sid: StreamId, data: Bytes, end_stream: bool) -> Result<()> {
        if self.state == ConnectionState::IsClosing {
            return Err(Error::Closing);
        }
        let stream = self
            .streams
            .get_mut(&sid)
            .ok_or(Error::UnknownStream(sid))?;
        if !stream.response_started || stream.state >= StreamState::SendBodyIsFinal {
            return Err(Error::InvalidStreamState {
                stream: sid,
                state: stream.state,
            });
        }
        self.queue_body(sid, data, end_stream);
        Ok(())
    }

    /// Attach trailers, flattened after the final DATA frame. Must be set
    /// no later than the final [`Connection::send_body`].
    pub fn send_trailers(&mut self, sid: StreamId, trailers: Vec<(String, String)>) -> Result<()> {
        let stream = self
            .streams
            .get_mut(&sid)
            .ok_or(Error::UnknownStream(sid))?;
        if !stream.response_started || stream.state >= StreamState::SendBodyIsFinal {
            return Err(Error::InvalidStreamState {
                stream: sid,
                state: stream.state,
            });
        }
        stream.trailers = Some(trailers);
        Ok(())
    }

    /// Open a server-initiated stream for `abspath` on behalf of the
    /// request running on `src`. A no-op whenever pushing is not possible
    /// or not worthwhile (push disabled, limits reached, shutting down,
    /// already pushed on this connection, proxied request).
    pub fn push_path(&mut self, src: StreamId, abspath: &str, is_critical: bool) {
        if Stream::is_push(src) {
            return;
        }
        if !self.config.push_enabled || !self.peer_settings.enable_push {
            return;
        }
        if self.counts.push_open >= self.peer_settings.max_concurrent_streams as usize {
            return;
        }
        if self.state >= ConnectionState::IsClosing {
            return;
        }
        if self.push_max_open >= 0x7fff_fff0 {
            return;
        }
        if !(self.pending_reqs.is_empty() && self.can_run_requests()) {
            return;
        }
        let Some(src_stream) = self.streams.get(&src) else {
            return;
        };
        let Some(src_req) = src_stream.req.as_ref() else {
            return;
        };
        if src_req.header("x-forwarded-for").is_some() {
            return;
        }

        let mut req = RequestHeaders {
            method: "GET".to_owned(),
            scheme: src_req.scheme.clone(),
            authority: src_req.authority.clone(),
            path: abspath.to_owned(),
            headers: Vec::new(),
            content_length: None,
            exists_map: exists::METHOD | exists::SCHEME | exists::AUTHORITY | exists::PATH,
        };
        // Carry over the headers that could change a cacheable response.
        for name in ["accept", "accept-encoding", "accept-language", "user-agent"] {
            if let Some(value) = src_req.header(name) {
                req.headers.push((name.to_owned(), value.to_owned()));
            }
        }

        let memo_key = {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            req.scheme.hash(&mut hasher);
            req.authority.hash(&mut hasher);
            req.path.hash(&mut hasher);
            hasher.finish()
        };
        if !self
            .push_memo
            .get_or_insert_with(PushMemo::new)
            .insert(memo_key)
        {
            return;
        }

        let sid = self.push_max_open + 2;
        self.push_max_open = sid;
        let src_node = self.streams.get(&src).expect("checked above").sched;
        self.open_stream(sid, PriorityData::DEFAULT);
        let node = if is_critical {
            self.scheduler
                .open(self.scheduler.root(), Some(sid), CRITICAL_PUSH_WEIGHT, false)
        } else {
            self.scheduler.open(src_node, Some(sid), 16, false)
        };
        {
            let stream = self.streams.get_mut(&sid).expect("just opened");
            stream.sched = node;
            stream.received_priority.dependency = src;
            stream.push.parent_stream_id = src;
            stream.req = Some(req);
        }
        self.set_state(sid, StreamState::RecvHeaders);
        self.execute_or_enqueue_request(sid);

        // Promise as early as possible, before the parent can close.
        let stream_alive = self
            .streams
            .get(&sid)
            .is_some_and(|s| s.state != StreamState::EndStream && !s.push.promise_sent);
        if stream_alive {
            let req = self
                .streams
                .get(&sid)
                .and_then(|s| s.req.clone())
                .expect("push stream has a request");
            self.codec.encode_push_promise(
                &mut self.write.buf,
                src,
                sid,
                &req,
                self.peer_settings.max_frame_size as usize,
            );
            if let Some(stream) = self.streams.get_mut(&sid) {
                stream.push.promise_sent = true;
            }
            self.conn_request_write();
        }
    }

    pub fn received_priority(&self, sid: StreamId) -> Option<PriorityData> {
        self.streams.get(&sid).map(|s| s.received_priority)
    }

    /// The stream's effective scheduler position: parent stream id (0 for
    /// the root) and weight.
    pub fn actual_priority(&self, sid: StreamId) -> Option<(StreamId, u16)> {
        let stream = self.streams.get(&sid)?;
        let parent = self
            .scheduler
            .parent(stream.sched)
            .and_then(|p| self.scheduler.stream(p))
            .unwrap_or(0);
        Some((parent, self.scheduler.weight(stream.sched)))
    }

    pub fn debug_state(&self) -> DebugState {
        let mut streams: Vec<StreamDebug> = self
            .streams
            .values()
            .map(|s| StreamDebug {
                id: s.id,
                state: s.state,
                recv_window: s.input_window.window.available(),
                send_window: s.output_window.available(),
                weight: self.scheduler.weight(s.sched),
                parent: self
                    .scheduler
                    .parent(s.sched)
                    .and_then(|p| self.scheduler.stream(p))
                    .unwrap_or(0),
                queued_bytes: s.queued_bytes(),
                blocked_by_server: s.blocked_by_server,
                dispatched: s.dispatched,
                push_parent: s.push.parent_stream_id,
            })
            .collect();
        streams.sort_by_key(|s| s.id);
        DebugState {
            state: self.state,
            input_window: self.input_window.available(),
            output_window: self.output_window.available(),
            peer_settings: self.peer_settings,
            pull_max_open: self.pull_max_open,
            pull_max_processed: self.pull_max_processed,
            push_max_open: self.push_max_open,
            streams,
            recently_closed: self
                .recently_closed
                .iter()
                .flatten()
                .map(|slot| slot.stream_id)
                .collect(),
        }
    }

    // ---- frame pipeline ------------------------------------------------

    fn parse_one(&mut self) -> ReadOutcome {
        match self.read_expect {
            ReadExpect::Preface => self.expect_preface(),
            ReadExpect::Default | ReadExpect::Continuation(_) => {
                if self.read_buf.len() < FRAME_HEADER_SIZE {
                    return ReadOutcome::Incomplete;
                }
                let header = FrameHeader::parse(&self.read_buf).expect("length checked");
                if header.length > host::MAX_FRAME_SIZE {
                    return ReadOutcome::ConnectionError((
                        ErrorCode::FrameSizeError,
                        "frame length exceeds maximum",
                    ));
                }
                let total = FRAME_HEADER_SIZE + header.length as usize;
                if self.read_buf.len() < total {
                    return ReadOutcome::Incomplete;
                }
                let payload = Bytes::copy_from_slice(&self.read_buf[FRAME_HEADER_SIZE..total]);
                let result = match self.read_expect {
                    ReadExpect::Continuation(sid) => self.handle_continuation(sid, &header, payload),
                    _ => self.dispatch_frame(&header, payload),
                };
                match result {
                    Ok(()) => ReadOutcome::Consumed(total),
                    Err(e) => ReadOutcome::ConnectionError(e),
                }
            }
        }
    }

    fn expect_preface(&mut self) -> ReadOutcome {
        if self.read_buf.len() < CONNECTION_PREFACE.len() {
            return ReadOutcome::Incomplete;
        }
        if &self.read_buf[..CONNECTION_PREFACE.len()] != CONNECTION_PREFACE {
            return ReadOutcome::CloseImmediately;
        }
        if !self.server_preface_sent {
            self.stage_server_preface();
        }
        self.read_expect = ReadExpect::Default;
        ReadOutcome::Consumed(CONNECTION_PREFACE.len())
    }

    fn stage_server_preface(&mut self) {
        let settings = SettingsFrame::new(vec![(
            SETTINGS_MAX_CONCURRENT_STREAMS,
            host::MAX_CONCURRENT_STREAMS,
        )]);
        self.write.buf.extend_from_slice(&settings.serialize());
        let update = WindowUpdateFrame::new(
            0,
            host::CONNECTION_WINDOW_SIZE - host::STREAM_INITIAL_WINDOW_SIZE,
        );
        self.write.buf.extend_from_slice(&update.serialize());
        self.server_preface_sent = true;
        if self.settings_sent_at.is_none() {
            self.settings_sent_at = Some(self.now);
        }
        self.conn_request_write();
    }

    fn dispatch_frame(&mut self, header: &FrameHeader, payload: Bytes) -> std::result::Result<(), FrameError> {
        match header.frame_type {
            FrameType::Data => self.handle_data_frame(header, payload),
            FrameType::Headers => self.handle_headers_frame(header, payload),
            FrameType::Priority => self.handle_priority_frame(header, payload),
            FrameType::RstStream => self.handle_rst_stream_frame(header, payload),
            FrameType::Settings => self.handle_settings_frame(header, payload),
            FrameType::PushPromise => {
                Err((ErrorCode::ProtocolError, "received PUSH_PROMISE frame"))
            }
            FrameType::Ping => self.handle_ping_frame(header, payload),
            FrameType::GoAway => self.handle_goaway_frame(header, payload),
            FrameType::WindowUpdate => self.handle_window_update_frame(header, payload),
            FrameType::Continuation => Err((
                ErrorCode::ProtocolError,
                "received invalid CONTINUATION frame",
            )),
            FrameType::Unknown(t) => {
                debug!(frame_type = t, "ignoring unknown frame type");
                Ok(())
            }
        }
    }

    fn handle_continuation(
        &mut self,
        expected_sid: StreamId,
        header: &FrameHeader,
        payload: Bytes,
    ) -> std::result::Result<(), FrameError> {
        if header.frame_type != FrameType::Continuation {
            return Err((ErrorCode::ProtocolError, "expected CONTINUATION frame"));
        }
        if header.stream_id != expected_sid {
            return Err((
                ErrorCode::ProtocolError,
                "unexpected stream id in CONTINUATION frame",
            ));
        }
        let stream_state = self.streams.get(&expected_sid).map(|s| s.state);
        if !matches!(
            stream_state,
            Some(StreamState::RecvHeaders) | Some(StreamState::RecvBody)
        ) {
            return Err((
                ErrorCode::ProtocolError,
                "unexpected stream id in CONTINUATION frame",
            ));
        }
        let frame = ContinuationFrame::parse(header, payload)?;

        let accumulated = self.headers_unparsed.as_ref().map_or(0, |b| b.len());
        if accumulated + frame.header_fragment.len() > self.config.max_request_header_size {
            // Oversized header block: refuse the stream, keep the
            // connection.
            self.stream_send_error(expected_sid, ErrorCode::RefusedStream);
            self.close_stream(expected_sid);
            return Ok(());
        }
        self.headers_unparsed
            .get_or_insert_with(BytesMut::new)
            .extend_from_slice(&frame.header_fragment);

        if frame.end_headers {
            self.read_expect = ReadExpect::Default;
            let block = self
                .headers_unparsed
                .take()
                .map(BytesMut::freeze)
                .unwrap_or_default();
            if stream_state == Some(StreamState::RecvHeaders) {
                self.handle_incoming_request(expected_sid, &block)?;
            } else {
                self.handle_trailing_headers(expected_sid, &block)?;
            }
        }
        Ok(())
    }

    // ---- frame handlers ------------------------------------------------

    fn handle_data_frame(
        &mut self,
        header: &FrameHeader,
        payload: Bytes,
    ) -> std::result::Result<(), FrameError> {
        let frame = DataFrame::parse(header, payload)?;
        let sid = frame.stream_id;
        let wire_len = header.length as usize;

        // Connection-level accounting covers the whole frame, padding
        // included, and is replenished at the half-way mark.
        self.input_window.consume(wire_len);
        let avail = self.input_window.available();
        if avail <= i64::from(host::CONNECTION_WINDOW_SIZE) / 2 {
            let delta = i64::from(host::CONNECTION_WINDOW_SIZE) - avail;
            self.send_window_update_conn(delta as u32);
        }

        let body_open = match self.streams.get(&sid) {
            None => {
                return if sid <= self.pull_max_open {
                    self.stream_send_error(sid, ErrorCode::StreamClosed);
                    Ok(())
                } else {
                    Err((ErrorCode::ProtocolError, "invalid DATA frame"))
                };
            }
            Some(stream) => stream.body_is_open(),
        };
        if !body_open {
            self.stream_send_error(sid, ErrorCode::StreamClosed);
            self.close_stream(sid);
            return Ok(());
        }

        {
            let stream = self.streams.get_mut(&sid).expect("checked above");
            stream.input_window.window.consume(wire_len);
        }
        // Padding never reaches the application; hand its window share
        // straight back.
        if wire_len != frame.data.len() {
            self.update_stream_input_window(sid, (wire_len - frame.data.len()) as u64);
        }

        if !frame.data.is_empty() || frame.end_stream {
            self.handle_request_body_chunk(sid, frame.data, frame.end_stream);
        }
        Ok(())
    }

    fn handle_headers_frame(
        &mut self,
        header: &FrameHeader,
        payload: Bytes,
    ) -> std::result::Result<(), FrameError> {
        let frame = HeadersFrame::parse(header, payload)?;
        let sid = frame.stream_id;
        if Stream::is_push(sid) {
            return Err((ErrorCode::ProtocolError, "invalid stream id in HEADERS frame"));
        }

        if sid <= self.pull_max_open {
            // Trailing headers for a stream that is receiving its body.
            let Some(stream) = self.streams.get(&sid) else {
                return Err((ErrorCode::StreamClosed, "closed stream id in HEADERS frame"));
            };
            if !stream.body_is_open() {
                return Err((ErrorCode::ProtocolError, "invalid stream id in HEADERS frame"));
            }
            if stream.is_tunnel {
                return Err((
                    ErrorCode::ProtocolError,
                    "trailer cannot be used in a CONNECT request",
                ));
            }
            if !frame.end_stream {
                return Err((
                    ErrorCode::ProtocolError,
                    "trailing HEADERS frame MUST have END_STREAM flag set",
                ));
            }
            if !frame.end_headers {
                self.begin_continuation(sid, &frame.header_block);
                return Ok(());
            }
            return self.handle_trailing_headers(sid, &frame.header_block);
        }

        if let Some(stream) = self.streams.get_mut(&sid) {
            // A stream previously opened by a PRIORITY frame.
            if let Some(prio) = frame.priority {
                stream.received_priority = prio;
                self.set_priority(sid, prio, true);
            }
        } else {
            self.received_any_request = true;
            let prio = frame.priority.unwrap_or(PriorityData::DEFAULT);
            self.open_stream(sid, prio);
            self.set_priority(sid, prio, false);
        }

        // Opening by HEADERS is what advances the pull cutoff; once a
        // GOAWAY went out the cutoff is frozen and later streams are
        // discarded at dispatch.
        self.set_state(sid, StreamState::RecvHeaders);
        if self.state == ConnectionState::Open && sid > self.pull_max_open {
            self.pull_max_open = sid;
        }

        if !frame.end_stream {
            if let Some(stream) = self.streams.get_mut(&sid) {
                stream.req_body.buf = Some(BytesMut::new());
            }
        }

        if frame.end_headers {
            self.handle_incoming_request(sid, &frame.header_block)
        } else {
            self.begin_continuation(sid, &frame.header_block);
            Ok(())
        }
    }

    fn begin_continuation(&mut self, sid: StreamId, first_fragment: &[u8]) {
        let mut buf = BytesMut::with_capacity(first_fragment.len());
        buf.extend_from_slice(first_fragment);
        self.headers_unparsed = Some(buf);
        self.read_expect = ReadExpect::Continuation(sid);
    }

    fn handle_priority_frame(
        &mut self,
        header: &FrameHeader,
        payload: Bytes,
    ) -> std::result::Result<(), FrameError> {
        let frame = PriorityFrame::parse(header, payload)?;
        let sid = frame.stream_id;

        if let Some(stream) = self.streams.get_mut(&sid) {
            stream.received_priority = frame.priority;
            // Critical pushes sit above any client-assignable weight and
            // stay where the server put them.
            if self.scheduler.weight(stream.sched) != CRITICAL_PUSH_WEIGHT {
                self.set_priority(sid, frame.priority, true);
            }
            return Ok(());
        }

        if Stream::is_push(sid) {
            // Closed or idle pushed streams: nothing to reprioritize.
            return Ok(());
        }
        if sid <= self.pull_max_open {
            // Recently closed pull stream; its slot (if any) still anchors
            // dependents, but the stream itself is gone.
            return Ok(());
        }
        if self.counts.priority_open >= self.config.max_streams_for_priority {
            return Err((
                ErrorCode::EnhanceYourCalm,
                "too many streams in idle/closed state",
            ));
        }
        // Track an idle stream solely for its position in the tree.
        self.open_stream(sid, frame.priority);
        self.set_priority(sid, frame.priority, false);
        Ok(())
    }

    fn handle_rst_stream_frame(
        &mut self,
        header: &FrameHeader,
        payload: Bytes,
    ) -> std::result::Result<(), FrameError> {
        let frame = RstStreamFrame::parse(header, payload)?;
        if self.is_idle_stream_id(frame.stream_id) {
            return Err((
                ErrorCode::ProtocolError,
                "unexpected stream id in RST_STREAM frame",
            ));
        }
        if self.streams.contains_key(&frame.stream_id) {
            debug!(stream = frame.stream_id, code = ?frame.error_code, "stream reset by peer");
            self.close_stream(frame.stream_id);
        }
        Ok(())
    }

    fn handle_settings_frame(
        &mut self,
        header: &FrameHeader,
        payload: Bytes,
    ) -> std::result::Result<(), FrameError> {
        let frame = SettingsFrame::parse(header, payload)?;
        if frame.ack {
            if self.settings_acked_at.is_none() && self.settings_sent_at.is_some() {
                self.settings_acked_at = Some(self.now);
            }
            return Ok(());
        }

        let prev_initial_window = self.peer_settings.initial_window_size;
        self.peer_settings.apply(&frame.settings)?;
        self.write
            .buf
            .extend_from_slice(&SettingsFrame::ack().serialize());
        self.conn_request_write();

        if prev_initial_window != self.peer_settings.initial_window_size {
            // The delta applies to every live stream's send window, not to
            // the connection window (RFC 7540 §6.9.2).
            let delta = i64::from(self.peer_settings.initial_window_size)
                - i64::from(prev_initial_window);
            let ids: Vec<StreamId> = self.streams.keys().copied().collect();
            for sid in ids {
                let _ = self.update_stream_output_window(sid, delta);
            }
            self.resume_send();
        }
        Ok(())
    }

    fn handle_ping_frame(
        &mut self,
        header: &FrameHeader,
        payload: Bytes,
    ) -> std::result::Result<(), FrameError> {
        let frame = PingFrame::parse(header, &payload)?;
        if !frame.ack {
            self.write
                .buf
                .extend_from_slice(&PingFrame::ack(frame.data).serialize());
            self.conn_request_write();
        }
        Ok(())
    }

    fn handle_goaway_frame(
        &mut self,
        header: &FrameHeader,
        payload: Bytes,
    ) -> std::result::Result<(), FrameError> {
        let frame = GoAwayFrame::parse(header, payload)?;
        debug!(last_stream = frame.last_stream_id, code = ?frame.error_code, "GOAWAY received");
        // No new push streams from here on.
        self.push_max_open = 0x7fff_fffe;
        Ok(())
    }

    fn handle_window_update_frame(
        &mut self,
        header: &FrameHeader,
        payload: Bytes,
    ) -> std::result::Result<(), FrameError> {
        let frame = WindowUpdateFrame::parse(header, payload)?;
        let sid = frame.stream_id;

        if frame.increment == 0 {
            if sid == 0 {
                return Err((ErrorCode::ProtocolError, "invalid WINDOW_UPDATE frame"));
            }
            // Stream-scoped malformed update: reset the stream, keep the
            // connection.
            if self.streams.contains_key(&sid) {
                self.close_stream(sid);
            }
            self.stream_send_error(sid, ErrorCode::ProtocolError);
            return Ok(());
        }

        if sid == 0 {
            if self.output_window.widen(i64::from(frame.increment)).is_err() {
                return Err((ErrorCode::FlowControlError, "flow control window overflow"));
            }
        } else if !self.is_idle_stream_id(sid) {
            if self.streams.contains_key(&sid)
                && self
                    .update_stream_output_window(sid, i64::from(frame.increment))
                    .is_err()
            {
                self.close_stream(sid);
                self.stream_send_error(sid, ErrorCode::FlowControlError);
                return Ok(());
            }
        } else {
            return Err((
                ErrorCode::ProtocolError,
                "invalid stream id in WINDOW_UPDATE frame",
            ));
        }

        self.resume_send();
        Ok(())
    }

    // ---- request ingress -----------------------------------------------

    fn handle_incoming_request(
        &mut self,
        sid: StreamId,
        block: &[u8],
    ) -> std::result::Result<(), FrameError> {
        debug_assert_eq!(
            self.streams.get(&sid).map(|s| s.state),
            Some(StreamState::RecvHeaders)
        );
        let (mut req, soft_error) = self.codec.decode_request(block)?;
        if req.scheme.is_empty() {
            req.scheme = "https".to_owned();
        }

        let is_connect = req.is_connect();
        let mut expected = exists::METHOD | exists::AUTHORITY;
        if !is_connect {
            expected |= exists::SCHEME | exists::PATH;
        }
        if req.exists_map & expected != expected {
            self.stream_send_error(sid, ErrorCode::ProtocolError);
            self.close_stream(sid);
            return Ok(());
        }

        if self.counts.pull_open > host::MAX_CONCURRENT_STREAMS as usize {
            self.stream_send_error(sid, ErrorCode::RefusedStream);
            self.close_stream(sid);
            return Ok(());
        }

        if let Some(desc) = soft_error {
            // Bad field characters make the request answerable, not the
            // connection broken.
            self.send_invalid_request_error(sid, desc);
            return Ok(());
        }

        {
            let stream = self.streams.get_mut(&sid).expect("stream is live");
            stream.content_length = req.content_length;
            stream.req = Some(req);
        }

        if is_connect {
            let stream = self.streams.get(&sid).expect("stream is live");
            if stream.content_length.is_some() || stream.req_body.buf.is_none() {
                self.send_invalid_request_error(sid, "invalid CONNECT request");
                return Ok(());
            }
            {
                let stream = self.streams.get_mut(&sid).expect("stream is live");
                stream.is_tunnel = true;
                stream.streaming = true;
            }
            self.set_state(sid, StreamState::RecvBody);
            self.set_req_body_state(sid, ReqBodyState::Open);
            self.process_request(sid);
            return Ok(());
        }

        let expects_body = self
            .streams
            .get(&sid)
            .is_some_and(|s| s.req_body.buf.is_some());
        if expects_body {
            self.set_state(sid, StreamState::RecvBody);
            self.set_req_body_state(sid, ReqBodyState::OpenBeforeFirstFrame);
        } else {
            self.execute_or_enqueue_request(sid);
        }
        Ok(())
    }

    fn handle_trailing_headers(
        &mut self,
        sid: StreamId,
        block: &[u8],
    ) -> std::result::Result<(), FrameError> {
        let trailers = self.codec.decode_trailers(block)?;
        if let Some(stream) = self.streams.get_mut(&sid) {
            if let Some(req) = stream.req.as_mut() {
                req.headers.extend(trailers);
            }
        }
        self.handle_request_body_chunk(sid, Bytes::new(), true);
        Ok(())
    }

    fn handle_request_body_chunk(&mut self, sid: StreamId, payload: Bytes, is_end_stream: bool) {
        let is_first = {
            let Some(stream) = self.streams.get(&sid) else {
                return;
            };
            match stream.req_body.state {
                ReqBodyState::OpenBeforeFirstFrame => true,
                ReqBodyState::Open => false,
                _ => {
                    debug_assert!(false, "DATA on a stream whose body is not open");
                    return;
                }
            }
        };
        if is_first {
            self.set_req_body_state(sid, ReqBodyState::Open);
        }

        {
            let stream = self.streams.get_mut(&sid).expect("stream is live");
            stream.body_bytes_received += payload.len() as u64;
            if stream.body_bytes_received > self.config.max_request_entity_size {
                self.stream_send_error(sid, ErrorCode::RefusedStream);
                self.close_stream(sid);
                return;
            }
        }

        let length_violation = {
            let stream = self.streams.get(&sid).expect("stream is live");
            match stream.content_length {
                Some(cl) if is_end_stream => stream.body_bytes_received != cl,
                Some(cl) => stream.body_bytes_received > cl,
                None => false,
            }
        };
        if length_violation {
            self.stream_send_error(sid, ErrorCode::ProtocolError);
            self.close_stream(sid);
            return;
        }

        if !self
            .streams
            .get(&sid)
            .is_some_and(|s| s.blocked_by_server)
        {
            self.set_blocked_by_server(sid, true);
        }

        if self.reset_stream_if_disregarded(sid) {
            return;
        }

        let req_queued = self.streams.get(&sid).is_some_and(|s| s.streaming);
        if is_end_stream {
            let dispatched = self.streams.get(&sid).is_some_and(|s| s.dispatched);
            if self
                .streams
                .get(&sid)
                .is_some_and(|s| s.state < StreamState::ReqPending)
            {
                self.set_state(sid, StreamState::ReqPending);
                if dispatched {
                    self.set_state(sid, StreamState::SendHeaders);
                }
            }
            let accepting = self
                .streams
                .get(&sid)
                .is_some_and(|s| s.req_body.streamed);
            if accepting {
                self.set_req_body_state(sid, ReqBodyState::CloseQueued);
            } else {
                if let Some(stream) = self.streams.get_mut(&sid) {
                    stream.streaming = false;
                }
                self.set_req_body_state(sid, ReqBodyState::CloseDelivered);
            }
        }

        {
            let stream = self.streams.get_mut(&sid).expect("stream is live");
            if let Some(buf) = stream.req_body.buf.as_mut() {
                buf.extend_from_slice(&payload);
            }
        }

        // Streaming mode: hand the chunk over (unless one is already out).
        let streamed = self.streams.get(&sid).is_some_and(|s| s.req_body.streamed);
        if streamed {
            let idle = self
                .streams
                .get(&sid)
                .is_some_and(|s| s.entity_len.is_none());
            if idle {
                self.write_streaming_body(sid);
            }
            return;
        }

        if is_first && !is_end_stream {
            let may_stream = {
                let stream = self.streams.get(&sid).expect("stream is live");
                stream
                    .req
                    .as_ref()
                    .is_some_and(|req| self.config.may_stream(req))
            };
            if may_stream {
                if let Some(stream) = self.streams.get_mut(&sid) {
                    stream.streaming = true;
                }
                self.execute_or_enqueue_request_core(sid);
                return;
            }
            // Buffered upload: widen the receive window for the duration.
            let delta =
                u64::from(self.config.active_stream_window_size.saturating_sub(
                    host::STREAM_INITIAL_WINDOW_SIZE,
                ));
            if delta > 0 {
                self.update_stream_input_window(sid, delta);
            }
        }

        if is_end_stream && !req_queued {
            self.execute_or_enqueue_request(sid);
        }
    }

    fn write_streaming_body(&mut self, sid: StreamId) {
        let is_end_stream = {
            let Some(stream) = self.streams.get(&sid) else {
                return;
            };
            match stream.req_body.state {
                ReqBodyState::OpenBeforeFirstFrame | ReqBodyState::Open => {
                    debug_assert!(stream
                        .req_body
                        .buf
                        .as_ref()
                        .is_some_and(|b| !b.is_empty()));
                    false
                }
                ReqBodyState::CloseQueued => true,
                _ => {
                    debug_assert!(false, "streaming delivery in unexpected body state");
                    return;
                }
            }
        };
        if is_end_stream {
            {
                let stream = self.streams.get_mut(&sid).expect("stream is live");
                stream.streaming = false;
            }
            self.set_req_body_state(sid, ReqBodyState::CloseDelivered);
        }
        let stream = self.streams.get_mut(&sid).expect("stream is live");
        stream.entity_len = Some(stream.req_body.buf.as_ref().map_or(0, |b| b.len()));
        self.events.push_back(Event::ReqBodyChunk {
            stream: sid,
            is_end_stream,
        });
    }

    fn send_invalid_request_error(&mut self, sid: StreamId, desc: &'static str) {
        debug!(stream = sid, desc, "answering invalid request with 400");
        // Fast-forward so the response machinery applies.
        self.set_state(sid, StreamState::ReqPending);
        self.set_state(sid, StreamState::SendHeaders);
        self.start_response(
            sid,
            400,
            &[(
                "content-type".to_owned(),
                "text/plain; charset=utf-8".to_owned(),
            )],
            false,
        );
        self.queue_body(sid, Bytes::from(format!("invalid request: {desc}")), true);
    }

    // ---- dispatch ------------------------------------------------------

    fn can_run_requests(&self) -> bool {
        self.counts.pull_half_closed + self.counts.push_half_closed
            < self.config.max_concurrent_requests_per_connection
    }

    fn process_request(&mut self, sid: StreamId) {
        let streaming = self.streams.get(&sid).is_some_and(|s| s.streaming);
        if streaming {
            self.counts.streaming_in_progress += 1;
            let is_tunnel = {
                let stream = self.streams.get_mut(&sid).expect("stream is live");
                debug_assert!(!matches!(
                    stream.req_body.state,
                    ReqBodyState::None | ReqBodyState::CloseDelivered
                ));
                stream.req_body.streamed = true;
                stream.is_tunnel
            };
            if is_tunnel {
                self.counts.tunnels += 1;
            }
            let delta = u64::from(
                self.config
                    .active_stream_window_size
                    .saturating_sub(host::STREAM_INITIAL_WINDOW_SIZE),
            );
            if delta > 0 {
                self.update_stream_input_window(sid, delta);
            }
        } else if self
            .streams
            .get(&sid)
            .is_some_and(|s| s.state < StreamState::SendHeaders)
        {
            self.set_state(sid, StreamState::ReqPending);
            self.set_state(sid, StreamState::SendHeaders);
        }

        if !Stream::is_push(sid) && self.pull_max_processed < sid {
            self.pull_max_processed = sid;
        }
        if let Some(stream) = self.streams.get_mut(&sid) {
            stream.dispatched = true;
        }
        self.events.push_back(Event::Request(sid));

        // Body bytes that arrived ahead of dispatch form the first chunk.
        if streaming {
            let has_buffered = self
                .streams
                .get(&sid)
                .and_then(|s| s.req_body.buf.as_ref())
                .is_some_and(|b| !b.is_empty());
            let idle = self
                .streams
                .get(&sid)
                .is_some_and(|s| s.entity_len.is_none());
            if has_buffered && idle {
                self.write_streaming_body(sid);
            }
        }
    }

    fn run_pending_requests(&mut self) {
        loop {
            let mut ran_one = false;
            let queued: Vec<StreamId> = self.pending_reqs.iter().copied().collect();
            for sid in queued {
                if !self.can_run_requests() {
                    break;
                }
                let Some(stream) = self.streams.get(&sid) else {
                    continue;
                };
                // Streaming requests honor their own concurrency gate.
                if stream.streaming
                    && self.counts.streaming_in_progress - self.counts.tunnels
                        >= self.config.max_concurrent_streaming_requests_per_connection
                {
                    continue;
                }
                self.pending_reqs.retain(|&id| id != sid);
                if let Some(stream) = self.streams.get_mut(&sid) {
                    stream.queued_for_dispatch = false;
                }
                ran_one = true;
                self.process_request(sid);
            }
            if !ran_one || self.pending_reqs.is_empty() {
                break;
            }
        }
    }

    /// A pull stream opened after the GOAWAY cutoff is silently dropped.
    fn reset_stream_if_disregarded(&mut self, sid: StreamId) -> bool {
        if !Stream::is_push(sid) && sid > self.pull_max_open {
            self.close_stream(sid);
            return true;
        }
        false
    }

    fn execute_or_enqueue_request(&mut self, sid: StreamId) {
        if self.reset_stream_if_disregarded(sid) {
            return;
        }
        if self
            .streams
            .get(&sid)
            .is_some_and(|s| s.state < StreamState::ReqPending)
        {
            self.set_state(sid, StreamState::ReqPending);
        }
        if !self
            .streams
            .get(&sid)
            .is_some_and(|s| s.blocked_by_server)
        {
            self.set_blocked_by_server(sid, true);
        }
        self.execute_or_enqueue_request_core(sid);
    }

    fn execute_or_enqueue_request_core(&mut self, sid: StreamId) {
        if let Some(stream) = self.streams.get_mut(&sid) {
            if !stream.queued_for_dispatch {
                stream.queued_for_dispatch = true;
                self.pending_reqs.push_back(sid);
            }
        }
        self.run_pending_requests();
        self.update_idle_timeout();
    }

    // ---- stream registry -----------------------------------------------

    fn open_stream(&mut self, sid: StreamId, prio: PriorityData) {
        debug_assert!(!self.streams.contains_key(&sid));
        // The scheduler node is assigned right after by priority placement;
        // the root handle is a placeholder that is never scheduled.
        let mut stream = Stream::new(
            sid,
            self.scheduler.root(),
            self.peer_settings.initial_window_size,
        );
        stream.received_priority = prio;
        self.streams.insert(sid, stream);
        self.counts
            .transition(sid, StreamState::EndStream, StreamState::Idle);
    }

    fn set_state(&mut self, sid: StreamId, new_state: StreamState) {
        let Some(stream) = self.streams.get_mut(&sid) else {
            return;
        };
        let old = stream.state;
        if old == new_state {
            return;
        }
        debug_assert!(old < new_state, "stream state moves forward only");
        stream.state = new_state;
        self.counts.transition(sid, old, new_state);
    }

    fn set_req_body_state(&mut self, sid: StreamId, new_state: ReqBodyState) {
        let Some(stream) = self.streams.get_mut(&sid) else {
            return;
        };
        debug_assert!(stream.req_body.state < new_state);
        if new_state == ReqBodyState::CloseDelivered {
            debug_assert!(!stream.streaming);
            if stream.req_body.streamed {
                self.counts.streaming_in_progress -= 1;
                if stream.is_tunnel {
                    self.counts.tunnels -= 1;
                }
            }
        }
        let stream = self.streams.get_mut(&sid).expect("stream is live");
        stream.req_body.state = new_state;
    }

    fn set_blocked_by_server(&mut self, sid: StreamId, blocked: bool) {
        let Some(stream) = self.streams.get_mut(&sid) else {
            return;
        };
        if stream.blocked_by_server == blocked {
            return;
        }
        stream.blocked_by_server = blocked;
        if blocked {
            self.counts.blocked_by_server += 1;
        } else {
            self.counts.blocked_by_server -= 1;
        }
    }

    /// Park the stream's scheduler node in the recently-closed ring so
    /// late PRIORITY references can still attach beneath it. The evicted
    /// occupant, if any, leaves the tree for good.
    fn preserve_stream_scheduler(&mut self, sid: StreamId) {
        let Some(stream) = self.streams.get(&sid) else {
            return;
        };
        let node = stream.sched;
        debug_assert!(self.scheduler.is_open(node));
        self.scheduler.deactivate(node);

        let slot = self.closed_next_slot;
        self.closed_next_slot = (self.closed_next_slot + 1) % self.recently_closed.len();
        if let Some(evicted) = self.recently_closed[slot].take() {
            self.scheduler.close(evicted.node);
        }
        self.recently_closed[slot] = Some(ClosedSlot {
            stream_id: sid,
            node,
        });
    }

    /// Tear down a stream: cancel body streaming, detach from every queue,
    /// park its scheduler node and unregister it. The terminal state
    /// transition keeps the counters honest.
    fn close_stream(&mut self, sid: StreamId) {
        let Some(stream) = self.streams.get(&sid) else {
            return;
        };
        let was_dispatched = stream.dispatched;
        let old_state = stream.state;

        {
            let stream = self.streams.get_mut(&sid).expect("stream is live");
            stream.entity_len = None;
            stream.streaming = false;
        }
        let body_state = self.streams.get(&sid).expect("stream is live").req_body.state;
        if body_state != ReqBodyState::None && body_state < ReqBodyState::CloseDelivered {
            self.set_req_body_state(sid, ReqBodyState::CloseDelivered);
        }

        if self.streams.get(&sid).is_some_and(|s| s.blocked_by_server) {
            self.set_blocked_by_server(sid, false);
        }
        if self
            .streams
            .get(&sid)
            .is_some_and(|s| s.queued_for_dispatch)
        {
            self.pending_reqs.retain(|&id| id != sid);
        }
        if self.streams.get(&sid).is_some_and(|s| s.proceed_queued) {
            self.write.streams_to_proceed.retain(|&id| id != sid);
        }
        if self.streams.get(&sid).is_some_and(|s| s.replay_blocked) {
            self.early_data_blocked.retain(|&id| id != sid);
        }

        self.preserve_stream_scheduler(sid);

        if was_dispatched && old_state != StreamState::EndStream {
            self.events.push_back(Event::Reset(sid));
        }
        self.set_state(sid, StreamState::EndStream);
        self.streams.remove(&sid);

        if self.state < ConnectionState::IsClosing {
            self.run_pending_requests();
            self.update_idle_timeout();
        }
    }

    fn is_idle_stream_id(&self, sid: StreamId) -> bool {
        let max_open = if Stream::is_push(sid) {
            self.push_max_open
        } else {
            self.pull_max_open
        };
        max_open < sid
    }

    // ---- priority placement --------------------------------------------

    /// Place (or re-place) a stream in the dependency tree.
    fn set_priority(&mut self, sid: StreamId, prio: PriorityData, scheduler_is_open: bool) {
        let mut prio = prio;
        let parent = if prio.dependency == 0 {
            self.scheduler.root()
        } else {
            // Recently closed streams are searched first: a newly arriving
            // stream may legitimately depend on a parent that just
            // finished.
            let ring_hit = self
                .recently_closed
                .iter()
                .flatten()
                .find(|slot| slot.stream_id == prio.dependency)
                .map(|slot| slot.node);
            match ring_hit {
                Some(mut parent) => {
                    if self.is_chromium_dependency_tree {
                        let orig_parent_weight = self.scheduler.weight(parent);
                        if orig_parent_weight < prio.weight || !prio.exclusive {
                            // Not the shape Chromium produces.
                            self.is_chromium_dependency_tree = false;
                        } else if let Some(current_parent) = self.streams.get(&prio.dependency) {
                            // The parent is still live but its node was
                            // demoted by a server-side reprioritization;
                            // honor the client's intent by re-locating from
                            // the root by weight.
                            if orig_parent_weight > self.scheduler.weight(current_parent.sched)
                                && prio.exclusive
                            {
                                let found = self.scheduler.find_parent_by_weight(prio.weight);
                                let own_node = self
                                    .streams
                                    .get(&sid)
                                    .map(|s| s.sched)
                                    .filter(|_| scheduler_is_open);
                                parent = if Some(found) == own_node {
                                    current_parent.sched
                                } else {
                                    found
                                };
                            }
                        }
                    }
                    parent
                }
                None => match self.streams.get(&prio.dependency) {
                    Some(parent_stream) => parent_stream.sched,
                    None => {
                        // Unknown or idle dependency: default priority at
                        // the root (RFC 7540 §5.3.1, §5.3.4).
                        prio = PriorityData::DEFAULT;
                        self.scheduler.root()
                    }
                },
            }
        };

        // Keep watching whether the tree still looks Chromium-shaped:
        // exclusive edges with monotonically non-increasing weights.
        if prio.exclusive && self.is_chromium_dependency_tree {
            let mut parent_weight = 256;
            if let Some(gp) = self.scheduler.parent(parent) {
                if self.scheduler.parent(gp).is_some() {
                    parent_weight = self.scheduler.weight(gp);
                }
            }
            if parent_weight < prio.weight {
                self.is_chromium_dependency_tree = false;
            }
        } else {
            self.is_chromium_dependency_tree = false;
        }

        if scheduler_is_open {
            let node = self.streams.get(&sid).expect("stream is live").sched;
            self.scheduler
                .rebind(node, parent, prio.weight, prio.exclusive);
        } else {
            let node = self
                .scheduler
                .open(parent, Some(sid), prio.weight, prio.exclusive);
            if let Some(stream) = self.streams.get_mut(&sid) {
                stream.sched = node;
            }
        }
    }

    // ---- flow control --------------------------------------------------

    fn send_window_update_conn(&mut self, delta: u32) {
        self.write
            .buf
            .extend_from_slice(&WindowUpdateFrame::new(0, delta).serialize());
        self.conn_request_write();
        let _ = self.input_window.widen(i64::from(delta));
    }

    /// Grant `delta` more receive capacity to a stream, batched into as few
    /// WINDOW_UPDATE frames as possible.
    fn update_stream_input_window(&mut self, sid: StreamId, delta: u64) {
        let Some(stream) = self.streams.get_mut(&sid) else {
            return;
        };
        stream.input_window.bytes_unnotified += delta as usize;
        let unnotified = stream.input_window.bytes_unnotified as i64;
        if unnotified >= stream.input_window.window.available() {
            let increment = stream.input_window.bytes_unnotified;
            stream.input_window.bytes_unnotified = 0;
            let _ = stream.input_window.window.widen(increment as i64);
            self.write
                .buf
                .extend_from_slice(&WindowUpdateFrame::new(sid, increment as u32).serialize());
            self.conn_request_write();
        }
    }

    fn update_stream_output_window(
        &mut self,
        sid: StreamId,
        delta: i64,
    ) -> std::result::Result<(), crate::flow::WindowOverflow> {
        let Some(stream) = self.streams.get_mut(&sid) else {
            return Ok(());
        };
        let cur = stream.output_window.available();
        stream.output_window.widen(delta)?;
        let unblocked = cur <= 0 && stream.output_window.available() > 0;
        let wants_send =
            stream.has_pending_data() || stream.state == StreamState::SendBodyIsFinal;
        let node = stream.sched;
        if unblocked && wants_send {
            self.scheduler.activate(node);
        }
        Ok(())
    }

    fn resume_send(&mut self) {
        if self.buffer_window() <= 0 {
            return;
        }
        self.request_gathered_write();
    }

    // ---- write loop ----------------------------------------------------

    fn bytes_in_buf(&self) -> usize {
        self.write.buf.len() + self.write.buf_in_flight.as_ref().map_or(0, |b| b.len())
    }

    /// How many DATA payload bytes may be staged right now: bounded by the
    /// soft output cap and the connection-level send window.
    fn buffer_window(&self) -> i64 {
        let buf_room = host::OUTBUF_SOFT_MAX_SIZE as i64 - self.write.buf.len() as i64;
        buf_room.min(self.output_window.available())
    }

    /// Request a gathered write and apply read-side backpressure.
    fn conn_request_write(&mut self) {
        if self.state == ConnectionState::IsClosing {
            return;
        }
        if !self.reads_paused && self.bytes_in_buf() >= host::OUTBUF_SOFT_MAX_SIZE {
            self.reads_paused = true;
        }
        self.request_gathered_write();
    }

    fn request_gathered_write(&mut self) {
        if self.write.buf_in_flight.is_none() {
            self.write.scheduled = true;
        }
    }

    /// Produce DATA for one scheduled stream. Returns whether the stream
    /// remains active in the scheduler.
    fn emit_stream(&mut self, sid: StreamId) -> bool {
        let conn_budget = self.buffer_window().max(0) as usize;
        let max_frame = self.peer_settings.max_frame_size as usize;

        let (emitted, finished) = {
            let stream = self.streams.get_mut(&sid).expect("scheduled stream is live");
            let budget = conn_budget.min(stream.output_window.available().max(0) as usize);
            stream.emit_data(&mut self.write.buf, budget, max_frame)
        };
        self.output_window.consume(emitted);

        if finished {
            let trailers = self
                .streams
                .get_mut(&sid)
                .and_then(|s| s.trailers.take());
            if let Some(trailers) = trailers {
                self.codec
                    .flatten_trailers(&mut self.write.buf, sid, &trailers, max_frame);
            }
            self.set_state(sid, StreamState::EndStream);
            self.close_stream(sid);
            return false;
        }

        let stream = self.streams.get_mut(&sid).expect("stream is live");
        if stream.has_pending_data() || stream.state == StreamState::SendBodyIsFinal {
            // Window-blocked streams drop out of the active set; a
            // WINDOW_UPDATE reactivates them.
            stream.output_window.available() > 0
        } else {
            if !stream.proceed_queued {
                stream.proceed_queued = true;
                self.write.streams_to_proceed.push_back(sid);
            }
            false
        }
    }

    fn start_response(
        &mut self,
        sid: StreamId,
        status: u16,
        headers: &[(String, String)],
        end_stream: bool,
    ) {
        {
            let stream = self.streams.get_mut(&sid).expect("stream is live");
            stream.response_started = true;
        }
        if self
            .streams
            .get(&sid)
            .is_some_and(|s| s.state < StreamState::SendHeaders)
        {
            self.set_state(sid, StreamState::SendHeaders);
        }
        let max_frame = self.peer_settings.max_frame_size as usize;
        self.codec
            .encode_response(&mut self.write.buf, sid, status, headers, end_stream, max_frame);
        if end_stream {
            self.set_state(sid, StreamState::EndStream);
            self.close_stream(sid);
            self.conn_request_write();
        } else {
            self.register_for_proceed_callback(sid);
        }
    }

    fn queue_body(&mut self, sid: StreamId, data: Bytes, end_stream: bool) {
        {
            let stream = self.streams.get_mut(&sid).expect("stream is live");
            stream.queue_data(data);
        }
        if end_stream {
            self.set_state(sid, StreamState::SendBodyIsFinal);
        } else if self
            .streams
            .get(&sid)
            .is_some_and(|s| s.state < StreamState::SendBody)
        {
            self.set_state(sid, StreamState::SendBody);
        }
        self.register_for_proceed_callback(sid);
    }

    fn register_for_proceed_callback(&mut self, sid: StreamId) {
        self.conn_request_write();
        let Some(stream) = self.streams.get_mut(&sid) else {
            return;
        };
        if stream.has_pending_data() || stream.state >= StreamState::SendBodyIsFinal {
            if stream.output_window.available() > 0 {
                let node = stream.sched;
                self.scheduler.activate(node);
            }
        } else if !stream.proceed_queued {
            stream.proceed_queued = true;
            self.write.streams_to_proceed.push_back(sid);
        }
    }

    // ---- errors and teardown -------------------------------------------

    fn stream_send_error(&mut self, sid: StreamId, code: ErrorCode) {
        debug_assert!(sid != 0);
        if self.state >= ConnectionState::IsClosing {
            return;
        }
        warn!(stream = sid, ?code, "stream error");
        self.write
            .buf
            .extend_from_slice(&RstStreamFrame::new(sid, code).serialize());
        self.conn_request_write();
    }

    fn enqueue_goaway(&mut self, code: ErrorCode, reason: &'static str) {
        if self.state < ConnectionState::IsClosing {
            // GOAWAY may be sent more than once; errors can follow the
            // graceful advisory one.
            let frame = GoAwayFrame::new(self.pull_max_open, code).with_debug_data(reason);
            self.write.buf.extend_from_slice(&frame.serialize());
            self.conn_request_write();
            self.state = ConnectionState::HalfClosed;
        }
    }

    /// Wind the connection down, flushing pending output first if any.
    fn close_connection(&mut self) {
        self.state = ConnectionState::IsClosing;
        if self.write.buf_in_flight.is_some() || self.write.scheduled || !self.write.buf.is_empty()
        {
            // on_write_complete / begin_write finish the job.
            return;
        }
        self.close_connection_now();
    }

    fn close_connection_now(&mut self) {
        self.state = ConnectionState::IsClosing;
        if self.closed {
            return;
        }
        self.closed = true;

        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for sid in ids {
            self.close_stream(sid);
        }
        debug_assert_eq!(self.counts, StreamCounts::default());
        debug_assert!(self.pending_reqs.is_empty());
        debug_assert!(self.write.streams_to_proceed.is_empty());

        for slot in &mut self.recently_closed {
            if let Some(slot) = slot.take() {
                self.scheduler.close(slot.node);
            }
        }
        self.headers_unparsed = None;
        self.write.buf.clear();
        self.write.buf_in_flight = None;
        self.write.scheduled = false;
        self.timers = Timers::default();
        self.early_data_blocked.clear();
    }

    // ---- timers --------------------------------------------------------

    fn update_idle_timeout(&mut self) {
        // The slot belongs to the write timeout while a write is out.
        if self.write.buf_in_flight.is_some() {
            return;
        }
        self.timers.idle = None;
        if !self.early_data && self.counts.blocked_by_server != 0 {
            return;
        }
        self.timers.idle = Some(self.now + self.config.idle_timeout);
    }

    fn on_idle_timeout(&mut self) {
        if self.write.buf_in_flight.is_some() {
            // The write itself timed out; nothing can be flushed anymore.
            warn!("write timeout, closing");
            self.close_connection_now();
            return;
        }
        debug!("idle timeout, closing");
        self.enqueue_goaway(ErrorCode::NoError, "idle timeout");
        self.close_connection();
    }

    fn on_graceful_shutdown_timeout(&mut self) {
        match self.shutdown_phase {
            ShutdownPhase::None => {}
            ShutdownPhase::ResendGoaway => {
                if self.state < ConnectionState::HalfClosed {
                    // The precise GOAWAY: clients learn the exact cutoff.
                    self.enqueue_goaway(ErrorCode::NoError, "");
                    if !self.config.graceful_shutdown_timeout.is_zero() {
                        self.shutdown_phase = ShutdownPhase::CloseStraggler;
                        self.timers.graceful =
                            Some(self.now + self.config.graceful_shutdown_timeout);
                    }
                }
            }
            ShutdownPhase::CloseStraggler => {
                debug!("graceful shutdown grace expired, closing");
                self.close_connection();
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("streams", &self.streams.len())
            .field("pull_max_open", &self.pull_max_open)
            .field("push_max_open", &self.push_max_open)
            .field("closed", &self.closed)
            .finish()
    }
}
