//! Per-stream state: lifecycle, windows, request body, and send queue.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::config::host;
use crate::flow::{RecvWindow, Window};
use crate::frame::{DataFrame, PriorityData};
use crate::hpack::RequestHeaders;
use crate::scheduler::NodeId;
use crate::StreamId;

/// Stream lifecycle. Transitions are forward-only; `EndStream` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    Idle,
    RecvHeaders,
    RecvBody,
    ReqPending,
    SendHeaders,
    SendBody,
    SendBodyIsFinal,
    EndStream,
}

/// Receive-side body lifecycle. Strictly increasing; `CloseDelivered` is
/// terminal and reached at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReqBodyState {
    None,
    OpenBeforeFirstFrame,
    Open,
    CloseQueued,
    CloseDelivered,
}

#[derive(Debug)]
pub struct ReqBody {
    pub state: ReqBodyState,
    /// Accumulated body bytes; absent when no body is expected.
    pub buf: Option<BytesMut>,
    /// Body is being delivered to the application incrementally.
    pub streamed: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PushState {
    pub parent_stream_id: StreamId,
    pub promise_sent: bool,
}

#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    pub state: StreamState,
    pub input_window: RecvWindow,
    pub output_window: Window,
    pub sched: NodeId,
    pub received_priority: PriorityData,

    pub req: Option<RequestHeaders>,
    pub content_length: Option<u64>,
    pub body_bytes_received: u64,
    pub req_body: ReqBody,
    /// Length of the body chunk handed to the application and not yet
    /// consumed via `proceed_request`.
    pub entity_len: Option<usize>,
    /// The connection will deliver body chunks incrementally.
    pub streaming: bool,
    pub is_tunnel: bool,

    pub blocked_by_server: bool,
    pub dispatched: bool,
    /// Parked for re-dispatch once TLS early data completes.
    pub replay_blocked: bool,
    /// Waiting in `pending_reqs` for a dispatch slot.
    pub queued_for_dispatch: bool,
    /// Waiting in `streams_to_proceed` for the next write completion.
    pub proceed_queued: bool,

    pub response_started: bool,
    send_queue: VecDeque<Bytes>,
    queued_bytes: usize,
    pub trailers: Option<Vec<(String, String)>>,
    pub push: PushState,
}

impl Stream {
    pub fn new(id: StreamId, sched: NodeId, send_window: u32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            input_window: RecvWindow::new(host::STREAM_INITIAL_WINDOW_SIZE),
            output_window: Window::new(send_window),
            sched,
            received_priority: PriorityData::DEFAULT,
            req: None,
            content_length: None,
            body_bytes_received: 0,
            req_body: ReqBody {
                state: ReqBodyState::None,
                buf: None,
                streamed: false,
            },
            entity_len: None,
            streaming: false,
            is_tunnel: false,
            blocked_by_server: false,
            dispatched: false,
            replay_blocked: false,
            queued_for_dispatch: false,
            proceed_queued: false,
            response_started: false,
            send_queue: VecDeque::new(),
            queued_bytes: 0,
            trailers: None,
            push: PushState::default(),
        }
    }

    /// Even stream ids are server-initiated.
    pub fn is_push(id: StreamId) -> bool {
        id % 2 == 0
    }

    pub fn has_pending_data(&self) -> bool {
        self.queued_bytes > 0
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn queue_data(&mut self, data: Bytes) {
        self.queued_bytes += data.len();
        if !data.is_empty() {
            self.send_queue.push_back(data);
        }
    }

    /// Whether the body can still legally receive DATA.
    pub fn body_is_open(&self) -> bool {
        matches!(
            self.req_body.state,
            ReqBodyState::OpenBeforeFirstFrame | ReqBodyState::Open
        )
    }

    /// Emit queued DATA frames into `out`, spending at most `budget` bytes
    /// of combined window. The stream's own send window is consumed here;
    /// the caller accounts the connection scope.
    ///
    /// Returns `(bytes_emitted, finished)` where `finished` means the final
    /// byte of the response body has been staged. When trailers are pending
    /// the last DATA frame leaves END_STREAM clear so the caller can attach
    /// the trailing HEADERS.
    pub fn emit_data(
        &mut self,
        out: &mut BytesMut,
        budget: usize,
        max_frame_size: usize,
    ) -> (usize, bool) {
        let mut emitted = 0usize;
        let is_final = self.state == StreamState::SendBodyIsFinal;

        while emitted < budget {
            let Some(front) = self.send_queue.front_mut() else {
                break;
            };
            let take = front.len().min(budget - emitted).min(max_frame_size);
            if take == 0 {
                break;
            }
            let chunk = front.split_to(take);
            if front.is_empty() {
                self.send_queue.pop_front();
            }
            self.queued_bytes -= take;
            let last = is_final && self.queued_bytes == 0;
            let end_stream = last && self.trailers.is_none();
            DataFrame::new(self.id, chunk)
                .end_stream(end_stream)
                .serialize_into(out);
            self.output_window.consume(take);
            emitted += take;
            if last {
                return (emitted, true);
            }
        }

        // A final response with nothing (left) to send still needs its end
        // marker; a zero-length DATA frame consumes no window.
        if is_final && self.queued_bytes == 0 {
            if emitted == 0 && self.trailers.is_none() {
                DataFrame::new(self.id, Bytes::new())
                    .end_stream(true)
                    .serialize_into(out);
            }
            return (emitted, true);
        }

        (emitted, false)
    }
}

/// Per-class stream accounting; every counter is derived from stream state
/// transitions so the totals can be asserted at teardown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamCounts {
    /// Streams tracked only because PRIORITY frames referenced them.
    pub priority_open: usize,
    pub pull_open: usize,
    pub push_open: usize,
    /// Requests whose client side is complete and are being processed.
    pub pull_half_closed: usize,
    pub push_half_closed: usize,
    pub blocked_by_server: usize,
    pub streaming_in_progress: usize,
    pub tunnels: usize,
}

impl StreamCounts {
    /// Which counters a stream occupies in a given state.
    fn occupancy(id: StreamId, state: StreamState) -> (bool, bool, bool) {
        let priority = state == StreamState::Idle;
        let open = matches!(
            state,
            StreamState::RecvHeaders
                | StreamState::RecvBody
                | StreamState::ReqPending
                | StreamState::SendHeaders
                | StreamState::SendBody
                | StreamState::SendBodyIsFinal
        );
        let half_closed = matches!(
            state,
            StreamState::ReqPending
                | StreamState::SendHeaders
                | StreamState::SendBody
                | StreamState::SendBodyIsFinal
        );
        let _ = id;
        (priority, open, half_closed)
    }

    pub fn transition(&mut self, id: StreamId, old: StreamState, new: StreamState) {
        let (old_prio, old_open, old_half) = Self::occupancy(id, old);
        let (new_prio, new_open, new_half) = Self::occupancy(id, new);
        let push = Stream::is_push(id);

        if old_prio && !new_prio {
            self.priority_open -= 1;
        } else if !old_prio && new_prio {
            self.priority_open += 1;
        }
        match (old_open, new_open) {
            (false, true) => {
                if push {
                    self.push_open += 1;
                } else {
                    self.pull_open += 1;
                }
            }
            (true, false) => {
                if push {
                    self.push_open -= 1;
                } else {
                    self.pull_open -= 1;
                }
            }
            _ => {}
        }
        match (old_half, new_half) {
            (false, true) => {
                if push {
                    self.push_half_closed += 1;
                } else {
                    self.pull_half_closed += 1;
                }
            }
            (true, false) => {
                if push {
                    self.push_half_closed -= 1;
                } else {
                    self.pull_half_closed -= 1;
                }
            }
            _ => {}
        }
    }

    pub fn live_streams(&self) -> usize {
        self.priority_open + self.pull_open + self.push_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{flags, FrameHeader, FrameType, FRAME_HEADER_SIZE};

    fn sched_node() -> NodeId {
        crate::scheduler::Scheduler::new().root()
    }

    fn parse_frames(buf: &[u8]) -> Vec<(FrameHeader, Vec<u8>)> {
        let mut frames = Vec::new();
        let mut off = 0;
        while off < buf.len() {
            let header = FrameHeader::parse(&buf[off..]).unwrap();
            let end = off + FRAME_HEADER_SIZE + header.length as usize;
            frames.push((header.clone(), buf[off + FRAME_HEADER_SIZE..end].to_vec()));
            off = end;
        }
        frames
    }

    #[test]
    fn emit_respects_budget_and_frame_size() {
        let mut stream = Stream::new(1, sched_node(), 65_535);
        stream.state = StreamState::SendBody;
        stream.queue_data(Bytes::from(vec![0x61; 50_000]));

        let mut out = BytesMut::new();
        let (emitted, finished) = stream.emit_data(&mut out, 40_000, 16_384);
        assert_eq!(emitted, 40_000);
        assert!(!finished);
        let frames = parse_frames(&out);
        assert_eq!(frames.len(), 3); // 16384 + 16384 + 7232
        assert!(frames.iter().all(|(h, _)| h.frame_type == FrameType::Data));
        assert_eq!(stream.queued_bytes(), 10_000);
        assert_eq!(stream.output_window.available(), 65_535 - 40_000);
    }

    #[test]
    fn final_drain_sets_end_stream() {
        let mut stream = Stream::new(1, sched_node(), 65_535);
        stream.state = StreamState::SendBodyIsFinal;
        stream.queue_data(Bytes::from_static(b"done"));

        let mut out = BytesMut::new();
        let (emitted, finished) = stream.emit_data(&mut out, 1_000, 16_384);
        assert_eq!(emitted, 4);
        assert!(finished);
        let frames = parse_frames(&out);
        assert_eq!(frames.len(), 1);
        assert_ne!(frames[0].0.flags & flags::END_STREAM, 0);
    }

    #[test]
    fn empty_final_emits_zero_length_end_frame() {
        let mut stream = Stream::new(1, sched_node(), 65_535);
        stream.state = StreamState::SendBodyIsFinal;

        let mut out = BytesMut::new();
        let (emitted, finished) = stream.emit_data(&mut out, 0, 16_384);
        assert_eq!(emitted, 0);
        assert!(finished);
        let frames = parse_frames(&out);
        assert_eq!(frames[0].0.length, 0);
        assert_ne!(frames[0].0.flags & flags::END_STREAM, 0);
    }

    #[test]
    fn trailers_suppress_end_stream_on_data() {
        let mut stream = Stream::new(1, sched_node(), 65_535);
        stream.state = StreamState::SendBodyIsFinal;
        stream.trailers = Some(vec![("server-timing".into(), "total;dur=1".into())]);
        stream.queue_data(Bytes::from_static(b"payload"));

        let mut out = BytesMut::new();
        let (_, finished) = stream.emit_data(&mut out, 1_000, 16_384);
        assert!(finished);
        let frames = parse_frames(&out);
        assert_eq!(frames[0].0.flags & flags::END_STREAM, 0);
    }

    #[test]
    fn counts_follow_lifecycle() {
        let mut counts = StreamCounts::default();
        // Registration counts the stream as idle before its first HEADERS.
        counts.transition(1, StreamState::EndStream, StreamState::Idle);
        counts.transition(1, StreamState::Idle, StreamState::RecvHeaders);
        assert_eq!(counts.pull_open, 1);
        counts.transition(1, StreamState::RecvHeaders, StreamState::ReqPending);
        assert_eq!(counts.pull_half_closed, 1);
        counts.transition(1, StreamState::ReqPending, StreamState::EndStream);
        assert_eq!(counts, StreamCounts::default());
    }

    #[test]
    fn priority_only_streams_count_separately() {
        let mut counts = StreamCounts::default();
        // Registering in Idle state tracks the stream as priority-only.
        counts.transition(5, StreamState::EndStream, StreamState::Idle);
        assert_eq!(counts.priority_open, 1);
        assert_eq!(counts.pull_open, 0);
        counts.transition(5, StreamState::Idle, StreamState::RecvHeaders);
        assert_eq!(counts.priority_open, 0);
        assert_eq!(counts.pull_open, 1);
    }
}
