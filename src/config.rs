//! Connection configuration and host-side protocol constants.

use std::time::Duration;

use crate::hpack::RequestHeaders;

/// Values the server advertises or assumes for its own side of the
/// connection. These are not negotiable at runtime; the configurable knobs
/// live in [`Config`].
pub mod host {
    use std::time::Duration;

    /// Largest frame payload the server is willing to parse.
    pub const MAX_FRAME_SIZE: u32 = 16_384;

    /// Advertised SETTINGS_MAX_CONCURRENT_STREAMS.
    pub const MAX_CONCURRENT_STREAMS: u32 = 100;

    /// Initial per-stream receive window (the RFC 7540 default; the server
    /// preface does not advertise SETTINGS_INITIAL_WINDOW_SIZE).
    pub const STREAM_INITIAL_WINDOW_SIZE: u32 = 65_535;

    /// Connection-level receive window, established by the WINDOW_UPDATE in
    /// the server preface and replenished at the half-way mark.
    pub const CONNECTION_WINDOW_SIZE: u32 = 16_777_216;

    /// Soft cap on buffered output; reads pause above it.
    pub const OUTBUF_SOFT_MAX_SIZE: usize = 32_768;

    /// Deadline for a single gathered socket write.
    pub const OUTBUF_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Slots retained for the priorities of recently closed streams.
    pub const CLOSED_STREAM_PRIORITIES: usize = 10;

    /// Delay between the first (max-id) GOAWAY and the precise second one.
    pub const GOAWAY_RESEND_DELAY: Duration = Duration::from_secs(1);

    /// Entries remembered per connection to avoid pushing a path twice.
    pub const PUSH_MEMO_CAPACITY: usize = 1_024;
}

/// Host policy deciding whether a request body may be delivered to the
/// application incrementally instead of buffered to completion.
pub type CanStreamRequest = Box<dyn Fn(&RequestHeaders) -> bool + Send>;

/// Per-connection configuration.
pub struct Config {
    /// Maximum quiet period before the connection is shut down.
    pub idle_timeout: Duration,

    /// Final forced-close grace after the second GOAWAY of a graceful
    /// shutdown. Zero disables the forced close; the connection then lives
    /// until its streams drain.
    pub graceful_shutdown_timeout: Duration,

    /// Gate on dispatching queued requests: requests in flight (client side
    /// complete, response side running) must stay below this.
    pub max_concurrent_requests_per_connection: usize,

    /// Gate on entering streaming mode, tunnels excluded.
    pub max_concurrent_streaming_requests_per_connection: usize,

    /// Streams tracked solely because PRIORITY frames referenced them.
    /// Exceeding this is answered with ENHANCE_YOUR_CALM.
    pub max_streams_for_priority: usize,

    /// Per-stream receive window while an upload is actively consumed.
    pub active_stream_window_size: u32,

    /// Receive-side cap on request bodies; exceeding it refuses the stream.
    pub max_request_entity_size: u64,

    /// Cap on an accumulated HEADERS + CONTINUATION block.
    pub max_request_header_size: usize,

    /// Whether PUSH_PROMISE may be initiated toward this client at all
    /// (the peer's SETTINGS_ENABLE_PUSH is honored independently).
    pub push_enabled: bool,

    /// Host decision for streaming request bodies; defaults to "never",
    /// which buffers every body. CONNECT tunnels always stream.
    pub can_stream_request: Option<CanStreamRequest>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            graceful_shutdown_timeout: Duration::ZERO,
            max_concurrent_requests_per_connection: 100,
            max_concurrent_streaming_requests_per_connection: 1,
            max_streams_for_priority: 100,
            active_stream_window_size: 16_777_216,
            max_request_entity_size: 1_073_741_824,
            max_request_header_size: 32_768,
            push_enabled: true,
            can_stream_request: None,
        }
    }
}

impl Config {
    pub(crate) fn may_stream(&self, req: &RequestHeaders) -> bool {
        match &self.can_stream_request {
            Some(f) => f(req),
            None => false,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("idle_timeout", &self.idle_timeout)
            .field("graceful_shutdown_timeout", &self.graceful_shutdown_timeout)
            .field(
                "max_concurrent_requests_per_connection",
                &self.max_concurrent_requests_per_connection,
            )
            .field(
                "max_concurrent_streaming_requests_per_connection",
                &self.max_concurrent_streaming_requests_per_connection,
            )
            .field("max_streams_for_priority", &self.max_streams_for_priority)
            .field("active_stream_window_size", &self.active_stream_window_size)
            .field("max_request_entity_size", &self.max_request_entity_size)
            .field("max_request_header_size", &self.max_request_header_size)
            .field("push_enabled", &self.push_enabled)
            .field(
                "can_stream_request",
                &self.can_stream_request.as_ref().map(|_| ".."),
            )
            .finish()
    }
}
