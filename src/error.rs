//! Error types for the manifold crate.

use std::io;

use crate::frame::ErrorCode;
use crate::stream::StreamState;
use crate::StreamId;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the host by the connection core and the driver.
///
/// Protocol violations by the peer are not surfaced here; they are handled
/// inside the connection (GOAWAY / RST_STREAM / immediate close) and the
/// host only observes the connection winding down.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operation referenced a stream that is not live.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    /// An operation is invalid in the stream's current state.
    #[error("stream {stream} is in state {state:?}")]
    InvalidStreamState { stream: StreamId, state: StreamState },

    /// The connection is closing; no further frames may be sent.
    #[error("connection is closing")]
    Closing,

    /// The connection was torn down by a fatal peer error.
    #[error("connection error ({code:?}): {reason}")]
    Protocol { code: ErrorCode, reason: &'static str },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
