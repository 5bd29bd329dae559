//! Connection- and stream-level flow-control windows.
//!
//! Each direction keeps a signed counter bounded above by 2^31-1. Send
//! windows drain as DATA is emitted and grow on WINDOW_UPDATE; receive
//! windows drain as DATA arrives and grow when the server decides to
//! replenish. A SETTINGS-initiated shrink can drive a send window negative,
//! which is legal; exceeding the upper bound is not.

/// Upper bound on any flow-control window (RFC 7540 §6.9.1).
pub const MAX_WINDOW: i64 = (1 << 31) - 1;

/// The increment would have pushed the window past 2^31-1. The window is
/// left unchanged; the caller maps this to a FLOW_CONTROL error at the
/// appropriate scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOverflow;

/// A single flow-control window.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    avail: i64,
}

impl Window {
    pub fn new(initial: u32) -> Self {
        Self {
            avail: i64::from(initial),
        }
    }

    /// Remaining capacity; negative after a SETTINGS shrink.
    pub fn available(&self) -> i64 {
        self.avail
    }

    /// Account for `len` bytes sent or received.
    pub fn consume(&mut self, len: usize) {
        self.avail -= len as i64;
    }

    /// Grow (or shrink, for negative `delta`) the window.
    pub fn widen(&mut self, delta: i64) -> Result<(), WindowOverflow> {
        if self.avail + delta > MAX_WINDOW {
            return Err(WindowOverflow);
        }
        self.avail += delta;
        Ok(())
    }
}

/// Receive window plus the deferred-update accumulator used to batch
/// stream-level WINDOW_UPDATE frames.
#[derive(Debug, Clone, Copy)]
pub struct RecvWindow {
    pub window: Window,
    /// Bytes consumed (or capacity granted) that the peer has not yet been
    /// told about. Flushed once it reaches the currently available window.
    pub bytes_unnotified: usize,
}

impl RecvWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            window: Window::new(initial),
            bytes_unnotified: 0,
        }
    }
}
