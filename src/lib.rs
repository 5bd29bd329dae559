//! # Manifold
//!
//! Server-side HTTP/2 connection core with full protocol control.
//!
//! The heart of the crate is [`Connection`]: a sans-I/O, single-threaded
//! state machine that consumes the client's byte stream, multiplexes frames
//! into request/response streams, arbitrates egress through a weighted
//! dependency scheduler, enforces connection- and stream-level flow control,
//! and orchestrates graceful shutdown. It never touches a socket: the host
//! feeds it bytes, drains staged output buffers, and fires its timer
//! deadlines. [`server::ConnectionDriver`] does exactly that on top of any
//! tokio `AsyncRead + AsyncWrite` transport.
//!
//! ```no_run
//! use manifold::{Config, Connection, Event};
//! use std::time::Instant;
//!
//! let mut conn = Connection::new(Config::default(), Instant::now());
//! conn.feed(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n", Instant::now());
//! while let Some(event) = conn.poll_event() {
//!     if let Event::Request(stream) = event {
//!         conn.send_response(stream, 200, &[], true).unwrap();
//!     }
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod flow;
pub mod frame;
pub mod hpack;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod stream;

/// Stream identifier (31 bits on the wire; odd = client-initiated).
pub type StreamId = u32;

pub use config::Config;
pub use connection::{Connection, ConnectionState, DebugState, Event};
pub use error::{Error, Result};
pub use frame::ErrorCode;
pub use hpack::RequestHeaders;
pub use server::{ConnectionDriver, Service};
