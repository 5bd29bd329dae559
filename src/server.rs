//! Tokio driver: runs a [`Connection`] over any async byte stream.
//!
//! The driver owns the socket and the connection core and mediates between
//! them: socket reads feed the frame pipeline, staged output buffers go out
//! as single gathered writes, timer deadlines are slept on, and connection
//! events are dispatched to a [`Service`].

use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::config::Config;
use crate::connection::{Connection, Event};
use crate::error::Result;
use crate::StreamId;

/// The application side of a connection: request dispatch and the
/// streaming-body/response-production callbacks.
pub trait Service {
    /// A request is ready; respond (now or later) via the connection's
    /// `send_response` / `send_body` / `send_trailers`.
    fn process_request(&mut self, conn: &mut Connection, stream: StreamId);

    /// A streaming request body chunk is available via `req_entity`. The
    /// default implementation consumes it immediately.
    fn req_body_chunk(&mut self, conn: &mut Connection, stream: StreamId, is_end_stream: bool) {
        let _ = is_end_stream;
        conn.proceed_request(stream, true);
    }

    /// Previously staged response bytes were flushed; produce more.
    fn proceed_send(&mut self, conn: &mut Connection, stream: StreamId) {
        let _ = (conn, stream);
    }

    /// The stream was torn down before the response completed.
    fn reset(&mut self, conn: &mut Connection, stream: StreamId) {
        let _ = (conn, stream);
    }
}

/// Drives one connection to completion on the current task.
pub struct ConnectionDriver<T> {
    io: T,
    conn: Connection,
}

impl<T> ConnectionDriver<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T, config: Config) -> Self {
        Self {
            io,
            conn: Connection::new(config, Instant::now()),
        }
    }

    /// Wrap an already-created connection (e.g. one taken over from an
    /// HTTP/1.1 upgrade).
    pub fn with_connection(io: T, conn: Connection) -> Self {
        Self { io, conn }
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Run until the connection is fully closed.
    pub async fn run<S: Service>(mut self, service: &mut S) -> Result<()> {
        let mut buf = vec![0u8; 16_384];
        loop {
            Self::dispatch_events(&mut self.conn, service);
            Self::flush(&mut self.io, &mut self.conn).await?;
            if self.conn.is_closed() {
                return Ok(());
            }

            let deadline = self.conn.next_timeout();
            let io = &mut self.io;
            let conn = &mut self.conn;
            tokio::select! {
                res = io.read(&mut buf), if !conn.reads_paused() => {
                    match res {
                        Ok(0) => conn.close(),
                        Ok(n) => conn.feed(&buf[..n], Instant::now()),
                        Err(err) => {
                            warn!(%err, "socket read failed");
                            conn.close();
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    conn.handle_timeout(Instant::now());
                }
            }
        }
    }

    fn dispatch_events<S: Service>(conn: &mut Connection, service: &mut S) {
        while let Some(event) = conn.poll_event() {
            match event {
                Event::Request(stream) => service.process_request(conn, stream),
                Event::ReqBodyChunk {
                    stream,
                    is_end_stream,
                } => service.req_body_chunk(conn, stream, is_end_stream),
                Event::ProceedSend(stream) => service.proceed_send(conn, stream),
                Event::Reset(stream) => service.reset(conn, stream),
            }
        }
    }

    /// Perform gathered writes until the core has nothing staged. At most
    /// one buffer is ever in flight.
    async fn flush(io: &mut T, conn: &mut Connection) -> Result<()> {
        while conn.wants_write() {
            let Some(bytes) = conn.begin_write(Instant::now()) else {
                break;
            };
            match io.write_all(&bytes).await {
                Ok(()) => conn.on_write_complete(true, Instant::now()),
                Err(err) => {
                    warn!(%err, "socket write failed");
                    conn.on_write_complete(false, Instant::now());
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}
