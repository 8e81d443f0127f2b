//! # Command Session
//!
//! Owns one client connection and runs its read, parse, dispatch, reply loop.
//!
//! ## Design Principles
//!
//! 1. **Stream, Not Packets**: A read may carry part of a command or several
//!    commands; the session appends to a growable buffer and drains every
//!    complete command before reading again.
//! 2. **Ordered Replies**: Replies for one batch are encoded in request order
//!    and flushed together, so pipelined clients see them in order.
//! 3. **Local Failure**: Command errors and oversized requests become
//!    replies and the session carries on. I/O failures, idle timeout,
//!    shutdown, `QUIT`, and misframed input that leaves no request boundary
//!    end the session; misframed input is answered before closing.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, warn};

use dice_engine::KVEngine;

use crate::dispatch::Dispatcher;
use crate::protocol::{RespParser, DEFAULT_MAX_BULK_LEN};
use crate::shutdown::Shutdown;

const READ_CHUNK: usize = 4 * 1024;

/// Per-connection limits taken from the server configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Close the connection after this long without input.
    pub idle_timeout: Option<Duration>,
    /// Largest bulk argument accepted from the client.
    pub max_bulk_len: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            idle_timeout: None,
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
        }
    }
}

/// Why a session stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    Data,
    Eof,
    Idle,
}

struct Session<E> {
    stream: TcpStream,
    peer: SocketAddr,
    read_buf: BytesMut,
    write_buf: BytesMut,
    parser: RespParser,
    dispatcher: Dispatcher<E>,
    idle_timeout: Option<Duration>,
}

/// Serves one client until it disconnects, errors, idles out, or the server
/// shuts down.
///
/// I/O errors end only this connection; they are logged and swallowed here.
pub async fn handle_connection<E: KVEngine>(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher<E>,
    settings: SessionSettings,
    mut shutdown: Shutdown,
) {
    let mut session = Session {
        stream,
        peer,
        read_buf: BytesMut::with_capacity(READ_CHUNK),
        write_buf: BytesMut::with_capacity(READ_CHUNK),
        parser: RespParser::with_max_bulk_len(settings.max_bulk_len),
        dispatcher,
        idle_timeout: settings.idle_timeout,
    };

    if let Err(err) = session.run(&mut shutdown).await {
        warn!(%peer, error = %err, "connection terminated by I/O error");
    }
}

impl<E: KVEngine> Session<E> {
    async fn run(&mut self, shutdown: &mut Shutdown) -> io::Result<()> {
        while !shutdown.is_shutdown() {
            let close = self.process_buffered();
            if !self.write_buf.is_empty() {
                self.stream.write_all(&self.write_buf).await?;
                self.write_buf.clear();
            }
            if close {
                debug!(peer = %self.peer, "closing session after final reply");
                return Ok(());
            }

            let outcome = tokio::select! {
                res = read_more(&mut self.stream, &mut self.read_buf, self.idle_timeout) => res?,
                _ = shutdown.recv() => {
                    debug!(peer = %self.peer, "closing session for shutdown");
                    return Ok(());
                }
            };

            match outcome {
                ReadOutcome::Data => {}
                ReadOutcome::Eof => {
                    if self.parser.is_mid_frame() || !self.read_buf.is_empty() {
                        debug!(peer = %self.peer, "connection reset by peer mid-frame");
                    }
                    return Ok(());
                }
                ReadOutcome::Idle => {
                    debug!(peer = %self.peer, "closing idle connection");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Dispatches every complete command in the read buffer.
    ///
    /// Returns true if the connection must close once the replies are
    /// written: a command asked for it, or the input can no longer be
    /// framed.
    fn process_buffered(&mut self) -> bool {
        loop {
            match self.parser.parse(&mut self.read_buf) {
                Ok(Some(args)) => {
                    let outcome = self.dispatcher.dispatch(args);
                    outcome.reply.encode(&mut self.write_buf);
                    if outcome.close {
                        return true;
                    }
                }
                Ok(None) => return false,
                Err(err) => {
                    debug!(peer = %self.peer, error = %err, "protocol error");
                    self.dispatcher.protocol_error(err).encode(&mut self.write_buf);
                    if !err.is_recoverable() {
                        self.read_buf.clear();
                        return true;
                    }
                }
            }
        }
    }
}

async fn read_more(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    idle_timeout: Option<Duration>,
) -> io::Result<ReadOutcome> {
    buf.reserve(READ_CHUNK);
    let read = match idle_timeout {
        Some(limit) => match time::timeout(limit, stream.read_buf(buf)).await {
            Ok(read) => read?,
            Err(_) => return Ok(ReadOutcome::Idle),
        },
        None => stream.read_buf(buf).await?,
    };

    if read == 0 {
        Ok(ReadOutcome::Eof)
    } else {
        Ok(ReadOutcome::Data)
    }
}
