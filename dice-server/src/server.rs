//! # Connection Acceptor
//!
//! Owns the listening socket, spawns one task per client, and coordinates
//! graceful shutdown.
//!
//! ## Design Principles
//!
//! 1. **Never Block Accept**: Each connection runs on its own Tokio task; the
//!    accept loop only registers and spawns.
//! 2. **Classified Accept Errors**: Per-connection accept failures are
//!    retried at once; resource errors back off exponentially; only a
//!    persistent failure stops the server.
//! 3. **Drain on Shutdown**: Stop accepting, notify every session, and wait
//!    (bounded) for the live count to reach zero.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, info, warn};

use dice_engine::KVEngine;

use crate::config::ServerConfig;
use crate::connections::ConnectionTracker;
use crate::dispatch::Dispatcher;
use crate::metrics::Metrics;
use crate::session::{self, SessionSettings};
use crate::shutdown::Shutdown;

const LISTEN_BACKLOG: i32 = 1024;
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(64);

/// Fatal server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be created.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// The listener kept failing after backing off.
    #[error("failed to accept connections: {0}")]
    Accept(#[source] io::Error),
}

impl ServerError {
    /// Process exit code reported for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            ServerError::Bind { .. } => 2,
            ServerError::Accept(_) => 1,
        }
    }
}

/// Binds the configured `host:port` with `SO_REUSEADDR` set.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let endpoint = config.endpoint();
    let bind_error = |source| ServerError::Bind {
        addr: endpoint.clone(),
        source,
    };

    let addr = tokio::net::lookup_host((config.host.as_str(), config.port))
        .await
        .map_err(bind_error)?
        .next()
        .ok_or_else(|| {
            bind_error(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "host resolved to no addresses",
            ))
        })?;

    bind_addr(addr).map_err(bind_error)
}

fn bind_addr(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Accept loop state.
struct Acceptor<E> {
    listener: TcpListener,
    dispatcher: Dispatcher<E>,
    connections: ConnectionTracker,
    settings: SessionSettings,
    notify_shutdown: broadcast::Sender<()>,
}

/// Runs the server until `shutdown` resolves or the listener fails.
///
/// After the accept loop stops, every session is told to close and the call
/// waits up to `config.shutdown_grace` for them to finish.
pub async fn run<E, F>(
    listener: TcpListener,
    engine: Arc<E>,
    config: ServerConfig,
    shutdown: F,
) -> Result<(), ServerError>
where
    E: KVEngine + 'static,
    F: Future,
{
    let (notify_shutdown, _) = broadcast::channel(1);
    let connections = ConnectionTracker::new();
    let dispatcher = Dispatcher::new(engine, Arc::new(Metrics::new()), connections.clone());

    let mut acceptor = Acceptor {
        listener,
        dispatcher,
        connections,
        settings: config.session_settings(),
        notify_shutdown,
    };

    let result = tokio::select! {
        res = acceptor.run() => res,
        _ = shutdown => {
            info!("shutdown requested; no longer accepting connections");
            Ok(())
        }
    };

    let Acceptor {
        listener,
        notify_shutdown,
        connections,
        ..
    } = acceptor;
    drop(listener);

    // Dropping the sender wakes every session's `Shutdown`.
    drop(notify_shutdown);

    if time::timeout(config.shutdown_grace, connections.wait_idle())
        .await
        .is_err()
    {
        warn!(
            clients = connections.live(),
            "shutdown grace period elapsed with open connections"
        );
    } else {
        info!("all sessions drained");
    }

    result
}

impl<E: KVEngine + 'static> Acceptor<E> {
    async fn run(&mut self) -> Result<(), ServerError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "accepting connections");
        }

        loop {
            let (stream, peer) = self.accept().await?;
            if let Err(err) = stream.set_nodelay(true) {
                debug!(%peer, error = %err, "failed to set TCP_NODELAY");
            }

            let guard = self.connections.register(peer);
            let dispatcher = self.dispatcher.clone();
            let settings = self.settings;
            let shutdown = Shutdown::new(self.notify_shutdown.subscribe());

            tokio::spawn(async move {
                session::handle_connection(stream, peer, dispatcher, settings, shutdown).await;
                drop(guard);
            });
        }
    }

    async fn accept(&mut self) -> Result<(TcpStream, SocketAddr), ServerError> {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) if is_connection_error(&err) => {
                    debug!(error = %err, "transient accept error");
                }
                Err(err) => {
                    if backoff > MAX_BACKOFF {
                        return Err(ServerError::Accept(err));
                    }
                    warn!(
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "accept failed; backing off"
                    );
                    time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}

/// Errors that concern a single pending connection, not the listener.
fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}
