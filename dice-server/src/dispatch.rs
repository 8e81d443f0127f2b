//! # Command Dispatcher
//!
//! Maps a parsed request onto the shared engine and produces its reply.
//!
//! ## Design Principles
//!
//! 1. **Never Fatal**: Every failure becomes an error reply; the dispatcher
//!    has no way to end a session except an explicit `QUIT`.
//! 2. **Shared Nothing Per Call**: The dispatcher is a cheap `Clone` of a few
//!    `Arc`s, so every session owns one and calls it without coordination.
//! 3. **Engine Does the Locking**: Atomicity lives in [`KVEngine`]; no lock is
//!    taken here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use dice_common::{DiceError, DiceErrorCategory};
use dice_engine::{KVEngine, TtlStatus};

use crate::command::{Command, CommandError, TimeUnit};
use crate::connections::ConnectionTracker;
use crate::metrics::Metrics;
use crate::protocol::{Reply, RespError};

/// Result of dispatching one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Reply to write back to the client.
    pub reply: Reply,
    /// True when the session must close after writing the reply.
    pub close: bool,
}

/// Executes commands against a shared engine.
pub struct Dispatcher<E> {
    engine: Arc<E>,
    metrics: Arc<Metrics>,
    connections: ConnectionTracker,
    started_at: Instant,
}

impl<E> Clone for Dispatcher<E> {
    fn clone(&self) -> Self {
        Dispatcher {
            engine: Arc::clone(&self.engine),
            metrics: Arc::clone(&self.metrics),
            connections: self.connections.clone(),
            started_at: self.started_at,
        }
    }
}

impl<E: KVEngine> Dispatcher<E> {
    pub fn new(engine: Arc<E>, metrics: Arc<Metrics>, connections: ConnectionTracker) -> Self {
        Dispatcher {
            engine,
            metrics,
            connections,
            started_at: Instant::now(),
        }
    }

    /// Returns the metrics shared by every session.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Parses and executes one request.
    pub fn dispatch(&self, args: Vec<Bytes>) -> Outcome {
        let start = Instant::now();
        self.metrics.record_request_start();

        let outcome = match Command::parse(args) {
            Ok(Command::Quit) => Outcome {
                reply: Reply::ok(),
                close: true,
            },
            Ok(command) => Outcome {
                reply: self
                    .execute(command)
                    .unwrap_or_else(|err| self.error_reply(&err)),
                close: false,
            },
            Err(err) => Outcome {
                reply: self.error_reply(&err),
                close: false,
            },
        };

        self.metrics.record_request_end(start.elapsed());
        outcome
    }

    /// Builds the reply for a framing error and counts it.
    pub fn protocol_error(&self, err: RespError) -> Reply {
        self.metrics.record_error(DiceError::ProtocolViolation.category());
        Reply::protocol_error(err)
    }

    fn error_reply(&self, err: &CommandError) -> Reply {
        debug!(error = %err, "command rejected");
        self.metrics.record_error(err.code().category());
        Reply::error(err)
    }

    /// Executes a parsed command.
    pub fn execute(&self, command: Command) -> Result<Reply, CommandError> {
        let engine = &*self.engine;
        let reply = match command {
            Command::Ping(None) => Reply::Simple("PONG"),
            Command::Ping(Some(message)) | Command::Echo(message) => Reply::Bulk(message),
            Command::Set {
                key,
                value,
                options,
            } => match engine.set_with(key.to_vec(), value.to_vec(), options) {
                Ok(true) => Reply::ok(),
                Ok(false) => Reply::Null,
                Err(DiceError::InvalidInput) => return Err(CommandError::InvalidExpire("set")),
                Err(err) => return Err(err.into()),
            },
            Command::Get(key) => match engine.get(&key)? {
                Some(value) => Reply::Bulk(Bytes::copy_from_slice(&value)),
                None => Reply::Null,
            },
            Command::Del(keys) => {
                let mut removed = 0;
                for key in &keys {
                    removed += i64::from(engine.delete(key)?);
                }
                Reply::Integer(removed)
            }
            Command::Exists(keys) => {
                let mut present = 0;
                for key in &keys {
                    present += i64::from(engine.exists(key)?);
                }
                Reply::Integer(present)
            }
            Command::Expire { key, millis, .. } if millis <= 0 => {
                Reply::Integer(i64::from(engine.delete(&key)?))
            }
            Command::Expire { key, millis, unit } => {
                match engine.expire(&key, Duration::from_millis(millis.unsigned_abs())) {
                    Ok(()) => Reply::Integer(1),
                    Err(DiceError::NotFound) => Reply::Integer(0),
                    Err(DiceError::InvalidInput) => {
                        return Err(CommandError::InvalidExpire(unit.expire_command()))
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Command::Ttl { key, unit } => Reply::Integer(match engine.ttl(&key)? {
                TtlStatus::Missing => -2,
                TtlStatus::NoExpiry => -1,
                TtlStatus::ExpiresIn(remaining) => {
                    let millis = i64::try_from(remaining.as_millis()).unwrap_or(i64::MAX);
                    match unit {
                        TimeUnit::Seconds => millis.saturating_add(500) / 1_000,
                        TimeUnit::Millis => millis,
                    }
                }
            }),
            Command::Persist(key) => Reply::Integer(i64::from(engine.persist(&key)?)),
            Command::IncrBy { key, delta } => Reply::Integer(engine.incr_by(&key, delta)?),
            Command::DbSize => Reply::Integer(i64::try_from(engine.len()).unwrap_or(i64::MAX)),
            Command::FlushDb => {
                engine.clear();
                Reply::ok()
            }
            Command::Info => Reply::Bulk(Bytes::from(self.info())),
            Command::Command => Reply::Array(Vec::new()),
            Command::Quit => Reply::ok(),
        };
        Ok(reply)
    }

    fn info(&self) -> String {
        let stats = self.metrics.snapshot();
        let errorstats = DiceErrorCategory::ALL.map(|category| {
            format!(
                "errorstat_{}:count={}",
                category.label(),
                stats.errors_in(category)
            )
        });
        let head = [
            "# Server".to_string(),
            format!("dice_version:{}", env!("CARGO_PKG_VERSION")),
            "engine:dicekv".to_string(),
            format!("uptime_in_seconds:{}", self.started_at.elapsed().as_secs()),
            String::new(),
            "# Clients".to_string(),
            format!("connected_clients:{}", self.connections.live()),
            String::new(),
            "# Stats".to_string(),
            format!("total_connections_received:{}", self.connections.total_accepted()),
            format!("total_commands_processed:{}", stats.requests_total),
            format!("total_error_replies:{}", stats.errors_total),
        ];
        let tail = [
            format!("inflight_commands:{}", stats.inflight),
            format!("latency_mean_us:{}", stats.latency.mean_us()),
            format!("latency_p50_us:{}", stats.latency.quantile_us(0.5)),
            format!("latency_p99_us:{}", stats.latency.quantile_us(0.99)),
            String::new(),
            "# Keyspace".to_string(),
            format!("db0:keys={}", self.engine.len()),
        ];
        let lines: Vec<String> = head.into_iter().chain(errorstats).chain(tail).collect();
        let mut text = lines.join("\r\n");
        text.push_str("\r\n");
        text
    }
}
