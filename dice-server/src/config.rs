//! Server configuration and command line flags.

use std::time::Duration;

use clap::Parser;

use crate::protocol::DEFAULT_MAX_BULK_LEN;
use crate::session::SessionSettings;

/// Default listen host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default listen port.
pub const DEFAULT_PORT: u16 = 7379;

/// Immutable server settings, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// `None` keeps silent connections open forever.
    pub idle_timeout: Option<Duration>,
    /// How long shutdown waits for open sessions to finish.
    pub shutdown_grace: Duration,
    /// Period of the background expirer.
    pub expire_interval: Duration,
    pub max_bulk_len: usize,
    /// Default `tracing` filter; `RUST_LOG` takes precedence.
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            idle_timeout: None,
            shutdown_grace: Duration::from_secs(5),
            expire_interval: Duration::from_millis(100),
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            log_filter: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// `host:port` as shown in logs and errors.
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Limits handed to every command session.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_timeout: self.idle_timeout,
            max_bulk_len: self.max_bulk_len,
        }
    }
}

/// Command line flags for `dice-server`.
#[derive(Debug, Parser)]
#[command(name = "dice-server", version, about = "Redis-compatible in-memory key-value server")]
pub struct Cli {
    /// Host to listen on.
    #[arg(long, env = "DICE_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on.
    #[arg(
        long,
        env = "DICE_PORT",
        default_value_t = DEFAULT_PORT,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub port: u16,

    /// Close connections idle for this many seconds (0 disables).
    #[arg(long, env = "DICE_IDLE_TIMEOUT", value_name = "SECS", default_value_t = 0)]
    pub idle_timeout: u64,

    /// Seconds to wait for sessions to drain on shutdown.
    #[arg(long, env = "DICE_SHUTDOWN_GRACE", value_name = "SECS", default_value_t = 5)]
    pub shutdown_grace: u64,

    /// Interval of the background expirer in milliseconds.
    #[arg(
        long,
        env = "DICE_EXPIRE_INTERVAL_MS",
        value_name = "MS",
        default_value_t = 100,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub expire_interval_ms: u64,

    /// Largest bulk string accepted from clients, in bytes.
    #[arg(long, env = "DICE_MAX_BULK_LEN", value_name = "BYTES", default_value_t = DEFAULT_MAX_BULK_LEN)]
    pub max_bulk_len: usize,

    /// Log filter directive, e.g. `info` or `dice_server=debug`.
    #[arg(long = "log", env = "DICE_LOG", value_name = "FILTER", default_value = "info")]
    pub log: String,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        ServerConfig {
            host: cli.host,
            port: cli.port,
            idle_timeout: (cli.idle_timeout > 0).then(|| Duration::from_secs(cli.idle_timeout)),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace),
            expire_interval: Duration::from_millis(cli.expire_interval_ms),
            max_bulk_len: cli.max_bulk_len,
            log_filter: cli.log,
        }
    }
}
