//! # DiceKV Server
//!
//! Provide a Redis-compatible TCP server that routes commands to the
//! in-memory storage engine.
//!
//! ## Design Principles
//!
//! 1. **Single Responsibility**: Framing, command parsing, dispatch, sessions,
//!    and accepting live in separate modules.
//! 2. **Async First**: Tokio runs one task per connection.
//! 3. **Fail-Open Defaults**: Protocol errors are localized to the connection.
//! 4. **Performance Focus**: Reuse buffers and avoid unnecessary allocations.

pub mod command;
pub mod config;
pub mod connections;
pub mod dispatch;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::{Cli, ServerConfig};
pub use server::ServerError;
