//! # Storage Engine Interface
//!
//! ## Design Principles
//!
//! 1. **Strategy Pattern**: Abstract the engine behind a trait so different
//!    implementations can be swapped without touching the caller.
//! 2. **Binary-Safe API**: Keys/values are byte buffers to match Redis semantics.
//! 3. **Zero-Cost Dispatch**: When used with generics, calls monomorphize to
//!    avoid dynamic dispatch overhead.
//! 4. **Atomic Read-Modify-Write**: Conditional writes and counters are engine
//!    operations, so callers never need a lock of their own.

use std::sync::Arc;
use std::time::Duration;

use dice_common::DiceResult;

/// TTL query result for Redis-style semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// Key does not exist or is already expired.
    Missing,
    /// Key exists but has no expiration set.
    NoExpiry,
    /// Key expires after the given duration.
    ExpiresIn(Duration),
}

/// Existence precondition for a write (`NX` / `XX`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    /// Write unconditionally.
    #[default]
    Always,
    /// Write only if the key is missing (`NX`).
    IfAbsent,
    /// Write only if the key already exists (`XX`).
    IfPresent,
}

/// Options accepted by [`KVEngine::set_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetOptions {
    /// Relative expiration; `None` stores the key without a TTL.
    pub ttl: Option<Duration>,
    /// Existence precondition checked under the same lock as the write.
    pub condition: SetCondition,
}

/// Strategy pattern: defines the engine behavior surface for the server.
///
/// Keys and values are treated as bulk strings (binary-safe).
pub trait KVEngine: Send + Sync {
    /// Returns the value for a key, or `None` if missing or expired.
    fn get(&self, key: &[u8]) -> DiceResult<Option<Arc<[u8]>>>;

    /// Inserts or replaces a key with the provided value, clearing any TTL.
    ///
    /// Takes ownership to avoid extra copies on the hot path.
    fn set(&self, key: Vec<u8>, value: Vec<u8>) -> DiceResult<()> {
        self.set_with(key, value, SetOptions::default()).map(|_| ())
    }

    /// Writes a key honoring TTL and existence conditions.
    ///
    /// Returns false when the condition prevented the write.
    fn set_with(&self, key: Vec<u8>, value: Vec<u8>, options: SetOptions) -> DiceResult<bool>;

    /// Removes a key. Returns true if the key existed and was removed.
    fn delete(&self, key: &[u8]) -> DiceResult<bool>;

    /// Returns true if the key exists and is not expired.
    fn exists(&self, key: &[u8]) -> DiceResult<bool>;

    /// Sets an expiration on a key. Returns `NotFound` if the key is missing.
    fn expire(&self, key: &[u8], ttl: Duration) -> DiceResult<()>;

    /// Drops the expiration of a key. Returns true if a TTL was removed.
    fn persist(&self, key: &[u8]) -> DiceResult<bool>;

    /// Returns the TTL state for a key.
    fn ttl(&self, key: &[u8]) -> DiceResult<TtlStatus>;

    /// Adds `delta` to the integer stored at `key` and returns the result.
    ///
    /// Missing keys count as zero. The existing TTL is kept.
    fn incr_by(&self, key: &[u8], delta: i64) -> DiceResult<i64>;

    /// Returns the number of live keys.
    fn len(&self) -> usize;

    /// Returns true if no live keys are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every key.
    fn clear(&self);
}
