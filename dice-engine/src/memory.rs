//! # In-Memory Engine
//!
//! Sharded hash map storage with lazy and background expiration.
//!
//! ## Design Principles
//!
//! 1. **Lock Striping**: Keys are spread over a fixed number of shards, each
//!    behind its own `RwLock`, so unrelated keys never contend.
//! 2. **One Lock Per Operation**: Every single-key operation takes exactly one
//!    shard lock, which makes conditional writes and counters atomic.
//! 3. **Lazy Expiry**: Readers treat expired entries as missing; writers and
//!    the expirer thread physically remove them.
//! 4. **Stable Routing**: Shard selection uses fixed `ahash` seeds, so a key
//!    always maps to the same shard for the lifetime of the process.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, warn};

use dice_common::{DiceError, DiceResult};

use crate::engine::{KVEngine, SetCondition, SetOptions, TtlStatus};

/// Largest accepted key length in bytes.
pub const MAX_KEY_SIZE: usize = 64 * 1024;

/// Largest accepted value length in bytes.
pub const MAX_VALUE_SIZE: usize = 512 * 1024 * 1024;

const SHARD_COUNT: usize = 16;

const SHARD_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

#[derive(Debug)]
struct Entry {
    value: Arc<[u8]>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

type Shard = RwLock<HashMap<Box<[u8]>, Entry>>;

/// Thread-safe in-memory engine.
pub struct MemoryEngine {
    shards: Box<[Shard]>,
    router: RandomState,
}

impl MemoryEngine {
    /// Creates an empty engine.
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        MemoryEngine {
            shards,
            router: RandomState::with_seeds(
                SHARD_SEEDS[0],
                SHARD_SEEDS[1],
                SHARD_SEEDS[2],
                SHARD_SEEDS[3],
            ),
        }
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        let idx = (self.router.hash_one(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Write-locks the shard owning `key` and drops the entry if it expired.
    fn lock_live(&self, key: &[u8], now: Instant) -> RwLockWriteGuard<'_, HashMap<Box<[u8]>, Entry>> {
        let mut shard = self.shard(key).write();
        if shard.get(key).is_some_and(|entry| entry.is_expired(now)) {
            shard.remove(key);
        }
        shard
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut map = shard.write();
            let before = map.len();
            map.retain(|_, entry| !entry.is_expired(now));
            removed += before - map.len();
        }
        removed
    }

    /// Starts a background thread that purges expired entries every `interval`.
    ///
    /// The thread holds only a weak reference, so it also exits once the
    /// engine itself is dropped.
    pub fn start_expirer(self: &Arc<Self>, interval: Duration) -> DiceResult<ExpirerHandle> {
        let signal = Arc::new(ExpirerSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let engine = Arc::downgrade(self);
        let thread_signal = Arc::clone(&signal);

        let thread = std::thread::Builder::new()
            .name("dice-expirer".to_string())
            .spawn(move || run_expirer(engine, thread_signal, interval))
            .map_err(|err| {
                warn!(error = %err, "failed to spawn expirer thread");
                DiceError::InternalError
            })?;

        Ok(ExpirerHandle {
            signal,
            thread: Some(thread),
        })
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn check_sizes(key: &[u8], value: &[u8]) -> DiceResult<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(DiceError::KeyTooLong);
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(DiceError::ValueTooLong);
    }
    Ok(())
}

/// Parses a stored counter. A leading `+` is rejected like any other
/// non-canonical form.
fn parse_i64(value: &[u8]) -> DiceResult<i64> {
    if value.first() == Some(&b'+') {
        return Err(DiceError::NotInteger);
    }
    std::str::from_utf8(value)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or(DiceError::NotInteger)
}

impl KVEngine for MemoryEngine {
    fn get(&self, key: &[u8]) -> DiceResult<Option<Arc<[u8]>>> {
        let now = Instant::now();
        let shard = self.shard(key).read();
        Ok(shard
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| Arc::clone(&entry.value)))
    }

    fn set_with(&self, key: Vec<u8>, value: Vec<u8>, options: SetOptions) -> DiceResult<bool> {
        check_sizes(&key, &value)?;
        let now = Instant::now();
        let expires_at = match options.ttl {
            Some(ttl) => Some(now.checked_add(ttl).ok_or(DiceError::InvalidInput)?),
            None => None,
        };

        let mut shard = self.lock_live(&key, now);
        let present = shard.contains_key(key.as_slice());
        match options.condition {
            SetCondition::IfAbsent if present => return Ok(false),
            SetCondition::IfPresent if !present => return Ok(false),
            _ => {}
        }

        shard.insert(
            key.into_boxed_slice(),
            Entry {
                value: Arc::from(value),
                expires_at,
            },
        );
        Ok(true)
    }

    fn delete(&self, key: &[u8]) -> DiceResult<bool> {
        let now = Instant::now();
        let mut shard = self.shard(key).write();
        Ok(shard
            .remove(key)
            .is_some_and(|entry| !entry.is_expired(now)))
    }

    fn exists(&self, key: &[u8]) -> DiceResult<bool> {
        let now = Instant::now();
        let shard = self.shard(key).read();
        Ok(shard.get(key).is_some_and(|entry| !entry.is_expired(now)))
    }

    fn expire(&self, key: &[u8], ttl: Duration) -> DiceResult<()> {
        let now = Instant::now();
        let deadline = now.checked_add(ttl).ok_or(DiceError::InvalidInput)?;
        let mut shard = self.lock_live(key, now);
        let entry = shard.get_mut(key).ok_or(DiceError::NotFound)?;
        entry.expires_at = Some(deadline);
        Ok(())
    }

    fn persist(&self, key: &[u8]) -> DiceResult<bool> {
        let now = Instant::now();
        let mut shard = self.lock_live(key, now);
        Ok(shard
            .get_mut(key)
            .and_then(|entry| entry.expires_at.take())
            .is_some())
    }

    fn ttl(&self, key: &[u8]) -> DiceResult<TtlStatus> {
        let now = Instant::now();
        let shard = self.shard(key).read();
        let status = match shard.get(key) {
            None => TtlStatus::Missing,
            Some(entry) if entry.is_expired(now) => TtlStatus::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => TtlStatus::NoExpiry,
            Some(Entry {
                expires_at: Some(deadline),
                ..
            }) => TtlStatus::ExpiresIn(deadline.saturating_duration_since(now)),
        };
        Ok(status)
    }

    fn incr_by(&self, key: &[u8], delta: i64) -> DiceResult<i64> {
        if key.len() > MAX_KEY_SIZE {
            return Err(DiceError::KeyTooLong);
        }
        let now = Instant::now();
        let mut shard = self.lock_live(key, now);

        let (current, expires_at) = match shard.get(key) {
            Some(entry) => (parse_i64(&entry.value)?, entry.expires_at),
            None => (0, None),
        };
        let next = current.checked_add(delta).ok_or(DiceError::Overflow)?;

        let value: Arc<[u8]> = Arc::from(next.to_string().into_bytes());
        match shard.get_mut(key) {
            Some(entry) => entry.value = value,
            None => {
                shard.insert(key.into(), Entry { value, expires_at });
            }
        }
        Ok(next)
    }

    fn len(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .values()
                    .filter(|entry| !entry.is_expired(now))
                    .count()
            })
            .sum()
    }

    fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }
}

struct ExpirerSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

fn run_expirer(engine: Weak<MemoryEngine>, signal: Arc<ExpirerSignal>, interval: Duration) {
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if !*stopped {
                signal.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                return;
            }
        }

        let Some(live) = engine.upgrade() else {
            return;
        };
        let removed = live.purge_expired();
        if removed > 0 {
            debug!(removed, "purged expired keys");
        }
    }
}

/// Handle to the background expirer thread.
///
/// Dropping the handle stops the thread as well.
pub struct ExpirerHandle {
    signal: Arc<ExpirerSignal>,
    thread: Option<JoinHandle<()>>,
}

impl ExpirerHandle {
    /// Stops the expirer and waits for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("expirer thread panicked");
            }
        }
    }
}

impl Drop for ExpirerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
