pub mod engine;
pub mod memory;

pub use engine::{KVEngine, SetCondition, SetOptions, TtlStatus};
pub use memory::{ExpirerHandle, MemoryEngine, MAX_KEY_SIZE, MAX_VALUE_SIZE};
