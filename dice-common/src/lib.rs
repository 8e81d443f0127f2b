// dice-common - Shared error codes for DiceKV
//
// This crate defines the error vocabulary used by the engine and the server

pub mod error;

// Re-export for convenience
pub use error::*;
