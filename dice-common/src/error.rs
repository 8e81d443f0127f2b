//! # DiceKV Error Types
//!
//! ## Design Principles
//!
//! 1. **Stable Codes**: Each variant has a fixed numeric code that never changes meaning.
//! 2. **Categorized Ranges**: Codes are grouped by intent (client, server, command,
//!    protocol).
//! 3. **Low Overhead**: Enums are `Copy` and `repr(u16)` to keep them cheap to pass around.

use core::fmt;

/// Result type used across DiceKV components.
pub type DiceResult<T> = core::result::Result<T, DiceError>;

/// High-level category for grouping error codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DiceErrorCategory {
    /// Invalid input or user request issues.
    Client,
    /// Server-side resource or invariant failures.
    Server,
    /// Well-framed requests naming an unknown command or misusing a known one.
    Command,
    /// Malformed request framing.
    Protocol,
}

impl DiceErrorCategory {
    /// Every category, in reporting order.
    pub const ALL: [DiceErrorCategory; 4] =
        [Self::Client, Self::Server, Self::Command, Self::Protocol];

    /// Returns a short lowercase label, used in INFO output.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
            Self::Command => "command",
            Self::Protocol => "protocol",
        }
    }
}

/// Error codes shared between the storage engine and the server.
#[repr(u16)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DiceError {
    /// Client error: input failed validation (code 1).
    InvalidInput = 1,
    /// Client error: key not found (code 2).
    NotFound = 2,
    /// Client error: key length exceeds MAX_KEY_SIZE (code 3).
    KeyTooLong = 3,
    /// Client error: value length exceeds MAX_VALUE_SIZE (code 4).
    ValueTooLong = 4,
    /// Client error: stored value or argument is not a 64-bit integer (code 5).
    NotInteger = 5,
    /// Client error: integer arithmetic would overflow (code 6).
    Overflow = 6,

    /// Server error: internal invariant violated (code 10).
    InternalError = 10,

    /// Command error: command name not recognised (code 20).
    UnknownCommand = 20,
    /// Command error: wrong number of arguments (code 21).
    WrongArity = 21,
    /// Command error: unknown option or invalid option combination (code 22).
    SyntaxError = 22,

    /// Protocol error: request framing is malformed (code 30).
    ProtocolViolation = 30,
}

impl DiceError {
    /// Returns the stable numeric code for the error.
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Returns the coarse category of the error.
    pub const fn category(self) -> DiceErrorCategory {
        match self {
            Self::InvalidInput
            | Self::NotFound
            | Self::KeyTooLong
            | Self::ValueTooLong
            | Self::NotInteger
            | Self::Overflow => DiceErrorCategory::Client,
            Self::InternalError => DiceErrorCategory::Server,
            Self::UnknownCommand | Self::WrongArity | Self::SyntaxError => {
                DiceErrorCategory::Command
            }
            Self::ProtocolViolation => DiceErrorCategory::Protocol,
        }
    }

    /// Converts a numeric code into a typed error.
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::InvalidInput),
            2 => Some(Self::NotFound),
            3 => Some(Self::KeyTooLong),
            4 => Some(Self::ValueTooLong),
            5 => Some(Self::NotInteger),
            6 => Some(Self::Overflow),
            10 => Some(Self::InternalError),
            20 => Some(Self::UnknownCommand),
            21 => Some(Self::WrongArity),
            22 => Some(Self::SyntaxError),
            30 => Some(Self::ProtocolViolation),
            _ => None,
        }
    }
}

impl fmt::Display for DiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::InvalidInput => "invalid input",
            Self::NotFound => "no such key",
            Self::KeyTooLong => "key too long",
            Self::ValueTooLong => "value too long",
            Self::NotInteger => "value is not an integer or out of range",
            Self::Overflow => "increment or decrement would overflow",
            Self::InternalError => "internal error",
            Self::ProtocolViolation => "protocol violation",
            Self::UnknownCommand => "unknown command",
            Self::WrongArity => "wrong number of arguments",
            Self::SyntaxError => "syntax error",
        };
        write!(f, "{}", label)
    }
}

impl std::error::Error for DiceError {}
