//! # Command Parsing
//!
//! Turns the raw argument list of one request into a typed [`Command`].
//!
//! Command names are matched case-insensitively. Arity and option errors are
//! reported as [`CommandError`] values which the dispatcher renders into
//! error replies; none of them ends the session.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use dice_common::DiceError;
use dice_engine::{SetCondition, SetOptions};

/// Errors produced while parsing or executing a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The request carried no arguments at all.
    #[error("empty command")]
    Empty,
    /// The command name is not recognised.
    #[error("unknown command '{0}'")]
    Unknown(String),
    /// The command was given the wrong number of arguments.
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),
    /// Unknown option or conflicting options.
    #[error("syntax error")]
    Syntax,
    /// An argument that must be an integer is not one.
    #[error("value is not an integer or out of range")]
    NotInteger,
    /// An expiry that is non-positive (`SET`) or cannot be represented.
    #[error("invalid expire time in '{0}' command")]
    InvalidExpire(&'static str),
    /// The engine rejected the operation.
    #[error("{0}")]
    Engine(#[from] DiceError),
}

impl CommandError {
    /// Maps the error onto the stable error code vocabulary.
    pub fn code(&self) -> DiceError {
        match self {
            Self::Empty | Self::Unknown(_) => DiceError::UnknownCommand,
            Self::WrongArity(_) => DiceError::WrongArity,
            Self::Syntax => DiceError::SyntaxError,
            Self::NotInteger => DiceError::NotInteger,
            Self::InvalidExpire(_) => DiceError::InvalidInput,
            Self::Engine(err) => *err,
        }
    }
}

/// Unit used by expiry commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    /// Whole seconds (`EXPIRE`, `TTL`).
    Seconds,
    /// Milliseconds (`PEXPIRE`, `PTTL`).
    Millis,
}

impl TimeUnit {
    /// Lowercase name of the expiry command taking this unit.
    pub const fn expire_command(self) -> &'static str {
        match self {
            TimeUnit::Seconds => "expire",
            TimeUnit::Millis => "pexpire",
        }
    }
}

/// A fully parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping(Option<Bytes>),
    Echo(Bytes),
    Set {
        key: Bytes,
        value: Bytes,
        options: SetOptions,
    },
    Get(Bytes),
    Del(Vec<Bytes>),
    Exists(Vec<Bytes>),
    /// `EXPIRE`/`PEXPIRE`; `millis <= 0` deletes the key.
    Expire {
        key: Bytes,
        millis: i64,
        unit: TimeUnit,
    },
    Ttl {
        key: Bytes,
        unit: TimeUnit,
    },
    Persist(Bytes),
    IncrBy {
        key: Bytes,
        delta: i64,
    },
    DbSize,
    FlushDb,
    Info,
    Command,
    Quit,
}

impl Command {
    /// Parses a raw request into a command.
    pub fn parse(args: Vec<Bytes>) -> Result<Command, CommandError> {
        let mut args = args.into_iter();
        let name = args.next().ok_or(CommandError::Empty)?;
        let rest: Vec<Bytes> = args.collect();
        let upper = name.to_ascii_uppercase();

        let command = match upper.as_slice() {
            b"PING" => match <[Bytes; 0]>::try_from(rest) {
                Ok([]) => Command::Ping(None),
                Err(rest) => {
                    let [message] = exact::<1>(rest, "ping")?;
                    Command::Ping(Some(message))
                }
            },
            b"ECHO" => {
                let [message] = exact::<1>(rest, "echo")?;
                Command::Echo(message)
            }
            b"SET" => parse_set(rest)?,
            b"GET" => {
                let [key] = exact::<1>(rest, "get")?;
                Command::Get(key)
            }
            b"DEL" => Command::Del(at_least_one(rest, "del")?),
            b"EXISTS" => Command::Exists(at_least_one(rest, "exists")?),
            b"EXPIRE" | b"PEXPIRE" => {
                let unit = if upper.as_slice() == b"EXPIRE" {
                    TimeUnit::Seconds
                } else {
                    TimeUnit::Millis
                };
                let [key, amount] = exact::<2>(rest, unit.expire_command())?;
                let amount = parse_int(&amount)?;
                let millis = match unit {
                    TimeUnit::Seconds => amount
                        .checked_mul(1_000)
                        .ok_or(CommandError::InvalidExpire(unit.expire_command()))?,
                    TimeUnit::Millis => amount,
                };
                Command::Expire { key, millis, unit }
            }
            b"TTL" => {
                let [key] = exact::<1>(rest, "ttl")?;
                Command::Ttl {
                    key,
                    unit: TimeUnit::Seconds,
                }
            }
            b"PTTL" => {
                let [key] = exact::<1>(rest, "pttl")?;
                Command::Ttl {
                    key,
                    unit: TimeUnit::Millis,
                }
            }
            b"PERSIST" => {
                let [key] = exact::<1>(rest, "persist")?;
                Command::Persist(key)
            }
            b"INCR" => {
                let [key] = exact::<1>(rest, "incr")?;
                Command::IncrBy { key, delta: 1 }
            }
            b"DECR" => {
                let [key] = exact::<1>(rest, "decr")?;
                Command::IncrBy { key, delta: -1 }
            }
            b"INCRBY" => {
                let [key, delta] = exact::<2>(rest, "incrby")?;
                let delta = parse_int(&delta)?;
                Command::IncrBy { key, delta }
            }
            b"DECRBY" => {
                let [key, delta] = exact::<2>(rest, "decrby")?;
                let delta = parse_int(&delta)?
                    .checked_neg()
                    .ok_or(DiceError::Overflow)?;
                Command::IncrBy { key, delta }
            }
            b"DBSIZE" => {
                let [] = exact::<0>(rest, "dbsize")?;
                Command::DbSize
            }
            b"FLUSHDB" => {
                let [] = exact::<0>(rest, "flushdb")?;
                Command::FlushDb
            }
            b"INFO" => Command::Info,
            b"COMMAND" => Command::Command,
            b"QUIT" => Command::Quit,
            _ => {
                return Err(CommandError::Unknown(
                    String::from_utf8_lossy(&name).into_owned(),
                ))
            }
        };
        Ok(command)
    }
}

fn exact<const N: usize>(args: Vec<Bytes>, name: &'static str) -> Result<[Bytes; N], CommandError> {
    <[Bytes; N]>::try_from(args).map_err(|_| CommandError::WrongArity(name))
}

fn at_least_one(args: Vec<Bytes>, name: &'static str) -> Result<Vec<Bytes>, CommandError> {
    if args.is_empty() {
        return Err(CommandError::WrongArity(name));
    }
    Ok(args)
}

fn parse_int(arg: &[u8]) -> Result<i64, CommandError> {
    if arg.first() == Some(&b'+') {
        return Err(CommandError::NotInteger);
    }
    std::str::from_utf8(arg)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or(CommandError::NotInteger)
}

/// `SET key value [EX seconds | PX milliseconds] [NX | XX]`
fn parse_set(args: Vec<Bytes>) -> Result<Command, CommandError> {
    if args.len() < 2 {
        return Err(CommandError::WrongArity("set"));
    }
    let mut args = args.into_iter();
    let (Some(key), Some(value)) = (args.next(), args.next()) else {
        return Err(CommandError::WrongArity("set"));
    };

    let mut options = SetOptions::default();
    while let Some(option) = args.next() {
        let option = option.to_ascii_uppercase();
        match option.as_slice() {
            b"NX" if options.condition == SetCondition::Always => {
                options.condition = SetCondition::IfAbsent;
            }
            b"XX" if options.condition == SetCondition::Always => {
                options.condition = SetCondition::IfPresent;
            }
            b"EX" | b"PX" if options.ttl.is_none() => {
                let amount = args.next().ok_or(CommandError::Syntax)?;
                let amount = parse_int(&amount)?;
                if amount <= 0 {
                    return Err(CommandError::InvalidExpire("set"));
                }
                let amount = amount.unsigned_abs();
                options.ttl = Some(if option.as_slice() == b"EX" {
                    Duration::from_secs(amount)
                } else {
                    Duration::from_millis(amount)
                });
            }
            _ => return Err(CommandError::Syntax),
        }
    }

    Ok(Command::Set { key, value, options })
}
