//! # RESP2 Protocol
//!
//! Parse RESP2 requests from a streaming TCP buffer and encode replies.
//!
//! ## Design Principles
//!
//! 1. **State Machine Pattern**: Explicit parser states avoid backtracking and
//!    keep control flow predictable.
//! 2. **Streaming Friendly**: The parser consumes from a mutable buffer and
//!    returns `None` when more data is needed. Bytes are only consumed once a
//!    whole line or bulk payload is available, and a header search resumes
//!    where the previous one stopped.
//! 3. **Low Allocation**: Bulk arguments are split off the read buffer as
//!    `Bytes` without copying.
//! 4. **Bounded Memory**: Header and inline lines are capped at
//!    [`MAX_INLINE_LEN`]. An oversized request is skipped as it streams in and
//!    answered with a single error, so none of its payload is ever parsed as
//!    a request.
//! 5. **Fatal Misframing**: When a request boundary can no longer be found
//!    the error is final for the stream; see [`RespError::is_recoverable`].
//!
//! Two request forms are accepted: multibulk arrays (`*<n>\r\n$<len>\r\n...`)
//! and inline commands (`PING\r\n`), the latter for telnet-style clients.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Default upper bound for a single bulk argument (512 MiB).
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Upper bound for the number of arguments in one multibulk request.
pub const MAX_MULTIBULK_LEN: usize = 1024 * 1024;

/// Upper bound for an inline request or a `*`/`$` header line.
pub const MAX_INLINE_LEN: usize = 64 * 1024;

/// RESP parser errors surfaced to the server for client responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RespError {
    /// Multibulk count is not a number or exceeds [`MAX_MULTIBULK_LEN`].
    #[error("invalid multibulk length")]
    InvalidMultibulkLength,
    /// Bulk length is not a number.
    #[error("invalid bulk length")]
    InvalidBulkLength,
    /// Bulk length exceeds the configured maximum. The whole request was
    /// skipped.
    #[error("invalid bulk length")]
    BulkTooLarge,
    /// A bulk header did not start with `$`.
    #[error("expected '$', got '{0}'")]
    ExpectedBulk(char),
    /// A bulk payload was not followed by CRLF.
    #[error("bulk string not terminated by CRLF")]
    MissingCrlf,
    /// A `*` or `$` header grew past [`MAX_INLINE_LEN`] without a newline.
    #[error("too big count string")]
    HeaderTooLong,
    /// An inline request was longer than [`MAX_INLINE_LEN`]. The whole line
    /// was skipped.
    #[error("too big inline request")]
    InlineTooLong,
}

impl RespError {
    /// Returns true if the offending request was consumed in full and the
    /// next byte starts a new request.
    ///
    /// Any other error leaves the request boundary unknown; the connection
    /// cannot be read further.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RespError::BulkTooLarge | RespError::InlineTooLong)
    }
}

/// RESP2 request parser.
#[derive(Debug)]
pub struct RespParser {
    state: ParseState,
    args: Vec<Bytes>,
    remaining: usize,
    bulk_len: usize,
    max_bulk_len: usize,
    /// Leading bytes of the buffer already searched for a newline.
    scanned: usize,
    /// Set once the current multibulk request is rejected; its remaining
    /// arguments are skipped and the error is reported when it ends.
    rejected: Option<RespError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    ArrayLen,
    BulkLen,
    BulkData,
    /// Dropping the payload of a rejected request's argument.
    SkipBulk,
    /// Dropping an oversized inline request up to its newline.
    SkipLine,
}

impl RespParser {
    /// Creates a new parser in the initial state.
    pub fn new() -> Self {
        Self::with_max_bulk_len(DEFAULT_MAX_BULK_LEN)
    }

    /// Creates a parser that rejects bulk arguments longer than `max_bulk_len`.
    pub fn with_max_bulk_len(max_bulk_len: usize) -> Self {
        RespParser {
            state: ParseState::ArrayLen,
            args: Vec::new(),
            remaining: 0,
            bulk_len: 0,
            max_bulk_len,
            scanned: 0,
            rejected: None,
        }
    }

    /// Drops any half-parsed request and returns to the initial state.
    pub fn reset(&mut self) {
        self.state = ParseState::ArrayLen;
        self.args.clear();
        self.remaining = 0;
        self.bulk_len = 0;
        self.scanned = 0;
        self.rejected = None;
    }

    /// Returns true if a request has started but is not complete.
    pub fn is_mid_frame(&self) -> bool {
        self.state != ParseState::ArrayLen
    }

    /// Attempts to parse a single command from the buffer.
    ///
    /// Returns `Ok(None)` if more data is required. Blank inline lines are
    /// skipped rather than reported as empty commands.
    ///
    /// A request that breaks a size limit is consumed as it arrives, without
    /// buffering its payload, and reported as one recoverable error once it
    /// ends. After any other error the parser is reset and the rest of the
    /// stream cannot be framed.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>, RespError> {
        let result = self.parse_request(buf);
        if matches!(&result, Err(err) if !err.is_recoverable()) {
            self.reset();
        }
        result
    }

    fn parse_request(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>, RespError> {
        loop {
            match self.state {
                ParseState::ArrayLen => {
                    let Some(&first) = buf.first() else {
                        return Ok(None);
                    };
                    if first != b'*' {
                        match self.parse_inline(buf)? {
                            Some(args) if args.is_empty() => continue,
                            other => return Ok(other),
                        }
                    }
                    let Some(line) = self.read_line(buf)? else {
                        return Ok(None);
                    };
                    let count = parse_usize(&line[1..])
                        .filter(|&count| count <= MAX_MULTIBULK_LEN)
                        .ok_or(RespError::InvalidMultibulkLength)?;
                    if count == 0 {
                        return Ok(Some(Vec::new()));
                    }
                    self.args.clear();
                    self.args.reserve(count.min(64));
                    self.remaining = count;
                    self.state = ParseState::BulkLen;
                }
                ParseState::BulkLen => {
                    let Some(line) = self.read_line(buf)? else {
                        return Ok(None);
                    };
                    match line.first() {
                        Some(b'$') => {}
                        Some(&other) => return Err(RespError::ExpectedBulk(other as char)),
                        None => return Err(RespError::ExpectedBulk(' ')),
                    }
                    let len = parse_usize(&line[1..]).ok_or(RespError::InvalidBulkLength)?;
                    if len > self.max_bulk_len && self.rejected.is_none() {
                        self.rejected = Some(RespError::BulkTooLarge);
                        self.args.clear();
                    }
                    self.bulk_len = len;
                    self.state = if self.rejected.is_some() {
                        ParseState::SkipBulk
                    } else {
                        ParseState::BulkData
                    };
                }
                ParseState::SkipBulk => {
                    let skip = self.bulk_len.min(buf.len());
                    buf.advance(skip);
                    self.bulk_len -= skip;
                    if self.bulk_len > 0 {
                        return Ok(None);
                    }
                    // An empty payload leaves only the CRLF to check.
                    self.state = ParseState::BulkData;
                }
                ParseState::BulkData => {
                    let needed = self.bulk_len.saturating_add(2);
                    if buf.len() < needed {
                        buf.reserve(needed - buf.len());
                        return Ok(None);
                    }
                    let data = buf.split_to(self.bulk_len).freeze();
                    if !buf.starts_with(b"\r\n") {
                        return Err(RespError::MissingCrlf);
                    }
                    buf.advance(2);
                    if self.rejected.is_none() {
                        self.args.push(data);
                    }
                    self.remaining -= 1;
                    if self.remaining > 0 {
                        self.state = ParseState::BulkLen;
                        continue;
                    }
                    self.state = ParseState::ArrayLen;
                    if let Some(err) = self.rejected.take() {
                        return Err(err);
                    }
                    return Ok(Some(std::mem::take(&mut self.args)));
                }
                ParseState::SkipLine => {
                    let Some(newline) = self.find_newline(buf) else {
                        buf.clear();
                        self.scanned = 0;
                        return Ok(None);
                    };
                    buf.advance(newline + 1);
                    self.state = ParseState::ArrayLen;
                    return Err(RespError::InlineTooLong);
                }
            }
        }
    }

    /// Position of the next `\n`, resuming where the last search stopped.
    fn find_newline(&mut self, buf: &BytesMut) -> Option<usize> {
        let from = self.scanned.min(buf.len());
        match buf[from..].iter().position(|&b| b == b'\n') {
            Some(offset) => {
                self.scanned = 0;
                Some(from + offset)
            }
            None => {
                self.scanned = buf.len();
                None
            }
        }
    }

    /// Takes one `*`/`$` header line without its line ending.
    fn read_line(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, RespError> {
        let Some(newline) = self.find_newline(buf) else {
            if buf.len() > MAX_INLINE_LEN {
                return Err(RespError::HeaderTooLong);
            }
            return Ok(None);
        };
        let mut line = buf.split_to(newline);
        buf.advance(1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Ok(Some(line))
    }

    /// Splits one newline-terminated inline request into whitespace
    /// separated args.
    fn parse_inline(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>, RespError> {
        let Some(newline) = self.find_newline(buf) else {
            if buf.len() > MAX_INLINE_LEN {
                buf.clear();
                self.scanned = 0;
                self.state = ParseState::SkipLine;
            }
            return Ok(None);
        };

        let mut line = buf.split_to(newline + 1).freeze();
        if newline > MAX_INLINE_LEN {
            return Err(RespError::InlineTooLong);
        }
        line.truncate(newline);
        if line.last() == Some(&b'\r') {
            line.truncate(newline - 1);
        }

        let mut args = Vec::new();
        let mut start = None;
        for (idx, byte) in line.iter().enumerate() {
            match (byte.is_ascii_whitespace(), start) {
                (false, None) => start = Some(idx),
                (true, Some(from)) => {
                    args.push(line.slice(from..idx));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(from) = start {
            args.push(line.slice(from..));
        }
        Ok(Some(args))
    }
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_usize(data: &[u8]) -> Option<usize> {
    if data.is_empty() {
        return None;
    }
    let mut value: usize = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as usize)?;
    }
    Some(value)
}

/// A RESP2 reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Status reply, e.g. `+OK`.
    Simple(&'static str),
    /// Error reply; the text already carries its prefix (`ERR ...`).
    Error(String),
    /// Integer reply.
    Integer(i64),
    /// Bulk string reply.
    Bulk(Bytes),
    /// Null bulk reply (`$-1`).
    Null,
    /// Array of nested replies.
    Array(Vec<Reply>),
}

impl Reply {
    /// The `+OK` status reply.
    pub const fn ok() -> Self {
        Reply::Simple("OK")
    }

    /// Builds an `ERR` error reply from any displayable message.
    pub fn error(message: impl std::fmt::Display) -> Self {
        Reply::Error(format!("ERR {message}"))
    }

    /// Builds the reply sent when request framing is malformed.
    pub fn protocol_error(err: RespError) -> Self {
        Reply::Error(format!("ERR Protocol error: {err}"))
    }

    /// Appends the wire encoding of the reply to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Reply::Simple(status) => {
                dst.put_u8(b'+');
                dst.put_slice(status.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Error(message) => {
                dst.put_u8(b'-');
                dst.put_slice(message.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Integer(value) => {
                dst.put_u8(b':');
                dst.put_slice(value.to_string().as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Bulk(data) => {
                dst.put_u8(b'$');
                dst.put_slice(data.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Reply::Null => dst.put_slice(b"$-1\r\n"),
            Reply::Array(items) => {
                dst.put_u8(b'*');
                dst.put_slice(items.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                for item in items {
                    item.encode(dst);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(reply: &Reply) -> Vec<u8> {
        let mut dst = BytesMut::new();
        reply.encode(&mut dst);
        dst.to_vec()
    }

    #[test]
    fn parses_simple_get() {
        let mut buf = BytesMut::from("*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
        let mut parser = RespParser::new();
        let cmd = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(cmd.len(), 2);
        assert_eq!(cmd[0], "GET");
        assert_eq!(cmd[1], "key");
        assert!(buf.is_empty());
    }

    #[test]
    fn handles_partial_frames() {
        let mut buf = BytesMut::from("*1\r\n$4\r\nPIN");
        let mut parser = RespParser::new();
        assert!(parser.parse(&mut buf).unwrap().is_none());
        assert!(parser.is_mid_frame());
        buf.extend_from_slice(b"G\r\n");
        let cmd = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(cmd[0], "PING");
        assert!(!parser.is_mid_frame());
    }

    #[test]
    fn split_header_lines_wait_for_crlf() {
        let mut buf = BytesMut::from("*2\r");
        let mut parser = RespParser::new();
        assert!(parser.parse(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\n$4\r\nECHO\r\n$");
        assert!(parser.parse(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"2\r\nhi\r\n");
        let cmd = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(cmd, vec![Bytes::from("ECHO"), Bytes::from("hi")]);
    }

    #[test]
    fn extracts_pipelined_commands_one_at_a_time() {
        let mut buf = BytesMut::from("*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
        let mut parser = RespParser::new();
        assert_eq!(parser.parse(&mut buf).unwrap().unwrap().len(), 1);
        assert_eq!(parser.parse(&mut buf).unwrap().unwrap().len(), 2);
        assert!(parser.parse(&mut buf).unwrap().is_none());
    }

    #[test]
    fn bulk_payloads_are_binary_safe() {
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\na\r\nb\r\n"[..]);
        let mut parser = RespParser::new();
        let cmd = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(cmd[0], &b"a\r\nb"[..]);
    }

    #[test]
    fn parses_inline_commands() {
        let mut buf = BytesMut::from("\r\nSET  key value\r\nPING\n");
        let mut parser = RespParser::new();
        let set = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(set, vec![Bytes::from("SET"), Bytes::from("key"), Bytes::from("value")]);
        let ping = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(ping, vec![Bytes::from("PING")]);
        assert!(parser.parse(&mut buf).unwrap().is_none());
    }

    #[test]
    fn empty_multibulk_is_an_empty_command() {
        let mut buf = BytesMut::from("*0\r\n");
        let mut parser = RespParser::new();
        assert_eq!(parser.parse(&mut buf).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn rejects_malformed_lengths() {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from("*x\r\n");
        assert_eq!(parser.parse(&mut buf), Err(RespError::InvalidMultibulkLength));
        assert!(!parser.is_mid_frame());

        let mut buf = BytesMut::from("*1\r\n$-4\r\n");
        assert_eq!(parser.parse(&mut buf), Err(RespError::InvalidBulkLength));

        let mut buf = BytesMut::from("*1\r\n:4\r\n");
        assert_eq!(parser.parse(&mut buf), Err(RespError::ExpectedBulk(':')));
        assert!(!RespError::ExpectedBulk(':').is_recoverable());
    }

    #[test]
    fn rejects_missing_crlf_after_bulk() {
        let mut buf = BytesMut::from("*1\r\n$2\r\nabXY");
        let mut parser = RespParser::new();
        assert_eq!(parser.parse(&mut buf), Err(RespError::MissingCrlf));
    }

    #[test]
    fn oversized_bulk_skips_the_whole_request() {
        let mut parser = RespParser::with_max_bulk_len(10);
        let mut buf = BytesMut::from("*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$20\r\n");
        assert_eq!(parser.parse(&mut buf), Ok(None));
        assert!(parser.is_mid_frame());

        // The payload looks like requests but belongs to the rejected one.
        buf.extend_from_slice(b"x\r\nFLUSHDB\r\nPI");
        assert_eq!(parser.parse(&mut buf), Ok(None));
        assert!(buf.is_empty());
        buf.extend_from_slice(b"NG\r\n\r\n\r\n*1\r\n$4\r\nPING\r\n");
        assert_eq!(parser.parse(&mut buf), Err(RespError::BulkTooLarge));
        assert!(RespError::BulkTooLarge.is_recoverable());

        let next = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(next, vec![Bytes::from("PING")]);
        assert!(buf.is_empty());
    }

    #[test]
    fn arguments_after_an_oversized_bulk_are_skipped() {
        let mut parser = RespParser::with_max_bulk_len(4);
        let mut buf = BytesMut::from("*3\r\n$5\r\nhello\r\n$3\r\nDEL\r\n$0\r\n\r\nPING\r\n");
        assert_eq!(parser.parse(&mut buf), Err(RespError::BulkTooLarge));
        assert_eq!(parser.parse(&mut buf).unwrap().unwrap(), vec![Bytes::from("PING")]);
    }

    #[test]
    fn misframed_skip_is_fatal() {
        let mut parser = RespParser::with_max_bulk_len(1);
        let mut buf = BytesMut::from("*2\r\n$2\r\nab\r\n!1\r\n");
        assert_eq!(parser.parse(&mut buf), Err(RespError::ExpectedBulk('!')));
        assert!(!parser.is_mid_frame());
    }

    #[test]
    fn oversized_inline_is_skipped_to_its_newline() {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from(vec![b'a'; MAX_INLINE_LEN + 1].as_slice());
        assert_eq!(parser.parse(&mut buf), Ok(None));
        assert!(buf.is_empty());

        buf.extend_from_slice(b"FLUSHDB still the same line\r\nPING\r\n");
        assert_eq!(parser.parse(&mut buf), Err(RespError::InlineTooLong));
        assert_eq!(parser.parse(&mut buf).unwrap().unwrap(), vec![Bytes::from("PING")]);
    }

    #[test]
    fn complete_oversized_inline_is_rejected() {
        let mut line = vec![b'a'; MAX_INLINE_LEN + 1];
        line.extend_from_slice(b"\r\nPING\r\n");
        let mut buf = BytesMut::from(line.as_slice());
        let mut parser = RespParser::new();
        assert_eq!(parser.parse(&mut buf), Err(RespError::InlineTooLong));
        assert_eq!(parser.parse(&mut buf).unwrap().unwrap(), vec![Bytes::from("PING")]);
    }

    #[test]
    fn header_lines_are_bounded() {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from("*1");
        assert_eq!(parser.parse(&mut buf), Ok(None));
        // Arrives in pieces; each call only scans the new bytes.
        for _ in 0..16 {
            buf.extend_from_slice(&[b'1'; 4096]);
            if let Err(err) = parser.parse(&mut buf) {
                assert_eq!(err, RespError::HeaderTooLong);
                assert!(!err.is_recoverable());
                return;
            }
        }
        panic!("header grew past the limit without an error");
    }

    #[test]
    fn bulk_headers_are_bounded() {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from("*1\r\n$");
        buf.extend_from_slice(&[b'9'; MAX_INLINE_LEN + 1]);
        assert_eq!(parser.parse(&mut buf), Err(RespError::HeaderTooLong));
    }

    #[test]
    fn encodes_replies() {
        assert_eq!(encoded(&Reply::ok()), b"+OK\r\n");
        assert_eq!(encoded(&Reply::error("boom")), b"-ERR boom\r\n");
        assert_eq!(encoded(&Reply::Integer(-2)), b":-2\r\n");
        assert_eq!(encoded(&Reply::Bulk(Bytes::from("bar"))), b"$3\r\nbar\r\n");
        assert_eq!(encoded(&Reply::Null), b"$-1\r\n");
        assert_eq!(
            encoded(&Reply::Array(vec![Reply::Integer(1), Reply::Null])),
            b"*2\r\n:1\r\n$-1\r\n"
        );
        assert_eq!(encoded(&Reply::Array(Vec::new())), b"*0\r\n");
    }

    #[test]
    fn protocol_error_wording() {
        let reply = Reply::protocol_error(RespError::InvalidMultibulkLength);
        assert_eq!(encoded(&reply), b"-ERR Protocol error: invalid multibulk length\r\n");
    }
}
