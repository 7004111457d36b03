//! Hand-written memcached ASCII protocol parser
//!
//! A command is complete once its line (up to \r\n) is buffered and, for
//! storage commands, the `<bytes>` data block plus its trailing \r\n.
//! Parsing never copies: keys and data borrow from the input buffer.

use crate::ProtocolError;
use crate::protocol::command::{
    Command, MAX_KEY_LENGTH, MAX_VALUE_LENGTH, StoreVerb, is_valid_key,
};
use std::borrow::Cow;
use std::str::FromStr;

/// Longest command line accepted before a \r\n must appear
pub const MAX_LINE_LENGTH: usize = 2048;

/// Case-insensitive command comparison (avoids allocation from to_ascii_lowercase)
#[inline]
fn cmd_eq(cmd: &[u8], expected: &[u8]) -> bool {
    cmd.len() == expected.len()
        && cmd
            .iter()
            .zip(expected.iter())
            .all(|(a, b)| a.to_ascii_lowercase() == *b)
}

/// Result of parsing
#[derive(Debug)]
pub enum ParseResult<'a> {
    /// Command fully parsed, with the number of bytes it occupied
    Complete(Command<'a>, usize),
    /// Need more data to complete parsing
    NeedMoreData,
    /// Parse error; the offending line should be discarded
    Error(ProtocolError),
}

/// Parse a memcached command from a buffer
pub fn parse(buf: &[u8]) -> ParseResult<'_> {
    let Some(line_end) = find_crlf(buf) else {
        if buf.len() > MAX_LINE_LENGTH {
            return ParseResult::Error(ProtocolError::InvalidCommand(
                "line too long".to_string(),
            ));
        }
        return ParseResult::NeedMoreData;
    };

    match parse_line(buf, line_end) {
        Ok(result) => result,
        Err(e) => ParseResult::Error(e),
    }
}

fn parse_line(buf: &[u8], line_end: usize) -> Result<ParseResult<'_>, ProtocolError> {
    let consumed = line_end + 2;
    let mut parts = buf[..line_end]
        .split(|&b| b == b' ')
        .filter(|part| !part.is_empty());

    let Some(name) = parts.next() else {
        return Err(ProtocolError::InvalidCommand("empty command".to_string()));
    };

    let command = if cmd_eq(name, b"get") {
        parse_get(parts, false)?
    } else if cmd_eq(name, b"gets") {
        parse_get(parts, true)?
    } else if let Some(verb) = StoreVerb::ALL
        .into_iter()
        .find(|verb| cmd_eq(name, verb.as_str().as_bytes()))
    {
        return parse_store(verb, parts, buf, consumed);
    } else if cmd_eq(name, b"delete") {
        parse_delete(parts)?
    } else if cmd_eq(name, b"incr") || cmd_eq(name, b"decr") {
        let key = parse_key(parts.next())?;
        let delta = parts
            .next()
            .and_then(number::<u64>)
            .ok_or(ProtocolError::InvalidNumericValue)?;
        let noreply = parse_noreply(parts.next());
        if cmd_eq(name, b"incr") {
            Command::Incr { key, delta, noreply }
        } else {
            Command::Decr { key, delta, noreply }
        }
    } else if cmd_eq(name, b"flush_all") {
        parse_flush_all(parts)?
    } else if cmd_eq(name, b"stats") {
        let arg = parts.next().unwrap_or_default();
        Command::Stats {
            arg: Cow::Borrowed(arg),
        }
    } else if cmd_eq(name, b"version") {
        Command::Version
    } else if cmd_eq(name, b"verbosity") {
        parts.next().and_then(number::<u32>).ok_or(ProtocolError::InvalidNumericValue)?;
        Command::Verbosity {
            noreply: parse_noreply(parts.next()),
        }
    } else if cmd_eq(name, b"quit") {
        Command::Quit
    } else {
        return Err(ProtocolError::InvalidCommand(
            String::from_utf8_lossy(name).to_string(),
        ));
    };

    Ok(ParseResult::Complete(command, consumed))
}

/// Find \r\n in buffer using SIMD-accelerated search
#[inline]
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    memchr::memmem::find(buf, b"\r\n")
}

fn parse_key(part: Option<&[u8]>) -> Result<Cow<'_, [u8]>, ProtocolError> {
    let key = part.ok_or_else(|| ProtocolError::InvalidCommand("missing key".to_string()))?;
    if !is_valid_key(key) {
        if key.len() > MAX_KEY_LENGTH {
            return Err(ProtocolError::KeyTooLong);
        }
        return Err(ProtocolError::InvalidKey(
            String::from_utf8_lossy(key).to_string(),
        ));
    }
    Ok(Cow::Borrowed(key))
}

fn parse_noreply(part: Option<&[u8]>) -> bool {
    part.is_some_and(|s| s == b"noreply")
}

/// Parse get / gets
fn parse_get<'a>(
    parts: impl Iterator<Item = &'a [u8]>,
    with_cas: bool,
) -> Result<Command<'a>, ProtocolError> {
    let keys = parts
        .map(|part| parse_key(Some(part)))
        .collect::<Result<Vec<_>, _>>()?;

    if keys.is_empty() {
        return Err(ProtocolError::InvalidCommand(
            "get requires at least one key".to_string(),
        ));
    }

    Ok(Command::Get { keys, with_cas })
}

/// Parse a storage command and, if buffered, its data block
fn parse_store<'a>(
    verb: StoreVerb,
    mut parts: impl Iterator<Item = &'a [u8]>,
    buf: &'a [u8],
    data_start: usize,
) -> Result<ParseResult<'a>, ProtocolError> {
    let key = parse_key(parts.next())?;

    let flags = parts
        .next()
        .and_then(number::<u32>)
        .ok_or(ProtocolError::InvalidFlags)?;

    let exptime = parts
        .next()
        .and_then(number::<i64>)
        .ok_or(ProtocolError::InvalidExptime)?;

    let bytes = parts
        .next()
        .and_then(number::<usize>)
        .ok_or(ProtocolError::InvalidBytesLength)?;

    let cas_unique = if verb == StoreVerb::Cas {
        parts
            .next()
            .and_then(number::<u64>)
            .ok_or(ProtocolError::InvalidCasUnique)?
    } else {
        0
    };

    let noreply = parse_noreply(parts.next());

    if bytes > MAX_VALUE_LENGTH {
        return Err(ProtocolError::ValueTooLarge(bytes));
    }

    let data_end = data_start + bytes;
    let total_needed = data_end + 2;
    if buf.len() < total_needed {
        return Ok(ParseResult::NeedMoreData);
    }

    // Verify trailing \r\n
    if &buf[data_end..total_needed] != b"\r\n" {
        return Err(ProtocolError::UnexpectedData);
    }

    let command = Command::Store {
        verb,
        key,
        flags,
        exptime,
        data: Cow::Borrowed(&buf[data_start..data_end]),
        cas_unique,
        noreply,
    };
    Ok(ParseResult::Complete(command, total_needed))
}

/// Parse delete command
/// Format: delete <key> [time] [noreply]\r\n
fn parse_delete<'a>(
    mut parts: impl Iterator<Item = &'a [u8]>,
) -> Result<Command<'a>, ProtocolError> {
    let key = parse_key(parts.next())?;

    let mut hold = 0;
    let mut noreply = false;
    for part in parts {
        if part == b"noreply" {
            noreply = true;
        } else {
            hold = number::<i64>(part).ok_or(ProtocolError::InvalidNumericValue)?;
        }
    }

    Ok(Command::Delete { key, hold, noreply })
}

/// Parse flush_all command
/// Format: flush_all [delay] [noreply]\r\n
fn parse_flush_all<'a>(
    parts: impl Iterator<Item = &'a [u8]>,
) -> Result<Command<'a>, ProtocolError> {
    let mut delay = 0;
    let mut noreply = false;
    for part in parts {
        if part == b"noreply" {
            noreply = true;
        } else {
            delay = number::<i64>(part).ok_or(ProtocolError::InvalidNumericValue)?;
        }
    }
    Ok(Command::FlushAll { delay, noreply })
}

fn number<T: FromStr>(bytes: &[u8]) -> Option<T> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}
