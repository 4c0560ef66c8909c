//! Text protocol engine: frames commands out of a byte stream and renders replies.
//!
//! Header parsing mirrors the two-regex shape used throughout the memcached text
//! protocol: a "storage" form (`set key flags exptime bytes [noreply]`) that is
//! followed by an exact-length body, and a "retrieval" form (`get key...`, `delete
//! key`, `quit`, ...) that carries no body. Parsing is built on `nom`'s streaming
//! combinators, the same way the source's per-command parsers (`_parse_set_request`,
//! `_parse_get_request`) are: `space1`/`take`/`tag` report `Incomplete` rather than
//! an error when the buffer simply hasn't filled up yet, so the caller can read more
//! and retry the whole parse.

use bytes::{BufMut, BytesMut};
use nom::branch::alt;
use nom::bytes::streaming::{is_not, tag, take, take_until};
use nom::character::streaming::{digit1, space0, space1};
use nom::combinator::{map_res, opt};
use nom::sequence::preceded;
use nom::IResult;

use crate::command::{Command, Op};
use crate::response::{Response, Value};

/// Maximum key length memcached clients are expected to honor.
pub const MAX_KEY_LEN: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Not enough bytes buffered yet; caller should read more and retry.
    #[error("incomplete command")]
    Incomplete,
}

/// Attempts to parse one command from the front of `input`.
///
/// On success, returns the command and the number of bytes consumed from `input`
/// that the caller should advance its read buffer past. A malformed header or
/// storage body of declared length zero does not return an error: it advances past
/// the offending line and yields `Op::Malformed`, so the engine can reply `ERROR`
/// and keep the connection open, matching memcached's tolerant framing. Verbs are
/// matched case-sensitively, in line with the protocol's `^([a-z]+)...` grammar —
/// an uppercase verb is simply an unrecognized command.
pub fn parse_command(input: &[u8]) -> Result<(Command, usize), ParseError> {
    match parse_command_nom(input) {
        Ok((rest, cmd)) => Ok((cmd, input.len() - rest.len())),
        Err(nom::Err::Incomplete(_)) => Err(ParseError::Incomplete),
        // `parse_unknown` is a total fallback: it matches any line that reaches a
        // newline and only ever reports `Incomplete` otherwise, so every other
        // outcome has already been resolved by the time `alt` would give up.
        Err(_) => unreachable!("parse_unknown covers every non-incomplete line"),
    }
}

fn parse_command_nom(input: &[u8]) -> IResult<&[u8], Command> {
    alt((
        parse_set,
        parse_add,
        parse_replace,
        parse_append,
        parse_prepend,
        parse_get,
        parse_delete,
        parse_touch,
        parse_quit,
        parse_stats,
        parse_version,
        parse_unknown,
    ))(input)
}

fn terminator(input: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((tag("\r\n"), tag("\n")))(input)
}

fn key(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (rest, k) = is_not(" \r\n")(input)?;
    if k.len() > MAX_KEY_LEN {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::TooLarge,
        )));
    }
    Ok((rest, k))
}

fn parse_u32(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(map_res(digit1, std::str::from_utf8), |s: &str| {
        s.parse::<u32>()
    })(input)
}

fn parse_usize(input: &[u8]) -> IResult<&[u8], usize> {
    map_res(map_res(digit1, std::str::from_utf8), |s: &str| {
        s.parse::<usize>()
    })(input)
}

fn noreply(input: &[u8]) -> IResult<&[u8], bool> {
    let (input, flag) = opt(preceded(space1, tag("noreply")))(input)?;
    Ok((input, flag.is_some()))
}

/// Shared body for `set`/`add`/`replace`/`append`/`prepend`: `verb key flags exptime
/// bytes [noreply]\r\n` followed by exactly `bytes` octets and a terminator. A
/// declared length of zero is accepted as a line but yields a malformed command,
/// since there is no body to read.
fn parse_storage(verb: &'static [u8], op: Op, input: &[u8]) -> IResult<&[u8], Command> {
    let (input, _) = tag(verb)(input)?;
    let (input, _) = space1(input)?;
    let (input, k) = key(input)?;
    let (input, _) = space1(input)?;
    let (input, flags) = parse_u32(input)?;
    let (input, _) = space1(input)?;
    let (input, exptime) = parse_u32(input)?;
    let (input, _) = space1(input)?;
    let (input, bytes) = parse_usize(input)?;
    let (input, noreply) = noreply(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = terminator(input)?;

    if bytes == 0 {
        return Ok((input, Command::malformed()));
    }

    let (input, body) = take(bytes)(input)?;
    let (input, _) = terminator(input)?;

    let mut cmd = Command::new(op);
    cmd.keys.push(k.to_vec());
    cmd.flags = flags;
    cmd.exptime = exptime;
    cmd.noreply = noreply;
    cmd.body = body.to_vec();
    Ok((input, cmd))
}

fn parse_set(input: &[u8]) -> IResult<&[u8], Command> {
    parse_storage(b"set", Op::Set, input)
}

fn parse_add(input: &[u8]) -> IResult<&[u8], Command> {
    parse_storage(b"add", Op::Add, input)
}

fn parse_replace(input: &[u8]) -> IResult<&[u8], Command> {
    parse_storage(b"replace", Op::Replace, input)
}

fn parse_append(input: &[u8]) -> IResult<&[u8], Command> {
    parse_storage(b"append", Op::Append, input)
}

fn parse_prepend(input: &[u8]) -> IResult<&[u8], Command> {
    parse_storage(b"prepend", Op::Prepend, input)
}

/// `get`/`gets key [key...]\r\n`, requiring at least one key.
fn parse_get(input: &[u8]) -> IResult<&[u8], Command> {
    let (mut input, _) = alt((tag("gets"), tag("get")))(input)?;
    let (i, _) = space1(input)?;
    input = i;

    let mut keys = Vec::new();
    loop {
        let (i, k) = key(input)?;
        keys.push(k.to_vec());
        match space1(i) {
            Ok((i2, _)) => input = i2,
            Err(nom::Err::Incomplete(needed)) => return Err(nom::Err::Incomplete(needed)),
            Err(_) => {
                input = i;
                break;
            }
        }
    }

    if keys.is_empty() {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Many1,
        )));
    }

    let (input, _) = space0(input)?;
    let (input, _) = terminator(input)?;

    let mut cmd = Command::new(Op::Get);
    cmd.keys = keys;
    Ok((input, cmd))
}

fn parse_delete(input: &[u8]) -> IResult<&[u8], Command> {
    let (input, _) = tag("delete")(input)?;
    let (input, _) = space1(input)?;
    let (input, k) = key(input)?;
    let (input, noreply) = noreply(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = terminator(input)?;

    let mut cmd = Command::new(Op::Delete);
    cmd.keys.push(k.to_vec());
    cmd.noreply = noreply;
    Ok((input, cmd))
}

fn parse_touch(input: &[u8]) -> IResult<&[u8], Command> {
    let (input, _) = tag("touch")(input)?;
    let (input, _) = space1(input)?;
    let (input, k) = key(input)?;
    let (input, _) = space1(input)?;
    let (input, exptime) = parse_u32(input)?;
    let (input, noreply) = noreply(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = terminator(input)?;

    let mut cmd = Command::new(Op::Touch);
    cmd.keys.push(k.to_vec());
    cmd.exptime = exptime;
    cmd.noreply = noreply;
    Ok((input, cmd))
}

fn parse_quit(input: &[u8]) -> IResult<&[u8], Command> {
    let (input, _) = tag("quit")(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = terminator(input)?;
    Ok((input, Command::new(Op::Quit)))
}

fn parse_stats(input: &[u8]) -> IResult<&[u8], Command> {
    let (input, _) = tag("stats")(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = terminator(input)?;
    Ok((input, Command::new(Op::Stats)))
}

fn parse_version(input: &[u8]) -> IResult<&[u8], Command> {
    let (input, _) = tag("version")(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = terminator(input)?;
    Ok((input, Command::new(Op::Version)))
}

/// Catches any line that didn't match a known verb and consumes it wholesale, so
/// the connection advances past it instead of wedging on unrecognized input.
fn parse_unknown(input: &[u8]) -> IResult<&[u8], Command> {
    let (input, _) = take_until(&b"\n"[..])(input)?;
    let (input, _) = tag("\n")(input)?;
    Ok((input, Command::malformed()))
}

/// Renders `response` into `buf` as memcached text-protocol bytes.
pub fn compose_response(response: &Response, buf: &mut BytesMut) {
    match response {
        Response::Stored => buf.put_slice(b"STORED\r\n"),
        Response::NotStored => buf.put_slice(b"NOT_STORED\r\n"),
        Response::Deleted => buf.put_slice(b"DELETED\r\n"),
        Response::NotFound => buf.put_slice(b"NOT_FOUND\r\n"),
        Response::Touched => buf.put_slice(b"TOUCHED\r\n"),
        Response::Error => buf.put_slice(b"ERROR\r\n"),
        Response::Version(v) => {
            buf.put_slice(b"VERSION ");
            buf.put_slice(v.as_bytes());
            buf.put_slice(b"\r\n");
        }
        Response::Values(values) => {
            for v in values {
                compose_value(v, buf);
            }
            buf.put_slice(b"END\r\n");
        }
        Response::Stats(pairs) => {
            for (k, v) in pairs {
                buf.put_slice(b"STAT ");
                buf.put_slice(k.as_bytes());
                buf.put_slice(b" ");
                buf.put_slice(v.as_bytes());
                buf.put_slice(b"\r\n");
            }
            buf.put_slice(b"END\r\n");
        }
        Response::Hangup => {}
    }
}

fn compose_value(v: &Value, buf: &mut BytesMut) {
    buf.put_slice(b"VALUE ");
    buf.put_slice(&v.key);
    buf.put_slice(format!(" {} {}\r\n", v.flags, v.body.len()).as_bytes());
    buf.put_slice(&v.body);
    buf.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_set_basic() {
        let (cmd, n) = parse_command(b"set foo 0 0 5\r\nhello\r\n").unwrap();
        assert_eq!(cmd.op, Op::Set);
        assert_eq!(cmd.key(), b"foo");
        assert_eq!(cmd.body, b"hello");
        assert!(!cmd.noreply);
        assert_eq!(n, b"set foo 0 0 5\r\nhello\r\n".len());
    }

    #[test]
    fn parse_set_noreply() {
        let (cmd, _) = parse_command(b"set foo 0 0 5 noreply\r\nhello\r\n").unwrap();
        assert!(cmd.noreply);
    }

    #[test]
    fn incomplete_header() {
        assert_eq!(parse_command(b"set foo 0 0 5"), Err(ParseError::Incomplete));
    }

    #[test]
    fn incomplete_body() {
        assert_eq!(
            parse_command(b"set foo 0 0 5\r\nhel"),
            Err(ParseError::Incomplete)
        );
    }

    #[test]
    fn get_multi_key() {
        let (cmd, _) = parse_command(b"get a b c\r\n").unwrap();
        assert_eq!(cmd.op, Op::Get);
        assert_eq!(cmd.keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn get_trailing_spaces_tolerated() {
        let (a, _) = parse_command(b"get key\r\n").unwrap();
        let (b, _) = parse_command(b"get key   \r\n").unwrap();
        assert_eq!(a.keys, b.keys);
    }

    #[test]
    fn uppercase_verb_is_unrecognized() {
        // The wire grammar is case-sensitive; "GET" is simply not a known verb.
        let (cmd, n) = parse_command(b"GET key\r\n").unwrap();
        assert_eq!(cmd.op, Op::Malformed);
        assert_eq!(n, b"GET key\r\n".len());
    }

    #[test]
    fn key_is_binary_safe() {
        let (cmd, _) = parse_command(b"get evil\0key\r\n").unwrap();
        assert_eq!(cmd.keys, vec![b"evil\0key".to_vec()]);
    }

    #[test]
    fn unknown_command_is_malformed() {
        let (cmd, n) = parse_command(b"frobnicate\r\n").unwrap();
        assert_eq!(cmd.op, Op::Malformed);
        assert_eq!(n, b"frobnicate\r\n".len());
    }

    #[test]
    fn zero_byte_storage_is_malformed() {
        let (cmd, _) = parse_command(b"set foo 0 0 0\r\n").unwrap();
        assert_eq!(cmd.op, Op::Malformed);
    }

    #[test]
    fn touch_parses_exptime() {
        let (cmd, _) = parse_command(b"touch foo 100\r\n").unwrap();
        assert_eq!(cmd.op, Op::Touch);
        assert_eq!(cmd.exptime, 100);
    }

    #[test]
    fn bare_lf_terminator_accepted() {
        let (cmd, n) = parse_command(b"get foo\n").unwrap();
        assert_eq!(cmd.op, Op::Get);
        assert_eq!(n, b"get foo\n".len());
    }

    #[test]
    fn compose_values_then_end() {
        let mut buf = BytesMut::new();
        compose_response(
            &Response::Values(vec![Value {
                key: b"foo".to_vec(),
                flags: 0,
                body: b"hello".to_vec(),
            }]),
            &mut buf,
        );
        assert_eq!(&buf[..], b"VALUE foo 0 5\r\nhello\r\nEND\r\n");
    }
}
