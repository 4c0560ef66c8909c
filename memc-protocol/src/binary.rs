//! Binary protocol engine: 24-byte fixed headers followed by extras/key/value.
//!
//! Parsing uses `nom`'s streaming combinators, the same way the source's binary
//! header parser does: a short header or body reports `Incomplete` rather than an
//! error, so the caller can simply wait for more bytes and retry.

use bytes::{BufMut, BytesMut};
use nom::bytes::streaming::take;
use nom::IResult;

use crate::command::{Command, Op};
use crate::response::Response;

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;
pub const HEADER_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Get,
    Set,
    Add,
    Replace,
    Delete,
    Increment,
    Decrement,
    Quit,
    Flush,
    Version,
    Append,
    Prepend,
    Stat,
    Other(u8),
}

impl Opcode {
    fn from_u8(b: u8) -> Opcode {
        match b {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x05 => Opcode::Increment,
            0x06 => Opcode::Decrement,
            0x07 => Opcode::Quit,
            0x08 => Opcode::Flush,
            0x0B => Opcode::Version,
            0x0E => Opcode::Append,
            0x0F => Opcode::Prepend,
            0x10 => Opcode::Stat,
            other => Opcode::Other(other),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Opcode::Get => 0x00,
            Opcode::Set => 0x01,
            Opcode::Add => 0x02,
            Opcode::Replace => 0x03,
            Opcode::Delete => 0x04,
            Opcode::Increment => 0x05,
            Opcode::Decrement => 0x06,
            Opcode::Quit => 0x07,
            Opcode::Flush => 0x08,
            Opcode::Version => 0x0B,
            Opcode::Append => 0x0E,
            Opcode::Prepend => 0x0F,
            Opcode::Stat => 0x10,
            Opcode::Other(b) => b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    NoError = 0x0000,
    KeyNotFound = 0x0001,
    KeyExists = 0x0002,
    ValueTooLarge = 0x0003,
    InvalidArguments = 0x0004,
    ItemNotStored = 0x0005,
    NonNumericValue = 0x0006,
    UnknownCommand = 0x0081,
    OutOfMemory = 0x0082,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub total_body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], RequestHeader> {
        let (input, raw) = take(HEADER_LEN)(input)?;
        let header = RequestHeader {
            magic: raw[0],
            opcode: raw[1],
            key_len: u16::from_be_bytes([raw[2], raw[3]]),
            extras_len: raw[4],
            total_body_len: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
            opaque: u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]),
            cas: u64::from_be_bytes([
                raw[16], raw[17], raw[18], raw[19], raw[20], raw[21], raw[22], raw[23],
            ]),
        };
        Ok((input, header))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRequest {
    pub header: RequestHeader,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Parses one full binary request (header + body) from `input`.
pub fn parse_request(input: &[u8]) -> IResult<&[u8], BinaryRequest> {
    let (input, header) = RequestHeader::parse(input)?;
    let (input, body) = take(header.total_body_len as usize)(input)?;

    let extras_len = header.extras_len as usize;
    let key_len = header.key_len as usize;
    let extras = body[..extras_len.min(body.len())].to_vec();
    let key_start = extras_len.min(body.len());
    let key_end = (extras_len + key_len).min(body.len());
    let key = body[key_start..key_end].to_vec();
    let value = body[key_end..].to_vec();

    Ok((
        input,
        BinaryRequest {
            header,
            extras,
            key,
            value,
        },
    ))
}

/// Translates a parsed binary request into the dialect-independent [`Command`].
/// `set` requires an 8-byte extras field (4 bytes flags + 4 bytes expiry); a
/// malformed extras length is reported so the caller can reply `InvalidArguments`
/// rather than desynchronizing the connection.
pub fn to_command(req: &BinaryRequest) -> Result<Command, Status> {
    let opcode = Opcode::from_u8(req.header.opcode);
    let op = match opcode {
        Opcode::Get => Op::Get,
        Opcode::Set => Op::Set,
        Opcode::Quit => Op::Quit,
        Opcode::Version => Op::Version,
        _ => Op::Unsupported,
    };

    let mut cmd = Command::new(op);
    cmd.opaque = Some(req.header.opaque);
    cmd.cas = req.header.cas;
    if !req.key.is_empty() {
        cmd.keys.push(req.key.clone());
    }

    if op == Op::Set {
        if req.extras.len() != 8 {
            return Err(Status::InvalidArguments);
        }
        cmd.flags = u32::from_be_bytes(req.extras[0..4].try_into().unwrap());
        cmd.exptime = u32::from_be_bytes(req.extras[4..8].try_into().unwrap());
        cmd.body = req.value.clone();
    }

    Ok(cmd)
}

/// Writes one full 24-byte-header response frame into `buf`.
pub fn compose_header(
    opcode: Opcode,
    status: Status,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
    buf: &mut BytesMut,
) {
    let total_body = extras.len() + key.len() + value.len();
    buf.put_u8(MAGIC_RESPONSE);
    buf.put_u8(opcode.as_u8());
    buf.put_u16(key.len() as u16);
    buf.put_u8(extras.len() as u8);
    buf.put_u8(0); // data type, always 0
    buf.put_u16(status as u16);
    buf.put_u32(total_body as u32);
    buf.put_u32(opaque);
    buf.put_u64(cas);
    buf.put_slice(extras);
    buf.put_slice(key);
    buf.put_slice(value);
}

/// Composes the binary reply for `response` to a request with opcode `opcode` and
/// `opaque`, which is always echoed unchanged.
pub fn compose_response(opcode_byte: u8, opaque: u32, response: &Response, buf: &mut BytesMut) {
    let opcode = Opcode::from_u8(opcode_byte);
    match response {
        Response::Stored => compose_header(opcode, Status::NoError, opaque, 0, &[], &[], &[], buf),
        Response::NotStored => {
            compose_header(opcode, Status::ItemNotStored, opaque, 0, &[], &[], &[], buf)
        }
        Response::NotFound => {
            compose_header(opcode, Status::KeyNotFound, opaque, 0, &[], &[], &[], buf)
        }
        Response::Values(values) => {
            if let Some(v) = values.first() {
                let extras = v.flags.to_be_bytes();
                compose_header(opcode, Status::NoError, opaque, 0, &extras, &[], &v.body, buf);
            } else {
                compose_header(opcode, Status::KeyNotFound, opaque, 0, &[], &[], &[], buf);
            }
        }
        Response::Version(v) => {
            compose_header(opcode, Status::NoError, opaque, 0, &[], &[], v.as_bytes(), buf);
        }
        // `quit` replies once with NoError before the connection closes.
        Response::Hangup => compose_header(opcode, Status::NoError, opaque, 0, &[], &[], &[], buf),
        _ => compose_header(opcode, Status::UnknownCommand, opaque, 0, &[], &[], &[], buf),
    }
}

/// Composes an error reply for a request that never made it to a [`Command`]
/// (an unrecognized opcode, or a `set` with malformed extras).
pub fn compose_status(opcode_byte: u8, opaque: u32, status: Status, buf: &mut BytesMut) {
    compose_header(Opcode::from_u8(opcode_byte), status, opaque, 0, &[], &[], &[], buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_request(key: &[u8], value: &[u8], flags: u32, exptime: u32, opaque: u32) -> Vec<u8> {
        let mut extras = Vec::new();
        extras.extend_from_slice(&flags.to_be_bytes());
        extras.extend_from_slice(&exptime.to_be_bytes());
        let total_body = extras.len() + key.len() + value.len();

        let mut buf = Vec::new();
        buf.push(MAGIC_REQUEST);
        buf.push(Opcode::Set.as_u8());
        buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
        buf.push(extras.len() as u8);
        buf.push(0);
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&(total_body as u32).to_be_bytes());
        buf.extend_from_slice(&opaque.to_be_bytes());
        buf.extend_from_slice(&0u64.to_be_bytes());
        buf.extend_from_slice(&extras);
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        buf
    }

    #[test]
    fn parse_set_request_roundtrip() {
        let bytes = set_request(b"x", b"vv", 42, 0, 0x11223344);
        let (rest, req) = parse_request(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(req.key, b"x");
        assert_eq!(req.value, b"vv");
        assert_eq!(req.header.opaque, 0x11223344);

        let cmd = to_command(&req).unwrap();
        assert_eq!(cmd.op, Op::Set);
        assert_eq!(cmd.flags, 42);
        assert_eq!(cmd.exptime, 0);
        assert_eq!(cmd.body, b"vv");
    }

    #[test]
    fn incomplete_header_reports_incomplete() {
        let bytes = &set_request(b"x", b"vv", 0, 0, 0)[..10];
        assert!(parse_request(bytes).unwrap_err().is_incomplete());
    }

    #[test]
    fn get_miss_reports_key_not_found() {
        let mut buf = BytesMut::new();
        compose_response(Opcode::Get.as_u8(), 0, &Response::Values(vec![]), &mut buf);
        assert_eq!(
            u16::from_be_bytes([buf[6], buf[7]]),
            Status::KeyNotFound as u16
        );
        let total_body = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        assert_eq!(total_body, 0);
    }

    #[test]
    fn version_opcode_replies_with_version_string() {
        let mut buf = BytesMut::new();
        compose_response(
            Opcode::Version.as_u8(),
            0x42,
            &Response::Version("1.4.17".to_string()),
            &mut buf,
        );
        assert_eq!(buf[1], Opcode::Version.as_u8());
        assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), Status::NoError as u16);
        let total_body = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        assert_eq!(&buf[HEADER_LEN..HEADER_LEN + total_body], b"1.4.17");
    }

    #[test]
    fn opaque_echoed_in_response() {
        let mut buf = BytesMut::new();
        compose_response(
            Opcode::Set.as_u8(),
            0xdead_beef,
            &Response::Stored,
            &mut buf,
        );
        let opaque = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        assert_eq!(opaque, 0xdead_beef);
        assert_eq!(buf[0], MAGIC_RESPONSE);
        assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), Status::NoError as u16);
    }
}
