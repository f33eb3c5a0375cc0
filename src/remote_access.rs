//! Header asking a peer to perform a one-sided operation on the sender's memory.
//!
//! ```text
//! text:   <tag> ' ' <addr> ' ' <rkey> ' ' <len> '\n' <command...>
//! binary: <tag> <addr: u64 le> <rkey: u32 le> <len: u64 le> <command...>
//! ```
//!
//! | tag  | operation                   | encoding |
//! |------|-----------------------------|----------|
//! | 0x88 | peer should read from me    | text     |
//! | 0x89 | peer should write into me   | text     |
//! | 0x98 | peer should read from me    | binary   |
//! | 0x99 | peer should write into me   | binary   |

use crate::{
    error::{Error, Result},
    memory_region::RemoteDescriptor,
};
use std::str;

/// Tag of a text-encoded "read from me" header
pub(crate) const TAG_READ_TEXT: u8 = 0x88;
/// Tag of a text-encoded "write into me" header
pub(crate) const TAG_WRITE_TEXT: u8 = 0x89;
/// Set on the tag of binary-encoded headers
const BINARY_FLAG: u8 = 0x10;
/// Length of a binary descriptor
const BINARY_DESCRIPTOR_LEN: usize = 20;
/// The text descriptor must end within this many bytes of the tag
const MAX_TEXT_DESCRIPTOR_LEN: usize = 64;
/// Largest region a peer may ask for
const MAX_REMOTE_LEN: u64 = 1 << 30;
/// Number of leading bytes shown when a header is rejected
const DUMP_LEN: usize = 32;

/// What the peer is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    /// The peer reads the described region
    ReadFromMe,
    /// The peer writes into the described region
    WriteIntoMe,
}

/// How the descriptor is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderEncoding {
    /// Space-separated decimal fields ended by a newline
    Text,
    /// Fixed-width little-endian fields
    Binary,
}

/// A parsed remote-access header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAccessHeader<'a> {
    /// Requested operation
    pub op: RemoteOp,
    /// Descriptor encoding
    pub encoding: HeaderEncoding,
    /// Region of the sender
    pub remote: RemoteDescriptor,
    /// Command text following the descriptor
    pub command: &'a [u8],
}

/// Map a tag byte onto operation and encoding
fn classify(tag: u8) -> Option<(RemoteOp, HeaderEncoding)> {
    let encoding = if tag & BINARY_FLAG == 0 {
        HeaderEncoding::Text
    } else {
        HeaderEncoding::Binary
    };
    match tag & !BINARY_FLAG {
        TAG_READ_TEXT => Some((RemoteOp::ReadFromMe, encoding)),
        TAG_WRITE_TEXT => Some((RemoteOp::WriteIntoMe, encoding)),
        _ => None,
    }
}

/// Build the tag byte
const fn tag_of(op: RemoteOp, encoding: HeaderEncoding) -> u8 {
    let tag = match op {
        RemoteOp::ReadFromMe => TAG_READ_TEXT,
        RemoteOp::WriteIntoMe => TAG_WRITE_TEXT,
    };
    match encoding {
        HeaderEncoding::Text => tag,
        HeaderEncoding::Binary => tag | BINARY_FLAG,
    }
}

/// Protocol error carrying a dump of the offending message head
fn malformed(data: &[u8], why: &str) -> Error {
    Error::protocol(format!(
        "malformed remote-access header ({why}): {}",
        hex::encode(&data[..data.len().min(DUMP_LEN)])
    ))
}

/// Whether `data` starts with a remote-access tag
#[inline]
#[must_use]
pub fn is_remote_access(data: &[u8]) -> bool {
    data.first().map_or(false, |&tag| classify(tag).is_some())
}

impl<'a> RemoteAccessHeader<'a> {
    /// Parse a received message.
    ///
    /// Returns `Ok(None)` for messages that carry no remote-access tag. Never relies on a
    /// terminating NUL: every field is bounds- and range-checked.
    pub fn parse(data: &'a [u8]) -> Result<Option<Self>> {
        let (op, encoding) = match data.first().copied().and_then(classify) {
            Some(found) => found,
            None => return Ok(None),
        };
        let (remote, command) = match encoding {
            HeaderEncoding::Text => Self::parse_text(data)?,
            HeaderEncoding::Binary => Self::parse_binary(data)?,
        };
        if remote.len == 0 {
            return Err(malformed(data, "empty region"));
        }
        if remote.len > MAX_REMOTE_LEN {
            return Err(malformed(data, "region too large"));
        }
        if remote.addr.checked_add(remote.len).is_none() {
            return Err(malformed(data, "region wraps around"));
        }
        Ok(Some(Self {
            op,
            encoding,
            remote,
            command,
        }))
    }

    /// Text descriptor: `" {addr} {rkey} {len}\n"`
    fn parse_text(data: &'a [u8]) -> Result<(RemoteDescriptor, &'a [u8])> {
        let body = &data[1..];
        let window = &body[..body.len().min(MAX_TEXT_DESCRIPTOR_LEN)];
        let end = window
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| malformed(data, "descriptor not terminated"))?;
        let text = str::from_utf8(&body[..end]).map_err(|_e| malformed(data, "descriptor not ascii"))?;
        if !text.starts_with(' ') {
            return Err(malformed(data, "missing separator after tag"));
        }
        let mut fields = text.split_ascii_whitespace();
        let mut next_field = |name: &str| {
            fields
                .next()
                .ok_or_else(|| malformed(data, &format!("missing {name}")))
        };
        let addr = next_field("addr")?
            .parse::<u64>()
            .map_err(|_e| malformed(data, "bad addr"))?;
        let rkey = next_field("rkey")?
            .parse::<u32>()
            .map_err(|_e| malformed(data, "bad rkey"))?;
        let len = next_field("len")?
            .parse::<u64>()
            .map_err(|_e| malformed(data, "bad len"))?;
        if fields.next().is_some() {
            return Err(malformed(data, "trailing descriptor fields"));
        }
        Ok((RemoteDescriptor { addr, rkey, len }, &body[end.saturating_add(1)..]))
    }

    /// Binary descriptor: 20 bytes of `bincode`
    fn parse_binary(data: &'a [u8]) -> Result<(RemoteDescriptor, &'a [u8])> {
        let end = BINARY_DESCRIPTOR_LEN.saturating_add(1);
        if data.len() < end {
            return Err(malformed(data, "short binary descriptor"));
        }
        let remote: RemoteDescriptor =
            bincode::deserialize(&data[1..end]).map_err(|e| malformed(data, &e.to_string()))?;
        Ok((remote, &data[end..]))
    }

    /// Encode a header followed by `command`
    pub fn encode(
        op: RemoteOp,
        encoding: HeaderEncoding,
        remote: &RemoteDescriptor,
        command: &[u8],
    ) -> Result<Vec<u8>> {
        let mut out = vec![tag_of(op, encoding)];
        match encoding {
            HeaderEncoding::Text => {
                out.extend_from_slice(format!(" {} {} {}\n", remote.addr, remote.rkey, remote.len).as_bytes());
            }
            HeaderEncoding::Binary => {
                let descriptor = bincode::serialize(remote)
                    .map_err(|e| Error::protocol(format!("failed to encode descriptor: {e}")))?;
                out.extend_from_slice(&descriptor);
            }
        }
        out.extend_from_slice(command);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    const REMOTE: RemoteDescriptor = RemoteDescriptor {
        addr: 140_737_488_355_328,
        rkey: 4660,
        len: 100_000,
    };

    #[test]
    fn text_header_as_the_benchmark_client_writes_it() {
        let mut msg = vec![0x88_u8];
        msg.extend_from_slice(b" 140737488355328 4660 100000\nget foo\r\n");
        let header = RemoteAccessHeader::parse(&msg).unwrap().unwrap();
        assert_eq!(header.op, RemoteOp::ReadFromMe);
        assert_eq!(header.encoding, HeaderEncoding::Text);
        assert_eq!(header.remote, REMOTE);
        assert_eq!(header.command, b"get foo\r\n");
    }

    #[test]
    fn encode_then_parse_every_tag() {
        for op in [RemoteOp::ReadFromMe, RemoteOp::WriteIntoMe] {
            for encoding in [HeaderEncoding::Text, HeaderEncoding::Binary] {
                let msg = RemoteAccessHeader::encode(op, encoding, &REMOTE, b"set k 0 0 1\r\n").unwrap();
                assert!(is_remote_access(&msg));
                let header = RemoteAccessHeader::parse(&msg).unwrap().unwrap();
                assert_eq!((header.op, header.encoding), (op, encoding));
                assert_eq!(header.remote, REMOTE);
                assert_eq!(header.command, b"set k 0 0 1\r\n");
            }
        }
        let binary = RemoteAccessHeader::encode(RemoteOp::WriteIntoMe, HeaderEncoding::Binary, &REMOTE, b"").unwrap();
        assert_eq!(binary[0], 0x99);
        assert_eq!(binary.len(), 21);
    }

    #[test]
    fn plain_commands_are_not_headers() {
        assert_eq!(RemoteAccessHeader::parse(b"get foo\r\n").unwrap(), None);
        assert_eq!(RemoteAccessHeader::parse(b"").unwrap(), None);
        assert!(!is_remote_access(b"\x87 1 2 3\n"));
    }

    #[test]
    fn malformed_headers_are_protocol_errors() {
        let cases: [&[u8]; 8] = [
            b"\x88 1 2 3",                   // no newline
            b"\x88 1 2\n",                   // missing len
            b"\x88 1 2 3 4\n",               // extra field
            b"\x88 x 2 3\n",                 // not a number
            b"\x88 1 4294967296 3\n",        // rkey overflow
            b"\x881 2 3\n",                  // no separator
            b"\x88 1 2 0\n",                 // empty region
            b"\x98\x01\x02\x03",             // short binary descriptor
        ];
        for case in cases {
            let err = RemoteAccessHeader::parse(case).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Protocol, "{:?}", case);
        }
        // a newline beyond the window does not count
        let mut long = vec![0x88_u8, b' '];
        long.extend(std::iter::repeat(b'1').take(100));
        long.push(b'\n');
        assert_eq!(RemoteAccessHeader::parse(&long).unwrap_err().kind(), ErrorKind::Protocol);
    }
}
