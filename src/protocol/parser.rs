//! RESP protocol parser
//!
//! Streaming parser: feed a `BytesMut` read buffer, get back a complete
//! frame once enough bytes have arrived. The buffer is only consumed when
//! a whole frame is available.

use bytes::{Buf, Bytes, BytesMut};

use super::Frame;

/// Maximum bulk string size accepted from the wire (matches Redis'
/// proto-max-bulk-len default).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Maximum number of elements in an array.
const MAX_ARRAY_LEN: i64 = 1_048_576;

/// Maximum nesting depth for arrays.
const MAX_DEPTH: usize = 32;

/// Parse error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    /// Not enough data to parse a complete frame
    #[error("incomplete data")]
    Incomplete,

    /// Invalid protocol format
    #[error("invalid protocol: {0}")]
    Invalid(String),

    /// Frame exceeds configured size limits
    #[error("frame too large: {0}")]
    FrameTooLarge(String),
}

/// Parse a RESP frame from the buffer.
///
/// Returns `Ok(Some(frame))` if a complete frame was parsed (the bytes are
/// consumed from `buf`), `Ok(None)` if more data is needed, or `Err` if
/// the data is invalid.
pub fn parse_frame(buf: &mut BytesMut) -> Result<Option<Frame>, ParseError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut pos = 0usize;
    match parse_at(&buf[..], &mut pos, 0) {
        Ok(frame) => {
            buf.advance(pos);
            Ok(Some(frame))
        }
        Err(ParseError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

fn parse_at(buf: &[u8], pos: &mut usize, depth: usize) -> Result<Frame, ParseError> {
    if depth > MAX_DEPTH {
        return Err(ParseError::FrameTooLarge(format!(
            "nesting depth exceeds {MAX_DEPTH}"
        )));
    }

    let kind = *buf.get(*pos).ok_or(ParseError::Incomplete)?;
    *pos += 1;

    match kind {
        b'+' => Ok(Frame::Simple(read_line(buf, pos)?)),
        b'-' => Ok(Frame::Error(read_line(buf, pos)?)),
        b':' => {
            let line = read_line(buf, pos)?;
            Ok(Frame::Integer(parse_int(&line)?))
        }
        b'$' => {
            let line = read_line(buf, pos)?;
            let len = parse_int(&line)?;
            if len == -1 {
                return Ok(Frame::Bulk(None));
            }
            if len < 0 {
                return Err(ParseError::Invalid("negative bulk string length".into()));
            }
            if len > MAX_BULK_LEN {
                return Err(ParseError::FrameTooLarge(format!(
                    "bulk string size {len} exceeds limit {MAX_BULK_LEN}"
                )));
            }
            let len = len as usize;
            if buf.len() < *pos + len + 2 {
                return Err(ParseError::Incomplete);
            }
            let data = Bytes::copy_from_slice(&buf[*pos..*pos + len]);
            if &buf[*pos + len..*pos + len + 2] != b"\r\n" {
                return Err(ParseError::Invalid("expected CRLF after bulk string".into()));
            }
            *pos += len + 2;
            Ok(Frame::Bulk(Some(data)))
        }
        b'*' => {
            let line = read_line(buf, pos)?;
            let len = parse_int(&line)?;
            if len == -1 {
                return Ok(Frame::Array(None));
            }
            if len < 0 {
                return Err(ParseError::Invalid("negative array length".into()));
            }
            if len > MAX_ARRAY_LEN {
                return Err(ParseError::FrameTooLarge(format!(
                    "array element count {len} exceeds limit {MAX_ARRAY_LEN}"
                )));
            }
            let mut frames = Vec::with_capacity(len as usize);
            for _ in 0..len {
                frames.push(parse_at(buf, pos, depth + 1)?);
            }
            Ok(Frame::Array(Some(frames)))
        }
        other => Err(ParseError::Invalid(format!("unexpected byte: {other:02x}"))),
    }
}

/// Read up to (and consuming) the next CRLF, returning the line content.
fn read_line(buf: &[u8], pos: &mut usize) -> Result<Bytes, ParseError> {
    let rest = &buf[*pos..];
    for i in 0..rest.len().saturating_sub(1) {
        if rest[i] == b'\r' && rest[i + 1] == b'\n' {
            let line = Bytes::copy_from_slice(&rest[..i]);
            *pos += i + 2;
            return Ok(line);
        }
    }
    Err(ParseError::Incomplete)
}

fn parse_int(line: &[u8]) -> Result<i64, ParseError> {
    let s = std::str::from_utf8(line)
        .map_err(|_| ParseError::Invalid("non-UTF-8 integer".into()))?;
    s.parse::<i64>()
        .map_err(|_| ParseError::Invalid(format!("invalid integer: {s}")))
}
