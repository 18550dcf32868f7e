//! Replicated payload codecs
//!
//! Two fixed formats travel inside log entry payloads and must be
//! byte-exact on the wire and on disk, little-endian regardless of host:
//!
//! ```text
//! command:    u64 argc | repeat argc: u64 len, bytes[len]
//! cfg change: u32 id | u16 port | u64 host_len, host bytes
//! ```
//!
//! Encoding uses explicit little-endian conversions, so big-endian hosts
//! produce the same bytes (the swap happens in `put_*_le`/`get_*_le`).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::{NodeAddress, NodeId};

/// Errors produced when decoding a replicated payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    /// The buffer ended before the declared lengths were satisfied.
    #[error("truncated payload: need {needed} more bytes")]
    Truncated {
        /// How many bytes were missing at the point of failure.
        needed: usize,
    },

    /// The buffer has bytes left over after the declared content.
    #[error("trailing garbage: {0} unexpected bytes")]
    TrailingBytes(usize),

    /// A declared length does not fit in memory addressing.
    #[error("declared length {0} is implausible")]
    BadLength(u64),

    /// The membership payload's host is not valid UTF-8.
    #[error("invalid host string")]
    BadHost,
}

/// Serialize a command argv into an entry payload buffer.
pub fn encode_command(argv: &[Bytes]) -> Bytes {
    let total = 8 + argv.iter().map(|a| 8 + a.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u64_le(argv.len() as u64);
    for arg in argv {
        buf.put_u64_le(arg.len() as u64);
        buf.put_slice(arg);
    }
    buf.freeze()
}

/// Deserialize a command argv from an entry payload buffer.
pub fn decode_command(mut buf: &[u8]) -> Result<Vec<Bytes>, CodecError> {
    let argc = read_u64(&mut buf)?;
    if argc > buf.len() as u64 / 8 + 1 {
        // More arguments declared than the buffer could possibly hold.
        return Err(CodecError::BadLength(argc));
    }
    let mut argv = Vec::with_capacity(argc as usize);
    for _ in 0..argc {
        let len = read_u64(&mut buf)?;
        if len > buf.len() as u64 {
            return Err(CodecError::Truncated {
                needed: (len - buf.len() as u64) as usize,
            });
        }
        argv.push(Bytes::copy_from_slice(&buf[..len as usize]));
        buf.advance(len as usize);
    }
    if !buf.is_empty() {
        return Err(CodecError::TrailingBytes(buf.len()));
    }
    Ok(argv)
}

/// Membership-change payload carried by ADD/ADD_NONVOTING/REMOVE entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftCfgChange {
    /// Node the change applies to.
    pub id: NodeId,
    /// The node's advertised address.
    pub addr: NodeAddress,
}

impl RaftCfgChange {
    /// Create a new membership-change payload.
    pub fn new(id: NodeId, addr: NodeAddress) -> Self {
        Self { id, addr }
    }

    /// Serialize into an entry payload buffer.
    pub fn encode(&self) -> Bytes {
        let host = self.addr.host.as_bytes();
        let mut buf = BytesMut::with_capacity(4 + 2 + 8 + host.len());
        buf.put_u32_le(self.id);
        buf.put_u16_le(self.addr.port);
        buf.put_u64_le(host.len() as u64);
        buf.put_slice(host);
        buf.freeze()
    }

    /// Deserialize from an entry payload buffer.
    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 4 + 2 + 8 {
            return Err(CodecError::Truncated {
                needed: 4 + 2 + 8 - buf.len(),
            });
        }
        let id = buf.get_u32_le();
        let port = buf.get_u16_le();
        let host_len = buf.get_u64_le();
        if host_len != buf.len() as u64 {
            if host_len > buf.len() as u64 {
                return Err(CodecError::Truncated {
                    needed: (host_len - buf.len() as u64) as usize,
                });
            }
            return Err(CodecError::TrailingBytes(
                buf.len() - host_len as usize,
            ));
        }
        let host = std::str::from_utf8(buf).map_err(|_| CodecError::BadHost)?;
        Ok(Self {
            id,
            addr: NodeAddress::new(host, port),
        })
    }

    /// Decode only the node id, without validating the rest.
    pub fn decode_id(buf: &[u8]) -> Option<NodeId> {
        if buf.len() < 4 {
            return None;
        }
        Some(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }
}

fn read_u64(buf: &mut &[u8]) -> Result<u64, CodecError> {
    if buf.len() < 8 {
        return Err(CodecError::Truncated {
            needed: 8 - buf.len(),
        });
    }
    Ok(buf.get_u64_le())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&[u8]]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
    }

    // -- command codec -----------------------------------------------------

    #[test]
    fn command_roundtrip() {
        let argv = args(&[b"SET", b"key", b"value"]);
        let encoded = encode_command(&argv);
        assert_eq!(decode_command(&encoded).unwrap(), argv);
    }

    #[test]
    fn command_roundtrip_empty_and_binary() {
        // An empty middle element and an embedded NUL survive intact.
        let argv = args(&[b"SET", b"", b"binary\x00\x01"]);
        let encoded = encode_command(&argv);
        let decoded = decode_command(&encoded).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].as_ref(), b"SET");
        assert_eq!(decoded[1].as_ref(), b"");
        assert_eq!(decoded[2].as_ref(), b"binary\x00\x01");
    }

    #[test]
    fn command_wire_layout_is_little_endian() {
        let encoded = encode_command(&args(&[b"ab"]));
        // argc=1 (u64 LE), len=2 (u64 LE), "ab"
        let expected: &[u8] = &[
            1, 0, 0, 0, 0, 0, 0, 0, //
            2, 0, 0, 0, 0, 0, 0, 0, //
            b'a', b'b',
        ];
        assert_eq!(encoded.as_ref(), expected);
    }

    #[test]
    fn command_zero_args() {
        let encoded = encode_command(&[]);
        assert_eq!(encoded.as_ref(), &[0u8; 8]);
        assert!(decode_command(&encoded).unwrap().is_empty());
    }

    #[test]
    fn command_decode_rejects_truncation() {
        let argv = args(&[b"SET", b"key", b"value"]);
        let encoded = encode_command(&argv);
        for cut in [1, 7, 8, 9, encoded.len() - 1] {
            assert!(
                matches!(
                    decode_command(&encoded[..cut]),
                    Err(CodecError::Truncated { .. }) | Err(CodecError::BadLength(_))
                ),
                "cut at {cut} should fail"
            );
        }
    }

    #[test]
    fn command_decode_rejects_trailing_bytes() {
        let mut encoded = encode_command(&args(&[b"GET", b"k"])).to_vec();
        encoded.push(0xff);
        assert!(matches!(
            decode_command(&encoded),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn command_decode_rejects_implausible_argc() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(u64::MAX);
        assert!(matches!(
            decode_command(&buf),
            Err(CodecError::BadLength(_))
        ));
    }

    // -- membership payload ------------------------------------------------

    #[test]
    fn cfg_change_roundtrip() {
        let change = RaftCfgChange::new(4, NodeAddress::new("10.0.0.4", 5004));
        let encoded = change.encode();
        assert_eq!(RaftCfgChange::decode(&encoded).unwrap(), change);
        assert_eq!(RaftCfgChange::decode_id(&encoded), Some(4));
    }

    #[test]
    fn cfg_change_rejects_truncation() {
        let encoded = RaftCfgChange::new(9, NodeAddress::new("host", 1)).encode();
        assert!(RaftCfgChange::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(RaftCfgChange::decode(&encoded[..4]).is_err());
    }

    #[test]
    fn cfg_change_rejects_bad_host() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        buf.put_u16_le(80);
        buf.put_u64_le(2);
        buf.put_slice(&[0xff, 0xfe]);
        assert!(matches!(
            RaftCfgChange::decode(&buf),
            Err(CodecError::BadHost)
        ));
    }
}
