//! RESP protocol encoder

use bytes::{BufMut, BytesMut};

use super::Frame;

/// Encode a frame into the buffer
pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) {
    match frame {
        Frame::Simple(s) => {
            buf.put_u8(b'+');
            buf.put_slice(s);
            buf.put_slice(b"\r\n");
        }
        Frame::Error(s) => {
            buf.put_u8(b'-');
            buf.put_slice(s);
            buf.put_slice(b"\r\n");
        }
        Frame::Integer(n) => {
            buf.put_u8(b':');
            buf.put_slice(n.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
        Frame::Bulk(None) => {
            buf.put_slice(b"$-1\r\n");
        }
        Frame::Bulk(Some(data)) => {
            buf.put_u8(b'$');
            buf.put_slice(data.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            buf.put_slice(data);
            buf.put_slice(b"\r\n");
        }
        Frame::Array(None) => {
            buf.put_slice(b"*-1\r\n");
        }
        Frame::Array(Some(frames)) => {
            buf.put_u8(b'*');
            buf.put_slice(frames.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            for frame in frames {
                encode_frame(frame, buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_frame;
    use bytes::Bytes;

    fn encode_to_bytes(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf);
        buf
    }

    #[test]
    fn test_encode_simple_string() {
        assert_eq!(&encode_to_bytes(&Frame::simple("OK"))[..], b"+OK\r\n");
    }

    #[test]
    fn test_encode_error() {
        assert_eq!(
            &encode_to_bytes(&Frame::error("ERR unknown command"))[..],
            b"-ERR unknown command\r\n"
        );
    }

    #[test]
    fn test_encode_integer() {
        assert_eq!(&encode_to_bytes(&Frame::integer(1000))[..], b":1000\r\n");
        assert_eq!(&encode_to_bytes(&Frame::integer(-500))[..], b":-500\r\n");
    }

    #[test]
    fn test_encode_bulk() {
        assert_eq!(
            &encode_to_bytes(&Frame::bulk("hello"))[..],
            b"$5\r\nhello\r\n"
        );
        assert_eq!(&encode_to_bytes(&Frame::null())[..], b"$-1\r\n");
    }

    #[test]
    fn test_encode_array() {
        let frame = Frame::array(vec![Frame::integer(1), Frame::bulk("x")]);
        assert_eq!(&encode_to_bytes(&frame)[..], b"*2\r\n:1\r\n$1\r\nx\r\n");
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let frame = Frame::array(vec![
            Frame::bulk(Bytes::from_static(b"SET")),
            Frame::bulk(Bytes::from_static(b"bin\x00\x01")),
            Frame::integer(-7),
            Frame::simple("OK"),
        ]);
        let mut buf = encode_to_bytes(&frame);
        let parsed = parse_frame(&mut buf).unwrap().unwrap();
        assert_eq!(parsed, frame);
        assert!(buf.is_empty());
    }
}
