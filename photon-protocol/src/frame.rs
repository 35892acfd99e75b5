//! Multipart envelope used to carry a message over a byte stream.
//!
//! Envelope format:
//! ```text
//! +--------+------------+-----------------------------------------+
//! | Magic  | Part count | Parts                                   |
//! | "PHMP" | u32 LE     | (u32 LE length, bytes) x part count     |
//! +--------+------------+-----------------------------------------+
//! | 4 bytes| 4 bytes    | variable                                |
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::{MAGIC, MAX_MESSAGE_SIZE, MAX_PARTS};

/// Envelope header size: 4 (magic) + 4 (part count) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Ordered frames making up one message.
pub type Frames = Vec<Bytes>;

/// Encode a list of frames into one envelope.
pub fn encode_multipart(parts: &[Bytes]) -> Result<Bytes, ProtocolError> {
    if parts.len() as u64 > MAX_PARTS as u64 {
        return Err(ProtocolError::TooManyParts(parts.len() as u32, MAX_PARTS));
    }

    let body: u64 = parts.iter().map(|p| 4 + p.len() as u64).sum();
    let total = HEADER_SIZE as u64 + body;
    if total > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(total, MAX_MESSAGE_SIZE));
    }

    let mut buf = BytesMut::with_capacity(total as usize);
    buf.put_slice(&MAGIC);
    buf.put_u32_le(parts.len() as u32);
    for part in parts {
        buf.put_u32_le(part.len() as u32);
        buf.put_slice(part);
    }

    Ok(buf.freeze())
}

/// Measure the complete envelope at the front of `buf`.
///
/// Returns `Ok(None)` while more bytes are needed.
fn envelope_len(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&buf[0..4]);
    if magic != MAGIC {
        return Err(ProtocolError::InvalidMagic(magic));
    }

    let mut cursor = &buf[4..];
    let count = cursor.get_u32_le();
    if count > MAX_PARTS {
        return Err(ProtocolError::TooManyParts(count, MAX_PARTS));
    }

    let mut offset = HEADER_SIZE as u64;
    for _ in 0..count {
        if (buf.len() as u64) < offset + 4 {
            return Ok(None);
        }
        let start = offset as usize;
        let len = u32::from_le_bytes([buf[start], buf[start + 1], buf[start + 2], buf[start + 3]]);
        offset += 4 + len as u64;
        if offset > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(offset, MAX_MESSAGE_SIZE));
        }
    }

    if (buf.len() as u64) < offset {
        return Ok(None);
    }
    Ok(Some(offset as usize))
}

/// Try to split one complete message off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched if the message is not
/// complete yet.
pub fn decode_multipart(buf: &mut BytesMut) -> Result<Option<Frames>, ProtocolError> {
    let total = match envelope_len(buf)? {
        Some(n) => n,
        None => return Ok(None),
    };

    let mut message = buf.split_to(total).freeze();
    message.advance(4);
    let count = message.get_u32_le() as usize;

    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let len = message.get_u32_le() as usize;
        parts.push(message.split_to(len));
    }

    Ok(Some(parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts() -> Frames {
        vec![
            Bytes::from_static(b"PHOTONDATA"),
            Bytes::from_static(&[1, 0, 0, 0, 2, 0, 0, 0]),
            Bytes::new(),
        ]
    }

    #[test]
    fn test_encode_decode_multipart() {
        let encoded = encode_multipart(&parts()).unwrap();
        assert_eq!(&encoded[0..4], &MAGIC);

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = decode_multipart(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, parts());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_message() {
        let encoded = encode_multipart(&parts()).unwrap();

        for cut in [0, 3, HEADER_SIZE, HEADER_SIZE + 2, encoded.len() - 1] {
            let mut buf = BytesMut::from(&encoded[..cut]);
            assert!(decode_multipart(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn test_two_messages_in_buffer() {
        let first = encode_multipart(&[Bytes::from_static(b"ACK")]).unwrap();
        let second = encode_multipart(&parts()).unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second);

        let a = decode_multipart(&mut buf).unwrap().unwrap();
        assert_eq!(a, vec![Bytes::from_static(b"ACK")]);
        let b = decode_multipart(&mut buf).unwrap().unwrap();
        assert_eq!(b, parts());
        assert!(decode_multipart(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = BytesMut::from(&b"BADMxxxx"[..]);
        let result = decode_multipart(&mut buf);
        assert!(matches!(result, Err(ProtocolError::InvalidMagic(_))));
    }

    #[test]
    fn test_too_many_parts() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(MAX_PARTS + 1);
        let result = decode_multipart(&mut buf);
        assert!(matches!(result, Err(ProtocolError::TooManyParts(_, _))));
    }
}
