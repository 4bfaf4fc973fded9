//! gRPC message framing: 1-byte compressed flag + 4-byte big-endian length.
//!
//! Only uncompressed messages (flag 0) are supported; the proxy never
//! negotiates a message encoding.

use bytes::{Buf, BufMut};

use crate::error::GrpcError;

/// Frame header size: flag byte + u32 length.
pub const HEADER_SIZE: usize = 5;

/// Largest message the proxy will frame or accept.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Wrap one message in a gRPC frame.
pub fn encode_message(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + message.len());
    out.put_u8(0);
    out.put_u32(message.len() as u32);
    out.extend_from_slice(message);
    out
}

/// Decode a complete buffer of concatenated frames into messages.
///
/// A trailing partial frame is an error: callers only decode once the
/// HTTP/2 stream has ended, so the body must hold whole frames.
pub fn decode_messages(mut data: &[u8]) -> Result<Vec<Vec<u8>>, GrpcError> {
    let mut messages = Vec::new();
    while !data.is_empty() {
        if data.len() < HEADER_SIZE {
            return Err(GrpcError::Truncated);
        }
        let flag = data.get_u8();
        if flag != 0 {
            return Err(GrpcError::CompressedFlag);
        }
        let len = data.get_u32() as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(GrpcError::MessageTooLarge(len));
        }
        if data.len() < len {
            return Err(GrpcError::Truncated);
        }
        messages.push(data[..len].to_vec());
        data.advance(len);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_single() {
        let msg = b"hello grpc".to_vec();
        let frame = encode_message(&msg);
        assert_eq!(frame.len(), HEADER_SIZE + msg.len());
        assert_eq!(decode_messages(&frame).unwrap(), vec![msg]);
    }

    #[test]
    fn test_multiple_messages() {
        let mut wire = encode_message(b"one");
        wire.extend_from_slice(&encode_message(b"two"));
        let msgs = decode_messages(&wire).unwrap();
        assert_eq!(msgs, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_empty_buffer() {
        assert!(decode_messages(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_compressed_flag_rejected() {
        let mut frame = encode_message(b"x");
        frame[0] = 1;
        assert_eq!(decode_messages(&frame), Err(GrpcError::CompressedFlag));
    }

    #[test]
    fn test_truncated() {
        let frame = encode_message(b"hello");
        assert_eq!(
            decode_messages(&frame[..frame.len() - 1]),
            Err(GrpcError::Truncated)
        );
        assert_eq!(decode_messages(&frame[..3]), Err(GrpcError::Truncated));
    }
}
