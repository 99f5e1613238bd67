//! Runtime log stream framing
//!
//! Non-TTY containers multiplex stdout and stderr into one byte stream. Each
//! frame is `[stream tag][3 unused bytes][u32 big-endian length][payload]`.

use bytes::{BufMut, Bytes, BytesMut};

use dockscope_types::StdType;

/// Size of a frame header in bytes
pub const HEADER_LEN: usize = 8;

/// Encode one payload as a multiplexed frame
pub fn encode_frame(stream: StdType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(stream.tag());
    buf.put_bytes(0, 3);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_layout() {
        let frame = encode_frame(StdType::Stderr, b"hi");
        assert_eq!(&frame[..], &[2, 0, 0, 0, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_encode_empty_payload() {
        let frame = encode_frame(StdType::Stdout, b"");
        assert_eq!(frame.len(), HEADER_LEN);
        assert_eq!(frame[0], 1);
    }
}
