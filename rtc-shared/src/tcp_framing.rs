//! RFC 4571 framing of RTP and RTCP packets carried over a TCP stream.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! ---------------------------------------------------------------
//! |             LENGTH            |  RTP or RTCP packet ...       |
//! ---------------------------------------------------------------
//! ```
//!
//! Encoding and decoding are pure buffer operations; the stream transport
//! owns the socket and feeds received bytes into a [`FrameDecoder`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Length of the framing header.
pub const FRAMING_HEADER_LEN: usize = 2;

/// Largest packet a 16-bit length prefix can describe.
pub const MAX_FRAMED_PACKET_SIZE: usize = u16::MAX as usize;

/// Appends the length prefix and `packet` to `out`.
pub fn encode_frame(packet: &[u8], out: &mut BytesMut) -> Result<()> {
    if packet.len() > MAX_FRAMED_PACKET_SIZE {
        return Err(Error::ErrPacketTooBig);
    }

    out.reserve(FRAMING_HEADER_LEN + packet.len());
    out.put_u16(packet.len() as u16);
    out.put_slice(packet);
    Ok(())
}

/// Returns a freshly allocated framed copy of `packet`.
pub fn frame(packet: &[u8]) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(FRAMING_HEADER_LEN + packet.len());
    encode_frame(packet, &mut out)?;
    Ok(out.freeze())
}

/// Reassembles length-prefixed packets from arbitrarily chunked stream reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the stream.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pops the next complete packet, without its length prefix.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buffer.len() < FRAMING_HEADER_LEN {
            return None;
        }

        let length = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if self.buffer.len() < FRAMING_HEADER_LEN + length {
            return None;
        }

        self.buffer.advance(FRAMING_HEADER_LEN);
        Some(self.buffer.split_to(length).freeze())
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_prefixes_length() {
        let framed = frame(b"rtp!").unwrap();
        assert_eq!(&framed[..], &[0, 4, b'r', b't', b'p', b'!']);
    }

    #[test]
    fn test_encode_frame_rejects_oversized() {
        let huge = vec![0u8; MAX_FRAMED_PACKET_SIZE + 1];
        let mut out = BytesMut::new();
        assert_eq!(encode_frame(&huge, &mut out), Err(Error::ErrPacketTooBig));
        assert!(out.is_empty());
    }

    #[test]
    fn test_decoder_reassembles_split_reads() {
        let mut wire = BytesMut::new();
        encode_frame(b"first", &mut wire).unwrap();
        encode_frame(b"second", &mut wire).unwrap();

        let mut decoder = FrameDecoder::new();
        for chunk in wire.chunks(3) {
            decoder.feed(chunk);
        }

        assert_eq!(decoder.next_frame().as_deref(), Some(&b"first"[..]));
        assert_eq!(decoder.next_frame().as_deref(), Some(&b"second"[..]));
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_decoder_waits_for_full_payload() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0]);
        assert!(decoder.next_frame().is_none());
        decoder.feed(&[3, 1, 2]);
        assert!(decoder.next_frame().is_none());
        decoder.feed(&[3]);
        assert_eq!(decoder.next_frame().as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_decoder_empty_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0, 0]);
        assert_eq!(decoder.next_frame().map(|b| b.len()), Some(0));
    }
}
