use std::any::Any;
use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{FORMAT_TCC, HEADER_LENGTH, Header, PacketType};
use crate::packet::Packet;
use crate::util::get_padding_size;

/// Offset of the feedback control information after the common header.
const FCI_OFFSET: usize = 8;

/// Transport-wide congestion control feedback.
/// https://tools.ietf.org/html/draft-holmer-rmcat-transport-wide-cc-extensions-01#section-3.1
///
/// The feedback body is carried opaquely: a media stream only needs to
/// recognise and strip these packets, never to interpret the chunks.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct TransportLayerCc {
    /// SSRC of sender
    pub sender_ssrc: u32,
    /// SSRC of the media source
    pub media_ssrc: u32,
    /// base sequence number, reference time, status chunks and deltas
    pub fci: Bytes,
}

impl fmt::Display for TransportLayerCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransportLayerCc:\n\tSender Ssrc {:x}\n\tMedia Ssrc {:x}\n\tFCI {} bytes\n",
            self.sender_ssrc,
            self.media_ssrc,
            self.fci.len()
        )
    }
}

impl Packet for TransportLayerCc {
    fn header(&self) -> Header {
        Header {
            padding: get_padding_size(self.raw_size()) != 0,
            count: FORMAT_TCC,
            packet_type: PacketType::TransportSpecificFeedback,
            length: ((self.marshal_size() / 4) - 1) as u16,
        }
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        vec![self.media_ssrc]
    }

    fn raw_size(&self) -> usize {
        HEADER_LENGTH + FCI_OFFSET + self.fci.len()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &dyn Packet) -> bool {
        other.as_any().downcast_ref::<TransportLayerCc>() == Some(self)
    }

    fn cloned(&self) -> Box<dyn Packet> {
        Box::new(self.clone())
    }
}

impl MarshalSize for TransportLayerCc {
    fn marshal_size(&self) -> usize {
        let l = self.raw_size();
        // align to 32-bit boundary
        l + get_padding_size(l)
    }
}

impl Marshal for TransportLayerCc {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::ErrBufferTooSmall);
        }

        let h = self.header();
        let n = h.marshal_to(buf)?;
        buf = &mut buf[n..];

        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        buf.put(self.fci.clone());

        // zero padding; the chunk list has its own length accounting
        for _ in self.raw_size()..self.marshal_size() {
            buf.put_u8(0);
        }

        Ok(self.marshal_size())
    }
}

impl Unmarshal for TransportLayerCc {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let raw_packet_len = raw_packet.remaining();
        if raw_packet_len < HEADER_LENGTH + FCI_OFFSET {
            return Err(Error::ErrPacketTooShort);
        }

        let h = Header::unmarshal(raw_packet)?;
        if h.packet_type != PacketType::TransportSpecificFeedback || h.count != FORMAT_TCC {
            return Err(Error::ErrWrongType);
        }

        let total_length = h.packet_size();
        if total_length < HEADER_LENGTH + FCI_OFFSET || raw_packet_len < total_length {
            return Err(Error::ErrPacketTooShort);
        }

        let sender_ssrc = raw_packet.get_u32();
        let media_ssrc = raw_packet.get_u32();
        let fci = raw_packet.copy_to_bytes(total_length - HEADER_LENGTH - FCI_OFFSET);

        Ok(TransportLayerCc {
            sender_ssrc,
            media_ssrc,
            fci,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_layer_cc_unmarshal() -> Result<()> {
        let data = Bytes::from_static(&[
            0x8f, 0xcd, 0x00, 0x05, // v=2, fmt=15, TSFB, len=5
            0xfa, 0x17, 0xfa, 0x17, // sender
            0x00, 0x00, 0x00, 0x00, // media
            0x00, 0x01, 0x00, 0x01, // base seq=1, status count=1
            0x24, 0x4b, 0x6e, 0x00, // reference time, fb count
            0x20, 0x01, 0x94, 0x01, // run length chunk, delta, padding
        ]);

        let got = TransportLayerCc::unmarshal(&mut data.clone())?;
        assert_eq!(got.sender_ssrc, 0xfa17fa17);
        assert_eq!(got.media_ssrc, 0);
        assert_eq!(got.fci.len(), 12);
        assert_eq!(got.marshal()?.freeze(), data);

        Ok(())
    }

    #[test]
    fn test_transport_layer_cc_errors() {
        let tests: Vec<(&str, &'static [u8], Error)> = vec![
            (
                "short",
                &[0x8f, 0xcd, 0x00, 0x02, 0xfa, 0x17, 0xfa, 0x17],
                Error::ErrPacketTooShort,
            ),
            (
                "nack format",
                &[
                    0x81, 0xcd, 0x00, 0x02, 0xfa, 0x17, 0xfa, 0x17, 0x00, 0x00, 0x00, 0x00,
                ],
                Error::ErrWrongType,
            ),
        ];

        for (name, raw, want) in tests {
            let got = TransportLayerCc::unmarshal(&mut Bytes::from_static(raw));
            assert_eq!(got, Err(want), "{name}");
        }
    }
}
