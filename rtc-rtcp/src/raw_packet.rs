use std::any::Any;
use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{HEADER_LENGTH, Header};
use crate::packet::Packet;
use crate::util::get_padding_size;

/// RawPacket represents an unparsed RTCP packet. It's returned by Unmarshal when
/// a packet with an unknown type is encountered.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct RawPacket(pub Bytes);

impl fmt::Display for RawPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawPacket: {self:?}")
    }
}

impl Packet for RawPacket {
    /// Header returns the Header associated with this packet.
    fn header(&self) -> Header {
        match Header::unmarshal(&mut self.0.clone()) {
            Ok(h) => h,
            Err(_) => Header::default(),
        }
    }

    /// destination_ssrc returns an array of SSRC values that this packet refers to.
    fn destination_ssrc(&self) -> Vec<u32> {
        vec![]
    }

    fn raw_size(&self) -> usize {
        self.0.len()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &dyn Packet) -> bool {
        other.as_any().downcast_ref::<RawPacket>() == Some(self)
    }

    fn cloned(&self) -> Box<dyn Packet> {
        Box::new(self.clone())
    }
}

impl MarshalSize for RawPacket {
    fn marshal_size(&self) -> usize {
        let l = self.raw_size();
        // align to 32-bit boundary
        l + get_padding_size(l)
    }
}

impl Marshal for RawPacket {
    /// Marshal encodes the packet in binary.
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::ErrBufferTooSmall);
        }
        buf.put(self.0.clone());
        for _ in self.raw_size()..self.marshal_size() {
            buf.put_u8(0);
        }
        Ok(self.marshal_size())
    }
}

impl Unmarshal for RawPacket {
    /// Unmarshal decodes the packet from binary.
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let raw_packet_len = raw_packet.remaining();
        if raw_packet_len < HEADER_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }

        let raw = raw_packet.copy_to_bytes(raw_packet_len);
        // validates version and header shape
        Header::unmarshal(&mut raw.clone())?;

        Ok(RawPacket(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::PacketType;

    #[test]
    fn test_raw_packet_round_trip() -> Result<()> {
        let tests = vec![
            (
                "valid",
                Bytes::from_static(&[
                    0x81, 0xcb, 0x00, 0x0c, // v=2, p=0, count=1, BYE, len=12
                    0x90, 0x2f, 0x9e, 0x2e, // source=0x902f9e2e
                    0x03, 0x46, 0x4f, 0x4f, // len=3, text=FOO
                ]),
                None,
            ),
            (
                "short header",
                Bytes::from_static(&[0x80]),
                Some(Error::ErrPacketTooShort),
            ),
            (
                "invalid header",
                Bytes::from_static(&[
                    // v=0, p=0, count=0, RR, len=4
                    0x00, 0xc9, 0x00, 0x04,
                ]),
                Some(Error::ErrBadVersion),
            ),
        ];

        for (name, data, want_error) in tests {
            let got = RawPacket::unmarshal(&mut data.clone());
            assert_eq!(
                got.is_err(),
                want_error.is_some(),
                "Unmarshal {name}: err = {got:?}, want {want_error:?}"
            );

            if let Some(err) = want_error {
                assert_eq!(got, Err(err), "Unmarshal {name}");
            } else {
                let pkt = got?;
                assert_eq!(pkt.header().packet_type, PacketType::Goodbye, "{name}");
                assert_eq!(pkt.marshal()?.freeze(), data, "Marshal {name}");
            }
        }

        Ok(())
    }
}
