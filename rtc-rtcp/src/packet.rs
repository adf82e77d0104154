use std::any::Any;
use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, Unmarshal};

use crate::goodbye::Goodbye;
use crate::header::{
    FORMAT_FIR, FORMAT_PLI, FORMAT_REMB, FORMAT_TCC, FORMAT_TLN, HEADER_LENGTH, Header,
    PacketType,
};
use crate::payload_feedbacks::full_intra_request::FullIntraRequest;
use crate::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use crate::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use crate::raw_packet::RawPacket;
use crate::receiver_report::ReceiverReport;
use crate::sender_report::SenderReport;
use crate::transport_feedbacks::transport_layer_cc::TransportLayerCc;
use crate::transport_feedbacks::transport_layer_nack::TransportLayerNack;

/// Packet represents an RTCP packet, a protocol used for out-of-band statistics and control information for an RTP session
pub trait Packet: Marshal + fmt::Display + fmt::Debug + Send + Sync {
    fn header(&self) -> Header;
    fn destination_ssrc(&self) -> Vec<u32>;
    fn raw_size(&self) -> usize;
    fn as_any(&self) -> &(dyn Any + Send + Sync);
    fn equal(&self, other: &dyn Packet) -> bool;
    fn cloned(&self) -> Box<dyn Packet>;
}

impl PartialEq for dyn Packet {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl Clone for Box<dyn Packet> {
    fn clone(&self) -> Box<dyn Packet> {
        self.cloned()
    }
}

/// Serializes a list of packets into one compound datagram.
pub fn marshal(packets: &[Box<dyn Packet>]) -> Result<Bytes> {
    let mut out = BytesMut::new();
    for p in packets {
        let data = p.marshal()?;
        out.extend(data);
    }
    Ok(out.freeze())
}

/// Parses every packet in a compound datagram.
///
/// An empty input is an error; an unknown packet type is preserved as a
/// [`RawPacket`] so forwarding does not lose it.
pub fn unmarshal<B>(raw_data: &mut B) -> Result<Vec<Box<dyn Packet>>>
where
    B: Buf,
{
    let mut packets = vec![];

    while raw_data.has_remaining() {
        let p = unmarshaller(raw_data)?;
        packets.push(p);
    }

    match packets.len() {
        // Empty Packet
        0 => Err(Error::ErrInvalidHeader),
        _ => Ok(packets),
    }
}

/// unmarshaller is a factory which pulls the first RTCP packet from a bytestream,
/// and returns it's parsed representation, and the amount of data that was processed.
pub(crate) fn unmarshaller<B>(raw_data: &mut B) -> Result<Box<dyn Packet>>
where
    B: Buf,
{
    let h = Header::unmarshal(raw_data)?;

    let length = (h.length as usize) * 4;
    if length > raw_data.remaining() {
        return Err(Error::ErrPacketTooShort);
    }

    let mut whole = BytesMut::with_capacity(HEADER_LENGTH + length);
    whole.extend(h.marshal()?);
    whole.extend(raw_data.copy_to_bytes(length));
    let in_packet = &mut whole.freeze();

    let p: Box<dyn Packet> = match h.packet_type {
        PacketType::SenderReport => Box::new(SenderReport::unmarshal(in_packet)?),
        PacketType::ReceiverReport => Box::new(ReceiverReport::unmarshal(in_packet)?),
        PacketType::Goodbye => Box::new(Goodbye::unmarshal(in_packet)?),
        PacketType::TransportSpecificFeedback => match h.count {
            FORMAT_TLN => Box::new(TransportLayerNack::unmarshal(in_packet)?),
            FORMAT_TCC => Box::new(TransportLayerCc::unmarshal(in_packet)?),
            _ => Box::new(RawPacket::unmarshal(in_packet)?),
        },
        PacketType::PayloadSpecificFeedback => match h.count {
            FORMAT_PLI => Box::new(PictureLossIndication::unmarshal(in_packet)?),
            FORMAT_FIR => Box::new(FullIntraRequest::unmarshal(in_packet)?),
            FORMAT_REMB => Box::new(ReceiverEstimatedMaximumBitrate::unmarshal(in_packet)?),
            _ => Box::new(RawPacket::unmarshal(in_packet)?),
        },
        _ => Box::new(RawPacket::unmarshal(in_packet)?),
    };

    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reception_report::ReceptionReport;

    #[test]
    fn test_packet_unmarshal_compound() -> Result<()> {
        let data = Bytes::from_static(&[
            // Receiver Report (offset=0)
            // v=2, p=0, count=1, RR, len=7
            0x81, 0xc9, 0x0, 0x7, // ssrc=0x902f9e2e
            0x90, 0x2f, 0x9e, 0x2e, // ssrc=0xbc5e9a40
            0xbc, 0x5e, 0x9a, 0x40, // fracLost=0, totalLost=0
            0x0, 0x0, 0x0, 0x0, // lastSeq=0x46e1
            0x0, 0x0, 0x46, 0xe1, // jitter=273
            0x0, 0x0, 0x1, 0x11, // lsr=0x9f36432
            0x9, 0xf3, 0x64, 0x32, // delay=150137
            0x0, 0x2, 0x4a, 0x79, // Goodbye (offset=32)
            // v=2, p=0, count=1, BYE, len=1
            0x81, 0xcb, 0x0, 0x1, // source=0x902f9e2e
            0x90, 0x2f, 0x9e, 0x2e, // Picture Loss Indication (offset=40)
            0x81, 0xce, 0x0, 0x2, // sender=0x902f9e2e
            0x90, 0x2f, 0x9e, 0x2e, // media=0x902f9e2e
            0x90, 0x2f, 0x9e, 0x2e, // Source Description (offset=52)
            0x81, 0xca, 0x0, 0x2, // ssrc=0x902f9e2e
            0x90, 0x2f, 0x9e, 0x2e, // CNAME, len=0, end
            0x01, 0x00, 0x00, 0x00,
        ]);

        let packets = unmarshal(&mut data.clone())?;
        assert_eq!(packets.len(), 4);

        let rr = packets[0]
            .as_any()
            .downcast_ref::<ReceiverReport>()
            .expect("first packet is a receiver report");
        assert_eq!(
            rr.reports,
            vec![ReceptionReport {
                ssrc: 0xbc5e9a40,
                fraction_lost: 0,
                total_lost: 0,
                last_sequence_number: 0x46e1,
                jitter: 273,
                last_sender_report: 0x9f36432,
                delay: 150137,
            }]
        );
        assert!(packets[1].as_any().downcast_ref::<Goodbye>().is_some());
        assert!(
            packets[2]
                .as_any()
                .downcast_ref::<PictureLossIndication>()
                .is_some()
        );
        let sdes = packets[3]
            .as_any()
            .downcast_ref::<RawPacket>()
            .expect("sdes is kept raw");
        assert_eq!(sdes.header().packet_type, PacketType::SourceDescription);

        assert_eq!(marshal(&packets)?, data);

        Ok(())
    }

    #[test]
    fn test_packet_unmarshal_errors() {
        let tests: Vec<(&str, &'static [u8], Error)> = vec![
            ("empty", &[], Error::ErrInvalidHeader),
            ("truncated", &[0x81, 0xc9, 0x00, 0x07, 0x00], Error::ErrPacketTooShort),
            ("bad version", &[0x00, 0xc9, 0x00, 0x00], Error::ErrBadVersion),
        ];

        for (name, raw, want) in tests {
            let got = unmarshal(&mut Bytes::from_static(raw));
            assert_eq!(got.err(), Some(want), "{name}");
        }
    }
}
