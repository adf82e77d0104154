//! Integration tests for compound RTCP datagrams.
//!
//! Every packet kind a media stream emits or terminates must survive a
//! marshal/unmarshal cycle inside one compound, and unknown kinds must be
//! forwarded byte for byte.

use bytes::Bytes;
use rtc_rtcp::goodbye::Goodbye;
use rtc_rtcp::header::PacketType;
use rtc_rtcp::packet::{self, Packet};
use rtc_rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use rtc_rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtc_rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtc_rtcp::receiver_report::ReceiverReport;
use rtc_rtcp::reception_report::ReceptionReport;
use rtc_rtcp::sender_report::SenderReport;
use rtc_rtcp::transport_feedbacks::transport_layer_cc::TransportLayerCc;
use rtc_rtcp::transport_feedbacks::transport_layer_nack::{
    TransportLayerNack, nack_pairs_from_sequence_numbers,
};
use shared::error::Result;

fn report(ssrc: u32) -> ReceptionReport {
    ReceptionReport {
        ssrc,
        fraction_lost: 12,
        total_lost: 7,
        last_sequence_number: 0x0001_0203,
        jitter: 90,
        last_sender_report: 0x1000,
        delay: 0x10,
    }
}

#[test]
fn test_compound_round_trip() -> Result<()> {
    let packets: Vec<Box<dyn Packet>> = vec![
        Box::new(SenderReport {
            ssrc: 0x1111,
            ntp_time: 0xDA8B_D1FC_DDDD_A05A,
            rtp_time: 0xAAF4_EDD5,
            packet_count: 1,
            octet_count: 2,
            reports: vec![report(0x2222)],
            ..Default::default()
        }),
        Box::new(ReceiverReport {
            ssrc: 0x1111,
            reports: vec![report(0x3333), report(0x4444)],
            ..Default::default()
        }),
        Box::new(ReceiverEstimatedMaximumBitrate {
            sender_ssrc: 0x1111,
            bitrate: 512_000,
            ssrcs: vec![0x2222, 0x3333],
        }),
        Box::new(TransportLayerNack {
            sender_ssrc: 0x1111,
            media_ssrc: 0x2222,
            nacks: nack_pairs_from_sequence_numbers(&[10, 11, 40]),
        }),
        Box::new(TransportLayerCc {
            sender_ssrc: 0x1111,
            media_ssrc: 0x2222,
            fci: Bytes::from_static(&[0, 1, 0, 1, 0, 0, 0, 0]),
        }),
        Box::new(PictureLossIndication {
            sender_ssrc: 0x1111,
            media_ssrc: 0x2222,
        }),
        Box::new(FullIntraRequest {
            sender_ssrc: 0x1111,
            media_ssrc: 0x2222,
            fir: vec![FirEntry {
                ssrc: 0x2222,
                sequence_number: 3,
            }],
        }),
        Box::new(Goodbye {
            sources: vec![0x1111],
            reason: Bytes::from_static(b"bye"),
        }),
    ];

    let raw = packet::marshal(&packets)?;
    let parsed = packet::unmarshal(&mut raw.clone())?;

    assert_eq!(parsed.len(), packets.len());
    for (i, (want, got)) in packets.iter().zip(parsed.iter()).enumerate() {
        assert!(want.equal(got.as_ref()), "packet {i}: {want} != {got}");
    }

    assert_eq!(packet::marshal(&parsed)?, raw);

    Ok(())
}

#[test]
fn test_compound_keeps_unknown_packets() -> Result<()> {
    let raw = Bytes::from_static(&[
        // APP, subtype 0, len=2
        0x80, 0xcc, 0x00, 0x02, // ssrc
        0x00, 0x00, 0x11, 0x11, // name
        b'T', b'E', b'S', b'T', // PLI
        0x81, 0xce, 0x00, 0x02, // sender
        0x00, 0x00, 0x11, 0x11, // media
        0x00, 0x00, 0x22, 0x22,
    ]);

    let parsed = packet::unmarshal(&mut raw.clone())?;
    assert_eq!(parsed.len(), 2);
    assert_eq!(
        parsed[0].header().packet_type,
        PacketType::ApplicationDefined
    );
    assert_eq!(parsed[1].destination_ssrc(), vec![0x2222]);
    assert_eq!(packet::marshal(&parsed)?, raw);

    Ok(())
}
