//! Sender side of RTP retransmission. Answers inbound NACKs from the packet
//! cache, using the RTX payload format (RFC 4588) when it is negotiated, and
//! restores inbound RTX packets to the packets they carry.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace, warn};
use parking_lot::RwLock;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use rtp::sequence::Sequencer;
use shared::error::Result;

use super::caching::PacketCache;
use super::{InjectedPacket, PayloadTypeMap, TransformStage};
use crate::packet::RawPacket;

/// Length of the original sequence number prepended to RTX payloads.
const OSN_LENGTH: usize = 2;

/// Media SSRC to RTX SSRC associations (a=ssrc-group:FID), shared with the
/// stream that negotiates them.
#[derive(Debug, Clone, Default)]
pub struct RtxSsrcMap {
    map: Arc<RwLock<HashMap<u32, u32>>>,
}

impl RtxSsrcMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, media_ssrc: u32, rtx_ssrc: u32) {
        self.map.write().insert(media_ssrc, rtx_ssrc);
    }

    pub fn remove(&self, media_ssrc: u32) -> Option<u32> {
        self.map.write().remove(&media_ssrc)
    }

    pub fn rtx_ssrc(&self, media_ssrc: u32) -> Option<u32> {
        self.map.read().get(&media_ssrc).copied()
    }

    pub fn media_ssrc(&self, rtx_ssrc: u32) -> Option<u32> {
        self.map
            .read()
            .iter()
            .find(|(_, rtx)| **rtx == rtx_ssrc)
            .map(|(media, _)| *media)
    }
}

pub struct RtxTransformer {
    cache: PacketCache,
    ssrcs: RtxSsrcMap,
    /// Original payload type to RTX payload type.
    rtx_payload_types: HashMap<u8, u8>,
    sequencers: HashMap<u32, Sequencer>,
    write_queue: VecDeque<InjectedPacket>,
    retransmitted: u64,
    not_found: u64,
}

impl RtxTransformer {
    pub fn new(cache: PacketCache, ssrcs: RtxSsrcMap) -> Self {
        Self {
            cache,
            ssrcs,
            rtx_payload_types: HashMap::new(),
            sequencers: HashMap::new(),
            write_queue: VecDeque::new(),
            retransmitted: 0,
            not_found: 0,
        }
    }

    pub fn ssrcs(&self) -> RtxSsrcMap {
        self.ssrcs.clone()
    }

    pub fn retransmitted(&self) -> u64 {
        self.retransmitted
    }

    pub fn not_found(&self) -> u64 {
        self.not_found
    }

    fn original_payload_type(&self, rtx_pt: u8) -> Option<u8> {
        self.rtx_payload_types
            .iter()
            .find(|(_, rtx)| **rtx == rtx_pt)
            .map(|(orig, _)| *orig)
    }

    /// Builds the retransmission of `orig`: RTX-encapsulated when both an
    /// RTX payload type and SSRC are known, a plain copy otherwise.
    fn retransmission(&mut self, mut pkt: RawPacket) -> RawPacket {
        let media_ssrc = pkt.ssrc();
        let (Some(rtx_pt), Some(rtx_ssrc)) = (
            self.rtx_payload_types.get(&pkt.payload_type()).copied(),
            self.ssrcs.rtx_ssrc(media_ssrc),
        ) else {
            return pkt;
        };

        let osn = pkt.sequence_number();
        pkt.strip_padding();
        pkt.prepend_payload(&osn.to_be_bytes());
        pkt.set_sequence_number(
            self.sequencers
                .entry(rtx_ssrc)
                .or_insert_with(Sequencer::new_random)
                .next_sequence_number(),
        );
        pkt.set_ssrc(rtx_ssrc);
        pkt.set_payload_type(rtx_pt);
        pkt
    }

    fn handle_nack(&mut self, nack: &TransportLayerNack, now: Instant) {
        for pair in &nack.nacks {
            for seq in pair.packet_list() {
                let Some(orig) = self.cache.get(nack.media_ssrc, seq) else {
                    trace!("ssrc {} seq {seq} not cached", nack.media_ssrc);
                    self.not_found += 1;
                    continue;
                };
                self.cache.update_timestamp(nack.media_ssrc, seq, now);

                let mut pkt = self.retransmission(orig);
                pkt.now = now;
                self.write_queue.push_back(InjectedPacket::rtp(pkt));
                self.retransmitted += 1;
            }
        }
    }

    fn unwrap_rtx(&self, mut pkt: RawPacket, orig_pt: u8) -> Option<RawPacket> {
        let payload = pkt.payload();
        if payload.len() < OSN_LENGTH {
            // padding-only RTX carries no packet
            trace!("rtx packet without osn from ssrc {}", pkt.ssrc());
            return None;
        }
        let osn = u16::from_be_bytes([payload[0], payload[1]]);

        pkt.strip_payload_prefix(OSN_LENGTH);
        pkt.set_sequence_number(osn);
        pkt.set_payload_type(orig_pt);
        match self.ssrcs.media_ssrc(pkt.ssrc()) {
            Some(media_ssrc) => pkt.set_ssrc(media_ssrc),
            None => warn!("rtx ssrc {} has no media ssrc", pkt.ssrc()),
        }
        Some(pkt)
    }
}

impl TransformStage for RtxTransformer {
    fn name(&self) -> &'static str {
        "rtx"
    }

    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        if self.rtx_payload_types.is_empty() {
            return Ok(pkts);
        }
        let mut out = Vec::with_capacity(pkts.len());
        for pkt in pkts {
            match self.original_payload_type(pkt.payload_type()) {
                Some(orig_pt) => {
                    if let Some(pkt) = self.unwrap_rtx(pkt, orig_pt) {
                        out.push(pkt);
                    }
                }
                None => out.push(pkt),
            }
        }
        Ok(out)
    }

    /// NACKs are answered and left in place for statistics.
    fn reverse_transform_rtcp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        for raw in &pkts {
            let Ok(packets) = raw.to_rtcp() else {
                continue;
            };
            for packet in &packets {
                if let Some(nack) = packet.as_any().downcast_ref::<TransportLayerNack>() {
                    self.handle_nack(nack, raw.now);
                }
            }
        }
        Ok(pkts)
    }

    fn bind_payload_types(&mut self, payload_types: &PayloadTypeMap) {
        self.rtx_payload_types = payload_types
            .iter()
            .filter(|(_, format)| format.is_rtx())
            .filter_map(|(pt, format)| format.apt().map(|apt| (apt, *pt)))
            .collect();
        debug!("rtx payload types {:?}", self.rtx_payload_types);
    }

    fn poll_injected(&mut self) -> Option<InjectedPacket> {
        self.write_queue.pop_front()
    }

    fn close(&mut self) {
        self.write_queue.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
