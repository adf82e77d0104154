//! The ordered chain of packet transformations of a media stream.
//!
//! Outbound packets traverse the stages in [`StageSlot::ORDER`]; inbound
//! packets traverse them in reverse. The order encodes the protocol layering
//! and is fixed: a stream that does not need a stage leaves its slot empty.
//!
//! Stages are synchronous. A stage that emits packets on its own schedule
//! (reports, retransmission requests, retransmissions) reports its next
//! deadline through [`TransformStage::poll_timeout`], is driven by
//! [`TransformStage::handle_timeout`] and queues what it generates for
//! [`TransformStage::poll_injected`]. Injected packets continue through the
//! stages after the one that produced them.

pub mod abs_send_time;
pub mod caching;
pub mod csrc;
pub mod discard;
pub mod dtmf;
pub mod fec;
pub mod ohb;
pub mod padding_termination;
pub mod payload_type;
pub mod red;
pub mod remb;
pub mod retransmission_requester;
pub mod rtcp_termination;
pub mod rtx;
pub mod ssrc_audio_level;
pub mod statistics;
pub mod tcc;
pub mod track_receiver;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use log::debug;
use shared::error::Result;

use crate::format::{ExtensionMap, MediaFormat};
use crate::packet::{PacketKind, RawPacket};

/// Dynamic payload type number to negotiated format.
pub type PayloadTypeMap = BTreeMap<u8, MediaFormat>;

/// A packet generated by a stage, to be sent on the outbound path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedPacket {
    pub kind: PacketKind,
    pub packet: RawPacket,
}

impl InjectedPacket {
    pub fn rtp(packet: RawPacket) -> Self {
        Self {
            kind: PacketKind::Rtp,
            packet,
        }
    }

    pub fn rtcp(packet: RawPacket) -> Self {
        Self {
            kind: PacketKind::Rtcp,
            packet,
        }
    }
}

/// One step of the chain. Every method but the downcast hook defaults to
/// identity or a no-op.
pub trait TransformStage: Send {
    fn name(&self) -> &'static str;

    /// Outbound RTP.
    fn transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        Ok(pkts)
    }

    /// Inbound RTP.
    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        Ok(pkts)
    }

    /// Outbound RTCP.
    fn transform_rtcp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        Ok(pkts)
    }

    /// Inbound RTCP.
    fn reverse_transform_rtcp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        Ok(pkts)
    }

    /// Re-resolves the header extension ids the stage reads or writes.
    fn bind_extensions(&mut self, _extensions: &ExtensionMap) {}

    fn bind_payload_types(&mut self, _payload_types: &PayloadTypeMap) {}

    fn set_local_ssrc(&mut self, _ssrc: u32) {}

    fn poll_timeout(&self) -> Option<Instant> {
        None
    }

    fn handle_timeout(&mut self, _now: Instant) -> Result<()> {
        Ok(())
    }

    fn poll_injected(&mut self) -> Option<InjectedPacket> {
        None
    }

    fn close(&mut self) {}

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Positions of the chain, in outbound order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageSlot {
    Csrc,
    Dtmf,
    External,
    RtcpTermination,
    PayloadTypeOverride,
    Fec,
    Red,
    Statistics,
    RetransmissionRequester,
    Caching,
    Discard,
    TrackReceiver,
    PaddingTermination,
    Rtx,
    RemoteBitrateEstimator,
    AbsSendTime,
    TccEgress,
    OriginalHeaderBlock,
    Encryption,
    TccIngress,
    SsrcAudioLevel,
}

impl StageSlot {
    pub const COUNT: usize = 21;

    pub const ORDER: [StageSlot; StageSlot::COUNT] = [
        StageSlot::Csrc,
        StageSlot::Dtmf,
        StageSlot::External,
        StageSlot::RtcpTermination,
        StageSlot::PayloadTypeOverride,
        StageSlot::Fec,
        StageSlot::Red,
        StageSlot::Statistics,
        StageSlot::RetransmissionRequester,
        StageSlot::Caching,
        StageSlot::Discard,
        StageSlot::TrackReceiver,
        StageSlot::PaddingTermination,
        StageSlot::Rtx,
        StageSlot::RemoteBitrateEstimator,
        StageSlot::AbsSendTime,
        StageSlot::TccEgress,
        StageSlot::OriginalHeaderBlock,
        StageSlot::Encryption,
        StageSlot::TccIngress,
        StageSlot::SsrcAudioLevel,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for StageSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Fixed-slot chain of optional stages.
pub struct TransformChain {
    stages: [Option<Box<dyn TransformStage>>; StageSlot::COUNT],
}

impl Default for TransformChain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformChain")
            .field("stages", &self.names())
            .finish()
    }
}

impl TransformChain {
    pub fn new() -> Self {
        Self {
            stages: std::array::from_fn(|_| None),
        }
    }

    /// Installs `stage` in `slot`, returning the stage it replaces.
    pub fn set(
        &mut self,
        slot: StageSlot,
        stage: Box<dyn TransformStage>,
    ) -> Option<Box<dyn TransformStage>> {
        debug!("chain: {} <- {}", slot, stage.name());
        self.stages[slot.index()].replace(stage)
    }

    pub fn take(&mut self, slot: StageSlot) -> Option<Box<dyn TransformStage>> {
        self.stages[slot.index()].take()
    }

    pub fn contains(&self, slot: StageSlot) -> bool {
        self.stages[slot.index()].is_some()
    }

    pub fn get(&self, slot: StageSlot) -> Option<&dyn TransformStage> {
        self.stages[slot.index()].as_deref()
    }

    pub fn get_mut(&mut self, slot: StageSlot) -> Option<&mut (dyn TransformStage + 'static)> {
        self.stages[slot.index()].as_deref_mut()
    }

    /// The stage in `slot`, if it is a `T`.
    pub fn stage_mut<T: TransformStage + 'static>(&mut self, slot: StageSlot) -> Option<&mut T> {
        self.get_mut(slot)?.as_any_mut().downcast_mut::<T>()
    }

    /// Names of the installed stages, outbound order.
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().flatten().map(|s| s.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.iter().all(Option::is_none)
    }

    pub fn transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        self.forward(0, pkts, |s, p| s.transform_rtp(p))
    }

    /// Outbound RTP through the stages strictly after `slot`.
    pub fn transform_rtp_after(
        &mut self,
        slot: StageSlot,
        pkts: Vec<RawPacket>,
    ) -> Result<Vec<RawPacket>> {
        self.forward(slot.index() + 1, pkts, |s, p| s.transform_rtp(p))
    }

    pub fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        self.reverse(pkts, |s, p| s.reverse_transform_rtp(p))
    }

    pub fn transform_rtcp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        self.forward(0, pkts, |s, p| s.transform_rtcp(p))
    }

    pub fn transform_rtcp_after(
        &mut self,
        slot: StageSlot,
        pkts: Vec<RawPacket>,
    ) -> Result<Vec<RawPacket>> {
        self.forward(slot.index() + 1, pkts, |s, p| s.transform_rtcp(p))
    }

    pub fn reverse_transform_rtcp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        self.reverse(pkts, |s, p| s.reverse_transform_rtcp(p))
    }

    fn forward<F>(&mut self, start: usize, mut pkts: Vec<RawPacket>, mut f: F) -> Result<Vec<RawPacket>>
    where
        F: FnMut(&mut dyn TransformStage, Vec<RawPacket>) -> Result<Vec<RawPacket>>,
    {
        for stage in self.stages.iter_mut().skip(start).flatten() {
            if pkts.is_empty() {
                break;
            }
            pkts = f(stage.as_mut(), pkts)?;
        }
        Ok(pkts)
    }

    fn reverse<F>(&mut self, mut pkts: Vec<RawPacket>, mut f: F) -> Result<Vec<RawPacket>>
    where
        F: FnMut(&mut dyn TransformStage, Vec<RawPacket>) -> Result<Vec<RawPacket>>,
    {
        for stage in self.stages.iter_mut().rev().flatten() {
            if pkts.is_empty() {
                break;
            }
            pkts = f(stage.as_mut(), pkts)?;
        }
        Ok(pkts)
    }

    pub fn bind_extensions(&mut self, extensions: &ExtensionMap) {
        for stage in self.stages.iter_mut().flatten() {
            stage.bind_extensions(extensions);
        }
    }

    pub fn bind_payload_types(&mut self, payload_types: &PayloadTypeMap) {
        for stage in self.stages.iter_mut().flatten() {
            stage.bind_payload_types(payload_types);
        }
    }

    pub fn set_local_ssrc(&mut self, ssrc: u32) {
        for stage in self.stages.iter_mut().flatten() {
            stage.set_local_ssrc(ssrc);
        }
    }

    /// Earliest deadline of any stage.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.stages
            .iter()
            .flatten()
            .filter_map(|s| s.poll_timeout())
            .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        for stage in self.stages.iter_mut().flatten() {
            stage.handle_timeout(now)?;
        }
        Ok(())
    }

    /// Drains every stage's generated packets, tagged with their origin.
    pub fn drain_injected(&mut self) -> Vec<(StageSlot, InjectedPacket)> {
        let mut out = vec![];
        for (slot, stage) in StageSlot::ORDER.iter().zip(self.stages.iter_mut()) {
            if let Some(stage) = stage {
                while let Some(pkt) = stage.poll_injected() {
                    out.push((*slot, pkt));
                }
            }
        }
        out
    }

    /// Closes and removes every stage.
    pub fn close(&mut self) {
        for stage in self.stages.iter_mut() {
            if let Some(mut stage) = stage.take() {
                stage.close();
            }
        }
    }
}

/// Identity stage.
#[derive(Debug, Default)]
pub struct NoopStage;

impl TransformStage for NoopStage {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::time::Instant;

    use bytes::Bytes;

    use crate::packet::RawPacket;

    pub(crate) fn make_rtp_packet(pt: u8, seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> rtp::Packet {
        rtp::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: pt,
                sequence_number: seq,
                timestamp: ts,
                ssrc,
                ..Default::default()
            },
            payload: Bytes::copy_from_slice(payload),
            padding_size: 0,
        }
    }

    pub(crate) fn make_raw_rtp(pt: u8, seq: u16, ssrc: u32, payload: &[u8]) -> RawPacket {
        let pkt = make_rtp_packet(pt, seq, seq as u32 * 160, ssrc, payload);
        RawPacket::from_rtp(&pkt, Instant::now()).unwrap()
    }

    pub(crate) fn make_raw_rtcp(packets: Vec<Box<dyn rtcp::Packet>>) -> RawPacket {
        RawPacket::from_rtcp(&packets, Instant::now()).unwrap()
    }
}
