//! Local termination of RTCP feedback.
//!
//! Receiver reports, REMB and transport-cc feedback are removed from every
//! compound crossing the stage, in both directions, and replaced by reports
//! generated here from what the stream actually sends and receives. Inbound
//! PLI and FIR are removed too and turned into key-frame requests.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use rtcp::header::COUNT_MAX;
use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::transport_feedbacks::transport_layer_cc::TransportLayerCc;
use shared::error::Result;
use shared::time::SystemInstant;
use shared::util::is_newer_seq;

use super::remb::BitrateEstimate;
use super::{InjectedPacket, PayloadTypeMap, TransformStage};
use crate::config::DEFAULT_RTCP_REPORT_INTERVAL_MS;
use crate::format::{FormatRegistry, MediaType};
use crate::packet::RawPacket;

/// Number of packets tracked per u64 entry in the bitmap.
const PACKETS_PER_ENTRY: usize = 64;
const BITMAP_ENTRIES: usize = 128;

/// Largest value of the 24-bit cumulative lost field.
const MAX_TOTAL_LOST: u32 = 0xFF_FFFF;

/// Called with the media SSRC of every key-frame request (PLI or FIR)
/// received.
pub type KeyFrameRequestFn = Box<dyn Fn(u32) + Send + Sync>;

/// Reception state of one remote SSRC, source of its report blocks.
#[derive(Debug)]
struct ReceiverState {
    ssrc: u32,
    /// Received flags of the last 8192 sequence numbers.
    packets: Vec<u64>,
    started: bool,
    seq_num_cycles: u16,
    last_seq_num: u16,
    last_report_seq_num: u16,
    last_rtp_time_rtp: u32,
    last_rtp_time_time: Option<Instant>,
    jitter: f64,
    last_sender_report: u32,
    last_sender_report_time: Option<Instant>,
    total_lost: u32,
}

impl ReceiverState {
    fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            packets: vec![0u64; BITMAP_ENTRIES],
            started: false,
            seq_num_cycles: 0,
            last_seq_num: 0,
            last_report_seq_num: 0,
            last_rtp_time_rtp: 0,
            last_rtp_time_time: None,
            jitter: 0.0,
            last_sender_report: 0,
            last_sender_report_time: None,
            total_lost: 0,
        }
    }

    fn bit(seq: u16) -> (usize, u64) {
        let pos = (seq as usize) % (BITMAP_ENTRIES * PACKETS_PER_ENTRY);
        (pos / PACKETS_PER_ENTRY, 1u64 << (pos % PACKETS_PER_ENTRY))
    }

    fn set_received(&mut self, seq: u16) {
        let (entry, mask) = Self::bit(seq);
        self.packets[entry] |= mask;
    }

    fn del_received(&mut self, seq: u16) {
        let (entry, mask) = Self::bit(seq);
        self.packets[entry] &= !mask;
    }

    fn get_received(&self, seq: u16) -> bool {
        let (entry, mask) = Self::bit(seq);
        self.packets[entry] & mask != 0
    }

    fn process_rtp(&mut self, seq: u16, timestamp: u32, now: Instant, clock_rate: u32) {
        self.set_received(seq);

        if !self.started {
            self.started = true;
            self.last_seq_num = seq;
            self.last_report_seq_num = seq.wrapping_sub(1);
            self.last_rtp_time_rtp = timestamp;
            self.last_rtp_time_time = Some(now);
            return;
        }

        if is_newer_seq(seq, self.last_seq_num) {
            if seq < self.last_seq_num {
                self.seq_num_cycles = self.seq_num_cycles.wrapping_add(1);
            }

            let mut i = self.last_seq_num.wrapping_add(1);
            while i != seq {
                self.del_received(i);
                i = i.wrapping_add(1);
            }
            self.last_seq_num = seq;
        }

        // RFC 3550 section 6.4.1
        if let Some(last_time) = self.last_rtp_time_time {
            let d = now.saturating_duration_since(last_time).as_secs_f64() * clock_rate as f64
                - (timestamp as f64 - self.last_rtp_time_rtp as f64);
            self.jitter += (d.abs() - self.jitter) / 16.0;
        }
        self.last_rtp_time_rtp = timestamp;
        self.last_rtp_time_time = Some(now);
    }

    fn process_sender_report(&mut self, now: Instant, sr: &SenderReport) {
        self.last_sender_report = (sr.ntp_time >> 16) as u32;
        self.last_sender_report_time = Some(now);
    }

    fn report_block(&mut self, now: Instant) -> ReceptionReport {
        let total_since_report = self.last_seq_num.wrapping_sub(self.last_report_seq_num);
        let mut lost_since_report = 0u32;
        let mut i = self.last_report_seq_num.wrapping_add(1);
        while i != self.last_seq_num {
            if !self.get_received(i) {
                lost_since_report += 1;
            }
            i = i.wrapping_add(1);
        }

        self.total_lost = self
            .total_lost
            .saturating_add(lost_since_report)
            .min(MAX_TOTAL_LOST);
        let lost_since_report = lost_since_report.min(MAX_TOTAL_LOST);

        let delay = match self.last_sender_report_time {
            Some(sr_time) => {
                (now.saturating_duration_since(sr_time).as_secs_f64() * 65536.0) as u32
            }
            None => 0,
        };

        let fraction_lost = if total_since_report > 0 {
            (lost_since_report as f64 * 256.0 / total_since_report as f64) as u8
        } else {
            0
        };

        self.last_report_seq_num = self.last_seq_num;

        ReceptionReport {
            ssrc: self.ssrc,
            fraction_lost,
            total_lost: self.total_lost,
            last_sequence_number: (self.seq_num_cycles as u32) << 16 | self.last_seq_num as u32,
            jitter: self.jitter as u32,
            last_sender_report: self.last_sender_report,
            delay,
        }
    }
}

/// Send-side counters of the local SSRC, source of sender reports.
#[derive(Debug, Default)]
struct SenderState {
    payload_type: Option<u8>,
    packets: u32,
    octets: u32,
    last_rtp_time_rtp: u32,
    last_rtp_time_time: Option<Instant>,
    sent_since_report: bool,
}

impl SenderState {
    fn process_rtp(&mut self, pkt: &RawPacket) {
        // time is taken on the first packet of each frame only
        if self.last_rtp_time_time.is_none() || pkt.timestamp() != self.last_rtp_time_rtp {
            self.last_rtp_time_rtp = pkt.timestamp();
            self.last_rtp_time_time = Some(pkt.now);
        }
        self.payload_type = Some(pkt.payload_type());
        self.packets = self.packets.wrapping_add(1);
        self.octets = self.octets.wrapping_add(pkt.payload_length() as u32);
        self.sent_since_report = true;
    }

    fn rtp_time(&self, now: Instant, clock_rate: u32) -> u32 {
        match self.last_rtp_time_time {
            Some(at) => self.last_rtp_time_rtp.wrapping_add(
                (now.saturating_duration_since(at).as_secs_f64() * clock_rate as f64) as u32,
            ),
            None => 0,
        }
    }
}

pub struct RtcpTerminationBuilder {
    media_type: MediaType,
    interval: Duration,
    anchor: Option<SystemInstant>,
    estimate: Option<BitrateEstimate>,
    key_frame_handler: Option<KeyFrameRequestFn>,
    registry: Option<Arc<dyn FormatRegistry>>,
}

impl RtcpTerminationBuilder {
    pub fn new(media_type: MediaType) -> Self {
        Self {
            media_type,
            interval: Duration::from_millis(DEFAULT_RTCP_REPORT_INTERVAL_MS),
            anchor: None,
            estimate: None,
            key_frame_handler: None,
            registry: None,
        }
    }

    /// Resolves the clock rate of payload types with no dynamic binding,
    /// such as the RFC 3551 static ones.
    pub fn with_format_registry(mut self, registry: Arc<dyn FormatRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Clock used for the NTP timestamp of sender reports. It must be the
    /// anchor of the stream statistics for echoed LSR values to match.
    pub fn with_anchor(mut self, anchor: SystemInstant) -> Self {
        self.anchor = Some(anchor);
        self
    }

    /// Adds a REMB to every report once the estimate has a value.
    pub fn with_bitrate_estimate(mut self, estimate: BitrateEstimate) -> Self {
        self.estimate = Some(estimate);
        self
    }

    pub fn with_key_frame_handler(mut self, handler: KeyFrameRequestFn) -> Self {
        self.key_frame_handler = Some(handler);
        self
    }

    pub fn build(self, now: Instant) -> RtcpTermination {
        RtcpTermination {
            default_clock_rate: self.media_type.default_clock_rate(),
            clock_rates: HashMap::new(),
            registry: self.registry,
            interval: self.interval,
            anchor: self.anchor.unwrap_or_else(SystemInstant::now),
            estimate: self.estimate,
            key_frame_handler: self.key_frame_handler,
            local_ssrc: None,
            receivers: BTreeMap::new(),
            sender: SenderState::default(),
            eto: now + self.interval,
            write_queue: VecDeque::new(),
            reports_sent: 0,
            key_frame_requests: 0,
        }
    }
}

pub struct RtcpTermination {
    default_clock_rate: u32,
    clock_rates: HashMap<u8, u32>,
    registry: Option<Arc<dyn FormatRegistry>>,
    interval: Duration,
    anchor: SystemInstant,
    estimate: Option<BitrateEstimate>,
    key_frame_handler: Option<KeyFrameRequestFn>,
    local_ssrc: Option<u32>,
    receivers: BTreeMap<u32, ReceiverState>,
    sender: SenderState,
    eto: Instant,
    write_queue: VecDeque<InjectedPacket>,
    reports_sent: u64,
    key_frame_requests: u64,
}

impl RtcpTermination {
    pub fn reports_sent(&self) -> u64 {
        self.reports_sent
    }

    pub fn key_frame_requests(&self) -> u64 {
        self.key_frame_requests
    }

    /// Stops reporting on `ssrc`, after a BYE or a receive timeout.
    pub fn remove_ssrc(&mut self, ssrc: u32) {
        self.receivers.remove(&ssrc);
    }

    /// Clock rate of `payload_type`: the dynamic binding, then the static
    /// registry, then the media type default.
    fn clock_rate(&mut self, payload_type: u8) -> u32 {
        if let Some(rate) = self.clock_rates.get(&payload_type) {
            return *rate;
        }
        let rate = self
            .registry
            .as_ref()
            .and_then(|r| r.format(payload_type))
            .map(|f| f.clock_rate)
            .filter(|rate| *rate > 0)
            .unwrap_or(self.default_clock_rate);
        self.clock_rates.insert(payload_type, rate);
        rate
    }

    fn request_key_frame(&mut self, media_ssrc: u32) {
        debug!("key frame requested for ssrc {media_ssrc}");
        self.key_frame_requests += 1;
        if let Some(handler) = &self.key_frame_handler {
            handler(media_ssrc);
        }
    }

    /// Removes terminated packets from `raw`. Returns `None` when nothing is
    /// left.
    fn filter(&mut self, raw: RawPacket, inbound: bool) -> Result<Option<RawPacket>> {
        let packets = match raw.to_rtcp() {
            Ok(packets) => packets,
            Err(err) => {
                trace!("passing undecodable rtcp: {err}");
                return Ok(Some(raw));
            }
        };

        let total = packets.len();
        let mut kept = Vec::with_capacity(total);
        for packet in packets {
            let any = packet.as_any();
            if any.is::<ReceiverReport>()
                || any.is::<ReceiverEstimatedMaximumBitrate>()
                || any.is::<TransportLayerCc>()
            {
                continue;
            }

            if inbound {
                if let Some(sr) = any.downcast_ref::<SenderReport>() {
                    self.receivers
                        .entry(sr.ssrc)
                        .or_insert_with(|| ReceiverState::new(sr.ssrc))
                        .process_sender_report(raw.now, sr);
                } else if let Some(pli) = any.downcast_ref::<PictureLossIndication>() {
                    self.request_key_frame(pli.media_ssrc);
                    continue;
                } else if let Some(fir) = any.downcast_ref::<FullIntraRequest>() {
                    if fir.fir.is_empty() {
                        self.request_key_frame(fir.media_ssrc);
                    }
                    for entry in &fir.fir {
                        self.request_key_frame(entry.ssrc);
                    }
                    continue;
                }
            }
            kept.push(packet);
        }

        if kept.is_empty() {
            return Ok(None);
        }
        if kept.len() == total {
            return Ok(Some(raw));
        }
        Ok(Some(RawPacket::from_rtcp(&kept, raw.now)?))
    }

    fn filter_all(&mut self, pkts: Vec<RawPacket>, inbound: bool) -> Result<Vec<RawPacket>> {
        let mut out = Vec::with_capacity(pkts.len());
        for raw in pkts {
            if let Some(raw) = self.filter(raw, inbound)? {
                out.push(raw);
            }
        }
        Ok(out)
    }

    /// SR (when sending) or RRs for the sources heard, 31 blocks per packet,
    /// followed by a REMB when an estimate exists.
    fn generate_report(&mut self, now: Instant) -> Result<Option<RawPacket>> {
        let Some(local_ssrc) = self.local_ssrc else {
            return Ok(None);
        };

        let blocks: Vec<ReceptionReport> = self
            .receivers
            .values_mut()
            .filter(|r| r.started)
            .map(|r| r.report_block(now))
            .collect();
        let mut chunks = blocks.chunks(COUNT_MAX).map(<[ReceptionReport]>::to_vec);

        let mut packets: Vec<Box<dyn rtcp::Packet>> = vec![];
        if self.sender.sent_since_report {
            self.sender.sent_since_report = false;
            let clock_rate = match self.sender.payload_type {
                Some(pt) => self.clock_rate(pt),
                None => self.default_clock_rate,
            };
            packets.push(Box::new(SenderReport {
                ssrc: local_ssrc,
                ntp_time: self.anchor.ntp(now),
                rtp_time: self.sender.rtp_time(now, clock_rate),
                packet_count: self.sender.packets,
                octet_count: self.sender.octets,
                reports: chunks.next().unwrap_or_default(),
                ..Default::default()
            }));
        }
        for reports in chunks {
            packets.push(Box::new(ReceiverReport {
                ssrc: local_ssrc,
                reports,
                ..Default::default()
            }));
        }

        if packets.is_empty() {
            trace!("nothing to report");
            return Ok(None);
        }

        if let Some(bitrate) = self.estimate.as_ref().and_then(BitrateEstimate::latest_estimate) {
            let ssrcs = self.estimate.as_ref().map(BitrateEstimate::ssrcs).unwrap_or_default();
            packets.push(Box::new(ReceiverEstimatedMaximumBitrate {
                sender_ssrc: local_ssrc,
                bitrate,
                ssrcs,
            }));
        }

        Ok(Some(RawPacket::from_rtcp(&packets, now)?))
    }
}

impl TransformStage for RtcpTermination {
    fn name(&self) -> &'static str {
        "rtcp-termination"
    }

    fn transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        for pkt in &pkts {
            if self.local_ssrc.is_none_or(|ssrc| ssrc == pkt.ssrc()) {
                self.sender.process_rtp(pkt);
            }
        }
        Ok(pkts)
    }

    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        for pkt in &pkts {
            let clock_rate = self.clock_rate(pkt.payload_type());
            self.receivers
                .entry(pkt.ssrc())
                .or_insert_with(|| ReceiverState::new(pkt.ssrc()))
                .process_rtp(pkt.sequence_number(), pkt.timestamp(), pkt.now, clock_rate);
        }
        Ok(pkts)
    }

    fn transform_rtcp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        self.filter_all(pkts, false)
    }

    fn reverse_transform_rtcp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        self.filter_all(pkts, true)
    }

    fn bind_payload_types(&mut self, payload_types: &PayloadTypeMap) {
        self.clock_rates = payload_types
            .iter()
            .filter(|(_, format)| format.clock_rate > 0)
            .map(|(pt, format)| (*pt, format.clock_rate))
            .collect();
    }

    fn set_local_ssrc(&mut self, ssrc: u32) {
        if self.local_ssrc.is_some_and(|old| old != ssrc) {
            // counters belong to the old source
            self.sender = SenderState::default();
        }
        self.local_ssrc = Some(ssrc);
    }

    fn poll_timeout(&self) -> Option<Instant> {
        Some(self.eto)
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if now < self.eto {
            return Ok(());
        }
        self.eto = now + self.interval;

        match self.generate_report(now) {
            Ok(Some(report)) => {
                self.reports_sent += 1;
                self.write_queue.push_back(InjectedPacket::rtcp(report));
            }
            Ok(None) => {}
            Err(err) => warn!("failed to build rtcp report: {err}"),
        }
        Ok(())
    }

    fn poll_injected(&mut self) -> Option<InjectedPacket> {
        self.write_queue.pop_front()
    }

    fn close(&mut self) {
        self.receivers.clear();
        self.write_queue.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{MediaFormat, StaticFormatRegistry};
    use crate::transform::remb::RemoteBitrateEstimator;
    use crate::transform::test_util::{make_raw_rtcp, make_raw_rtp};
    use rtcp::payload_feedbacks::full_intra_request::FirEntry;
    use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
    use std::sync::Arc;

    use parking_lot::Mutex;

    fn rtp_at(seq: u16, ssrc: u32, now: Instant) -> RawPacket {
        let mut pkt = make_raw_rtp(0, seq, ssrc, &[0; 10]);
        pkt.now = now;
        pkt
    }

    fn injected(stage: &mut RtcpTermination) -> Vec<Box<dyn rtcp::Packet>> {
        let mut out = vec![];
        while let Some(p) = stage.poll_injected() {
            out.extend(p.packet.to_rtcp().unwrap());
        }
        out
    }

    #[test]
    fn test_termination_filters_inbound_feedback() -> Result<()> {
        let requested = Arc::new(Mutex::new(vec![]));
        let requested2 = Arc::clone(&requested);
        let mut stage = RtcpTerminationBuilder::new(MediaType::Video)
            .with_key_frame_handler(Box::new(move |ssrc| requested2.lock().push(ssrc)))
            .build(Instant::now());

        let compound: Vec<Box<dyn rtcp::Packet>> = vec![
            Box::new(SenderReport {
                ssrc: 0xAA,
                ..Default::default()
            }),
            Box::new(ReceiverReport {
                ssrc: 0xAA,
                ..Default::default()
            }),
            Box::new(ReceiverEstimatedMaximumBitrate {
                sender_ssrc: 0xAA,
                bitrate: 1000,
                ssrcs: vec![1],
            }),
            Box::new(PictureLossIndication {
                sender_ssrc: 0xAA,
                media_ssrc: 0x11,
            }),
            Box::new(FullIntraRequest {
                sender_ssrc: 0xAA,
                media_ssrc: 0,
                fir: vec![FirEntry {
                    ssrc: 0x22,
                    sequence_number: 1,
                }],
            }),
            Box::new(TransportLayerNack {
                sender_ssrc: 0xAA,
                media_ssrc: 0x11,
                nacks: vec![],
            }),
        ];
        let only_rr: Vec<Box<dyn rtcp::Packet>> = vec![Box::new(ReceiverReport {
            ssrc: 0xAA,
            ..Default::default()
        })];

        let out = stage.reverse_transform_rtcp(vec![
            make_raw_rtcp(compound),
            make_raw_rtcp(only_rr),
        ])?;

        assert_eq!(out.len(), 1);
        let kept = out[0].to_rtcp()?;
        assert_eq!(kept.len(), 2);
        assert!(kept[0].as_any().is::<SenderReport>());
        assert!(kept[1].as_any().is::<TransportLayerNack>());
        assert_eq!(*requested.lock(), vec![0x11, 0x22]);
        assert_eq!(stage.key_frame_requests(), 2);
        Ok(())
    }

    #[test]
    fn test_termination_filters_outbound_feedback() -> Result<()> {
        let mut stage = RtcpTerminationBuilder::new(MediaType::Video).build(Instant::now());

        let sr: Box<dyn rtcp::Packet> = Box::new(SenderReport {
            ssrc: 1,
            ..Default::default()
        });
        let rr: Box<dyn rtcp::Packet> = Box::new(ReceiverReport {
            ssrc: 1,
            ..Default::default()
        });
        let sr_raw = make_raw_rtcp(vec![sr]);

        let out = stage.transform_rtcp(vec![sr_raw.clone(), make_raw_rtcp(vec![rr])])?;
        assert_eq!(out, vec![sr_raw]);
        Ok(())
    }

    #[test]
    fn test_termination_receiver_report() -> Result<()> {
        let t0 = Instant::now();
        let anchor = SystemInstant::now();
        let mut estimator = RemoteBitrateEstimator::default();
        let mut stage = RtcpTerminationBuilder::new(MediaType::Audio)
            .with_anchor(anchor)
            .with_bitrate_estimate(estimator.estimate())
            .build(t0);
        stage.set_local_ssrc(0x1234);

        // nothing heard yet
        assert_eq!(stage.poll_timeout(), Some(t0 + Duration::from_millis(500)));
        stage.handle_timeout(t0 + Duration::from_millis(500))?;
        assert!(injected(&mut stage).is_empty());

        let pkts = vec![
            rtp_at(1, 0xAA, t0),
            rtp_at(2, 0xAA, t0),
            rtp_at(4, 0xAA, t0),
        ];
        let pkts = estimator.reverse_transform_rtp(pkts)?;
        stage.reverse_transform_rtp(pkts)?;

        let sr: Box<dyn rtcp::Packet> = Box::new(SenderReport {
            ssrc: 0xAA,
            ntp_time: 0x0102_0304_0506_0708,
            ..Default::default()
        });
        let mut sr = make_raw_rtcp(vec![sr]);
        sr.now = t0 + Duration::from_millis(500);
        stage.reverse_transform_rtcp(vec![sr])?;

        stage.handle_timeout(t0 + Duration::from_millis(1000))?;
        let report = injected(&mut stage);
        assert_eq!(report.len(), 2);

        let rr = report[0]
            .as_any()
            .downcast_ref::<ReceiverReport>()
            .unwrap();
        assert_eq!(rr.ssrc, 0x1234);
        assert_eq!(rr.reports.len(), 1);
        let block = &rr.reports[0];
        assert_eq!(block.ssrc, 0xAA);
        assert_eq!(block.last_sequence_number, 4);
        assert_eq!(block.total_lost, 1);
        assert_eq!(block.fraction_lost, 64);
        assert_eq!(block.last_sender_report, 0x0304_0506);
        assert_eq!(block.delay, 32768);

        let remb = report[1]
            .as_any()
            .downcast_ref::<ReceiverEstimatedMaximumBitrate>()
            .unwrap();
        assert_eq!(remb.sender_ssrc, 0x1234);
        assert_eq!(remb.ssrcs, vec![0xAA]);
        assert_eq!(stage.reports_sent(), 1);
        Ok(())
    }

    #[test]
    fn test_termination_sender_report() -> Result<()> {
        let t0 = Instant::now();
        let anchor = SystemInstant::now();
        let mut stage = RtcpTerminationBuilder::new(MediaType::Audio)
            .with_anchor(anchor)
            .build(t0);
        stage.set_local_ssrc(0x1234);

        stage.transform_rtp(vec![rtp_at(1, 0x1234, t0), rtp_at(2, 0x1234, t0)])?;
        stage.reverse_transform_rtp(vec![rtp_at(9, 0xAA, t0)])?;

        let at = t0 + Duration::from_millis(500);
        stage.handle_timeout(at)?;
        let report = injected(&mut stage);
        assert_eq!(report.len(), 1);
        let sr = report[0].as_any().downcast_ref::<SenderReport>().unwrap();
        assert_eq!(sr.ssrc, 0x1234);
        assert_eq!(sr.packet_count, 2);
        assert_eq!(sr.octet_count, 20);
        assert_eq!(sr.ntp_time, anchor.ntp(at));
        // timestamp of seq 2 plus 500 ms at 48 kHz
        assert_eq!(sr.rtp_time, 320 + 24000);
        assert_eq!(sr.reports.len(), 1);

        // not sending any more: plain receiver report
        stage.handle_timeout(at + Duration::from_millis(500))?;
        let report = injected(&mut stage);
        assert!(report[0].as_any().is::<ReceiverReport>());
        Ok(())
    }

    #[test]
    fn test_termination_uses_static_payload_clock_rate() -> Result<()> {
        let t0 = Instant::now();
        let anchor = SystemInstant::now();
        let mut stage = RtcpTerminationBuilder::new(MediaType::Audio)
            .with_anchor(anchor)
            .with_format_registry(Arc::new(StaticFormatRegistry::rfc3551()))
            .build(t0);
        stage.set_local_ssrc(0x1234);

        // PCMU at 8 kHz: 160 samples every 20 ms, no jitter at all
        let pkts: Vec<RawPacket> = (1..=50u16)
            .map(|seq| rtp_at(seq, 0xAA, t0 + Duration::from_millis(20 * seq as u64)))
            .collect();
        stage.reverse_transform_rtp(pkts)?;
        stage.transform_rtp(vec![rtp_at(1, 0x1234, t0), rtp_at(2, 0x1234, t0)])?;

        let at = t0 + Duration::from_millis(500);
        stage.handle_timeout(at)?;
        let report = injected(&mut stage);
        let sr = report[0].as_any().downcast_ref::<SenderReport>().unwrap();
        // timestamp of seq 2 plus 500 ms at 8 kHz
        assert_eq!(sr.rtp_time, 320 + 4000);
        assert_eq!(sr.reports.len(), 1);
        assert_eq!(sr.reports[0].ssrc, 0xAA);
        assert!(sr.reports[0].jitter <= 1, "jitter {}", sr.reports[0].jitter);
        Ok(())
    }

    #[test]
    fn test_termination_dynamic_binding_overrides_registry() -> Result<()> {
        let t0 = Instant::now();
        let mut stage = RtcpTerminationBuilder::new(MediaType::Audio)
            .with_format_registry(Arc::new(StaticFormatRegistry::rfc3551()))
            .build(t0);
        stage.set_local_ssrc(0x1234);
        assert_eq!(stage.clock_rate(0), 8000);
        assert_eq!(stage.clock_rate(111), 48000);

        let mut payload_types = PayloadTypeMap::new();
        payload_types.insert(0, MediaFormat::new("opus", 16000, MediaType::Audio));
        stage.bind_payload_types(&payload_types);
        assert_eq!(stage.clock_rate(0), 16000);
        Ok(())
    }

    #[test]
    fn test_termination_splits_report_blocks() -> Result<()> {
        let t0 = Instant::now();
        let mut stage = RtcpTerminationBuilder::new(MediaType::Video).build(t0);
        stage.set_local_ssrc(1);

        let pkts: Vec<RawPacket> = (0..40u32).map(|i| rtp_at(1, 0x100 + i, t0)).collect();
        stage.reverse_transform_rtp(pkts)?;

        stage.handle_timeout(t0 + Duration::from_millis(500))?;
        let counts: Vec<usize> = injected(&mut stage)
            .iter()
            .map(|p| p.as_any().downcast_ref::<ReceiverReport>().unwrap().reports.len())
            .collect();
        assert_eq!(counts, vec![31, 9]);

        stage.remove_ssrc(0x100);
        stage.handle_timeout(t0 + Duration::from_millis(1000))?;
        let counts: Vec<usize> = injected(&mut stage)
            .iter()
            .map(|p| p.as_any().downcast_ref::<ReceiverReport>().unwrap().reports.len())
            .collect();
        assert_eq!(counts, vec![31, 8]);
        Ok(())
    }
}
