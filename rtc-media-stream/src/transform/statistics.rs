//! Feeds [`MediaStreamStats`](crate::stats::MediaStreamStats) from the
//! packets crossing the chain in both directions.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::trace;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::receiver_report::ReceiverReport;
use rtcp::sender_report::SenderReport;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use rtp::sequence::SequenceUnwrapper;
use shared::error::Result;

use super::TransformStage;
use crate::collaborators::RtpTranslator;
use crate::direction::StreamDirection;
use crate::packet::RawPacket;
use crate::stats::{LsrTranslation, RtcpFeedback, RtcpReport, SharedStats};

/// Sequence space of one inbound SSRC, for loss accounting.
#[derive(Debug, Default)]
struct ReceiveSequence {
    unwrapper: SequenceUnwrapper,
    base: Option<i64>,
    highest: i64,
    received: u64,
}

impl ReceiveSequence {
    fn record(&mut self, seq: u16) {
        let ext = self.unwrapper.unwrap(seq);
        match self.base {
            None => {
                self.base = Some(ext);
                self.highest = ext;
            }
            Some(base) if ext < base => self.base = Some(ext),
            Some(_) => self.highest = self.highest.max(ext),
        }
        self.received += 1;
    }

    /// Expected minus received, RFC 3550 appendix A.3. Negative when
    /// duplicates arrived.
    fn lost(&self) -> i64 {
        match self.base {
            Some(base) => (self.highest - base + 1) - self.received as i64,
            None => 0,
        }
    }
}

pub struct StatisticsTransformer {
    stats: SharedStats,
    translator: Option<Arc<dyn RtpTranslator>>,
    receive_sequences: HashMap<u32, ReceiveSequence>,
}

impl StatisticsTransformer {
    pub fn new(stats: SharedStats) -> Self {
        Self {
            stats,
            translator: None,
            receive_sequences: HashMap::new(),
        }
    }

    /// In translator mode, LSR values in received reports refer to sender
    /// reports of other streams and are mapped through their statistics.
    pub fn with_translator(mut self, translator: Arc<dyn RtpTranslator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn set_translator(&mut self, translator: Option<Arc<dyn RtpTranslator>>) {
        self.translator = translator;
    }

    pub fn stats(&self) -> SharedStats {
        Arc::clone(&self.stats)
    }

    fn translate_lsr(&self, feedback: &RtcpFeedback) -> LsrTranslation {
        let Some(translator) = &self.translator else {
            return LsrTranslation::Direct;
        };
        // resolved before our own statistics are locked, the receiving
        // stream may be this one
        match translator.stream_stats_for_receive_ssrc(feedback.ssrc) {
            Some(receiving) => match receiving.lock().emission_to_reception(feedback.lsr) {
                Some(reception) => LsrTranslation::Mapped(reception),
                None => LsrTranslation::Unmapped,
            },
            None => LsrTranslation::Unmapped,
        }
    }

    fn report_blocks_received(&self, feedbacks: Vec<RtcpFeedback>, now: Instant) {
        let translations: Vec<LsrTranslation> =
            feedbacks.iter().map(|f| self.translate_lsr(f)).collect();

        let mut stats = self.stats.lock();
        for (feedback, translation) in feedbacks.iter().zip(translations) {
            stats.rtcp_report_received(feedback, translation, now);
        }
    }

    fn inbound_rtcp(&self, raw: &RawPacket) {
        let Ok(packets) = raw.to_rtcp() else {
            trace!("undecodable rtcp of {} bytes", raw.len());
            return;
        };

        for packet in &packets {
            let any = packet.as_any();
            if let Some(sr) = any.downcast_ref::<SenderReport>() {
                {
                    let mut stats = self.stats.lock();
                    stats.sr_received(sr.ntp_time, raw.now);
                    stats
                        .reports_mut()
                        .report_received(RtcpReport::Sender(sr.clone()));
                }
                self.report_blocks_received(
                    sr.reports.iter().map(RtcpFeedback::from).collect(),
                    raw.now,
                );
            } else if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
                self.stats
                    .lock()
                    .reports_mut()
                    .report_received(RtcpReport::Receiver(rr.clone()));
                self.report_blocks_received(
                    rr.reports.iter().map(RtcpFeedback::from).collect(),
                    raw.now,
                );
            } else if any.downcast_ref::<TransportLayerNack>().is_some() {
                self.stats.lock().nack_received();
            } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
                self.stats.lock().remb_received(remb.bitrate);
            }
        }
    }

    fn outbound_rtcp(&self, raw: &RawPacket) {
        let Ok(packets) = raw.to_rtcp() else {
            return;
        };

        let mut stats = self.stats.lock();
        for packet in &packets {
            let any = packet.as_any();
            let report = if let Some(sr) = any.downcast_ref::<SenderReport>() {
                RtcpReport::Sender(sr.clone())
            } else if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
                RtcpReport::Receiver(rr.clone())
            } else {
                continue;
            };

            for block in report.reception_reports() {
                stats.rtcp_report_sent(&RtcpFeedback::from(block));
            }
            stats.reports_mut().report_sent(report);
        }
    }
}

impl TransformStage for StatisticsTransformer {
    fn name(&self) -> &'static str {
        "statistics"
    }

    fn transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        let mut stats = self.stats.lock();
        for pkt in &pkts {
            stats.record_packet(
                StreamDirection::Upload,
                pkt.ssrc(),
                pkt.sequence_number(),
                pkt.len(),
            );
        }
        Ok(pkts)
    }

    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        for pkt in &pkts {
            self.receive_sequences
                .entry(pkt.ssrc())
                .or_default()
                .record(pkt.sequence_number());
        }
        let lost: i64 = self.receive_sequences.values().map(|s| s.lost().max(0)).sum();

        let mut stats = self.stats.lock();
        for pkt in &pkts {
            stats.record_packet(
                StreamDirection::Download,
                pkt.ssrc(),
                pkt.sequence_number(),
                pkt.len(),
            );
        }
        stats.set_download_lost(lost);
        Ok(pkts)
    }

    fn transform_rtcp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        for raw in &pkts {
            self.outbound_rtcp(raw);
        }
        Ok(pkts)
    }

    fn reverse_transform_rtcp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        for raw in &pkts {
            self.inbound_rtcp(raw);
        }
        Ok(pkts)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
