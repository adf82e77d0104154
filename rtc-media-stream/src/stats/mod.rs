//! Smoothed quality metrics of one media stream.
//!
//! Raw counters are fed by the statistics stage as packets cross the chain;
//! loss, discard and bitrate figures are recomputed by an explicit
//! [`MediaStreamStats::update_stats`] pass and smoothed with an EWMA whose
//! coefficient grows with the number of packets since the previous pass.
//! Upload loss, upload jitter and the round trip time come from reception
//! reports sent by the remote peer.

pub mod reports;
pub mod rtt;
pub mod track;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::trace;
use parking_lot::Mutex;
use rtcp::reception_report::ReceptionReport;
use shared::time::{SystemInstant, ntp_to_short};

use crate::direction::StreamDirection;
use crate::format::MediaType;

pub use reports::{ReportOrigin, RtcpReport, RtcpReportListener, RtcpReports};
pub use rtt::{EmissionLru, LsrTranslation, RttEstimator, compute_rtt_ms};
pub use track::{SsrcStats, TrackStats};

/// Statistics shared between a stream, its statistics stage and a translator.
pub type SharedStats = Arc<Mutex<MediaStreamStats>>;

/// Packet cadence assumed when nothing arrived since the last update.
const SILENT_STEP_MS: i64 = 20;

/// Moves `last` towards `new` by `min(1, 0.01 * steps)`.
pub fn compute_ewma(steps: i64, last: f64, new: f64) -> f64 {
    let coeff = (0.01 * steps as f64).clamp(0.0, 1.0);
    last * (1.0 - coeff) + new * coeff
}

/// Loss rate in percent; zero when nothing was expected.
pub fn compute_percent_loss(lost: i64, received: i64) -> f64 {
    let expected = lost + received;
    if expected == 0 {
        0.0
    } else {
        100.0 * lost as f64 / expected as f64
    }
}

/// Bitrate in kbit/s of `bytes` transferred during `interval_ms`.
pub fn compute_rate_kbps(bytes: u64, interval_ms: i64) -> f64 {
    if interval_ms <= 0 {
        0.0
    } else {
        bytes as f64 * 8.0 / interval_ms as f64
    }
}

/// Converts a jitter in RTP timestamp units to milliseconds.
pub fn jitter_ms(units: f64, clock_rate: u32) -> Option<f64> {
    if clock_rate == 0 {
        None
    } else {
        Some(units / clock_rate as f64 * 1000.0)
    }
}

/// One reception report block as seen by the statistics.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RtcpFeedback {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub extended_highest_seq: u32,
    pub jitter: u32,
    pub lsr: u32,
    pub dlsr: u32,
}

impl From<&ReceptionReport> for RtcpFeedback {
    fn from(report: &ReceptionReport) -> Self {
        Self {
            ssrc: report.ssrc,
            fraction_lost: report.fraction_lost,
            cumulative_lost: report.total_lost,
            extended_highest_seq: report.last_sequence_number,
            jitter: report.jitter,
            lsr: report.last_sender_report,
            dlsr: report.delay,
        }
    }
}

/// Counters and smoothed values of one direction.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DirectionStats {
    /// Running counters, fed as packets pass.
    pub packets: u64,
    pub bytes: u64,
    pub lost: i64,
    pub discarded: u64,

    /// Smoothed values, recomputed by `update_stats`.
    pub percent_loss: f64,
    pub percent_discarded: f64,
    pub rate_kbps: f64,
    pub jitter_rtp_units: f64,

    // values saved by the previous update
    nb_packets: u64,
    nb_bytes: u64,
    nb_lost: i64,
    nb_discarded: u64,
}

impl DirectionStats {
    pub fn nb_packets(&self) -> u64 {
        self.nb_packets
    }

    pub fn nb_bytes(&self) -> u64 {
        self.nb_bytes
    }

    pub fn nb_lost(&self) -> i64 {
        self.nb_lost
    }

    pub fn nb_discarded(&self) -> u64 {
        self.nb_discarded
    }

    fn update_nb_loss(&mut self, new_lost: i64, steps: i64) {
        let percent = compute_percent_loss(new_lost, steps - new_lost);
        self.percent_loss = compute_ewma(steps, self.percent_loss, percent);
        self.nb_lost += new_lost;
    }

    fn update_nb_discarded(&mut self, new_discarded: u64, steps: i64) {
        let new_discarded = new_discarded as i64;
        let percent = compute_percent_loss(new_discarded, steps - new_discarded);
        self.percent_discarded = compute_ewma(steps, self.percent_discarded, percent);
        self.nb_discarded += new_discarded as u64;
    }
}

/// Last reception report seen for one of our outbound SSRCs.
#[derive(Debug, Default, Copy, Clone)]
struct UploadFeedback {
    extended_highest_seq: i64,
    cumulative_lost: i64,
}

/// Minimum, maximum and mean of a series of jitter samples.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
struct JitterSummary {
    min: Option<u32>,
    max: Option<u32>,
    sum: u64,
    count: u64,
}

impl JitterSummary {
    fn record(&mut self, units: u32) {
        self.min = Some(self.min.map_or(units, |m| m.min(units)));
        self.max = Some(self.max.map_or(units, |m| m.max(units)));
        self.sum += units as u64;
        self.count += 1;
    }

    fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }
}

/// Quality metrics of one stream, for both directions.
#[derive(Debug)]
pub struct MediaStreamStats {
    anchor: SystemInstant,
    clock_rate: u32,
    directions: [DirectionStats; 2],
    update_time: Instant,
    upload_feedback: HashMap<u32, UploadFeedback>,
    remote_jitter: JitterSummary,
    local_jitter: JitterSummary,
    rtt: RttEstimator,
    nb_nack_received: u64,
    nb_remb_received: u64,
    last_remb_bitrate: Option<u64>,
    nb_fec_received: u64,
    reports: RtcpReports,
    tracks: TrackStats,
}

impl MediaStreamStats {
    pub fn new(media_type: MediaType) -> Self {
        Self::with_anchor(media_type, SystemInstant::now())
    }

    /// Uses `anchor` to convert instants into NTP time. Stages generating
    /// sender reports must share it, otherwise echoed LSR values do not line
    /// up with the local clock.
    pub fn with_anchor(media_type: MediaType, anchor: SystemInstant) -> Self {
        Self {
            anchor,
            clock_rate: media_type.default_clock_rate(),
            directions: Default::default(),
            update_time: Instant::now(),
            upload_feedback: HashMap::new(),
            remote_jitter: JitterSummary::default(),
            local_jitter: JitterSummary::default(),
            rtt: RttEstimator::new(),
            nb_nack_received: 0,
            nb_remb_received: 0,
            last_remb_bitrate: None,
            nb_fec_received: 0,
            reports: RtcpReports::new(),
            tracks: TrackStats::new(),
        }
    }

    pub fn anchor(&self) -> SystemInstant {
        self.anchor
    }

    /// Sets the clock rate of the negotiated format, used to convert jitter.
    pub fn set_clock_rate(&mut self, clock_rate: u32) {
        self.clock_rate = clock_rate;
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn direction(&self, direction: StreamDirection) -> &DirectionStats {
        &self.directions[direction.index()]
    }

    pub fn last_update_time(&self) -> Instant {
        self.update_time
    }

    pub(crate) fn record_packet(
        &mut self,
        direction: StreamDirection,
        ssrc: u32,
        seq: u16,
        bytes: usize,
    ) {
        let d = &mut self.directions[direction.index()];
        d.packets += 1;
        d.bytes += bytes as u64;
        self.tracks.record_packet(direction, ssrc, seq, bytes);
    }

    /// Sets the cumulative number of packets lost on the receive side.
    pub(crate) fn set_download_lost(&mut self, lost: i64) {
        self.directions[StreamDirection::Download.index()].lost = lost;
    }

    pub(crate) fn record_discarded(&mut self, count: u64) {
        self.directions[StreamDirection::Download.index()].discarded += count;
    }

    pub(crate) fn record_fec(&mut self) {
        self.nb_fec_received += 1;
    }

    pub(crate) fn nack_received(&mut self) {
        self.nb_nack_received += 1;
    }

    pub(crate) fn remb_received(&mut self, bitrate: u64) {
        self.nb_remb_received += 1;
        self.last_remb_bitrate = Some(bitrate);
    }

    /// Recomputes loss, discard and bitrate for both directions.
    pub fn update_stats(&mut self, now: Instant) {
        let interval_ms = now.saturating_duration_since(self.update_time).as_millis() as i64;

        for direction in [StreamDirection::Download, StreamDirection::Upload] {
            let d = &mut self.directions[direction.index()];

            let mut steps = d.packets as i64 - d.nb_packets as i64;
            if steps == 0 {
                steps = interval_ms / SILENT_STEP_MS;
            }

            // upload loss only moves with received reports
            if direction == StreamDirection::Download {
                let new_lost = d.lost - d.nb_lost;
                d.update_nb_loss(new_lost, steps + new_lost);
                let new_discarded = d.discarded - d.nb_discarded;
                d.update_nb_discarded(new_discarded, steps + new_discarded as i64);
            }

            let rate = compute_rate_kbps(d.bytes - d.nb_bytes, interval_ms);
            d.rate_kbps = compute_ewma(steps, d.rate_kbps, rate);

            d.nb_packets = d.packets;
            d.nb_bytes = d.bytes;

            trace!(
                "{} stats: loss {:.2}% rate {:.1} kbps",
                direction, d.percent_loss, d.rate_kbps
            );
        }

        self.update_time = now;
    }

    /// Applies a reception report block the remote peer sent about our
    /// outbound stream. `translation` tells how to interpret its LSR.
    pub fn rtcp_report_received(
        &mut self,
        feedback: &RtcpFeedback,
        translation: LsrTranslation,
        now: Instant,
    ) {
        self.update_jitter(StreamDirection::Upload, feedback);
        self.remote_jitter.record(feedback.jitter);

        // sequence and loss deltas are per reported source
        let last = self.upload_feedback.entry(feedback.ssrc).or_default();
        let steps = feedback.extended_highest_seq as i64 - last.extended_highest_seq;
        let new_lost = feedback.cumulative_lost as i64 - last.cumulative_lost;
        *last = UploadFeedback {
            extended_highest_seq: feedback.extended_highest_seq as i64,
            cumulative_lost: feedback.cumulative_lost as i64,
        };
        let total_lost = self.upload_feedback.values().map(|f| f.cumulative_lost).sum::<i64>();

        let upload = &mut self.directions[StreamDirection::Upload.index()];
        upload.lost = total_lost;
        upload.update_nb_loss(new_lost, steps);

        self.tracks
            .update_fraction_lost(feedback.ssrc, feedback.fraction_lost);

        let now_short = self.anchor.ntp_short(now);
        if let Some(rtt) = self
            .rtt
            .estimate(feedback.lsr, feedback.dlsr, translation, now_short)
        {
            self.tracks.update_rtt(feedback.ssrc, rtt);
        }
    }

    /// Applies a reception report block we sent about an inbound stream.
    pub fn rtcp_report_sent(&mut self, feedback: &RtcpFeedback) {
        self.update_jitter(StreamDirection::Download, feedback);
        self.local_jitter.record(feedback.jitter);
    }

    fn update_jitter(&mut self, direction: StreamDirection, feedback: &RtcpFeedback) {
        self.directions[direction.index()].jitter_rtp_units = feedback.jitter as f64;
        if let Some(ms) = jitter_ms(feedback.jitter as f64, self.clock_rate) {
            self.tracks.update_jitter(direction, feedback.ssrc, ms);
        }
    }

    /// Records the local reception time of a sender report whose NTP
    /// timestamp is `emission_ntp`.
    pub fn sr_received(&mut self, emission_ntp: u64, now: Instant) {
        let reception = self.anchor.ntp_short(now);
        self.rtt.record_emission(ntp_to_short(emission_ntp), reception);
    }

    /// Local reception time of the sender report emitted at `emission`
    /// (NTP short format), if still remembered.
    pub fn emission_to_reception(&mut self, emission: u32) -> Option<u32> {
        self.rtt.emission_to_reception(emission)
    }

    pub fn rtt_ms(&self) -> Option<u32> {
        self.rtt.rtt_ms()
    }

    pub fn jitter_ms(&self, direction: StreamDirection) -> Option<f64> {
        jitter_ms(
            self.directions[direction.index()].jitter_rtp_units,
            self.clock_rate,
        )
    }

    pub fn download_jitter_ms(&self) -> Option<f64> {
        self.jitter_ms(StreamDirection::Download)
    }

    pub fn upload_jitter_ms(&self) -> Option<f64> {
        self.jitter_ms(StreamDirection::Upload)
    }

    pub fn min_upload_jitter_ms(&self) -> Option<f64> {
        jitter_ms(self.remote_jitter.min? as f64, self.clock_rate)
    }

    pub fn max_upload_jitter_ms(&self) -> Option<f64> {
        jitter_ms(self.remote_jitter.max? as f64, self.clock_rate)
    }

    pub fn avg_upload_jitter_ms(&self) -> Option<f64> {
        jitter_ms(self.remote_jitter.avg()?, self.clock_rate)
    }

    pub fn min_download_jitter_ms(&self) -> Option<f64> {
        jitter_ms(self.local_jitter.min? as f64, self.clock_rate)
    }

    pub fn max_download_jitter_ms(&self) -> Option<f64> {
        jitter_ms(self.local_jitter.max? as f64, self.clock_rate)
    }

    pub fn avg_download_jitter_ms(&self) -> Option<f64> {
        jitter_ms(self.local_jitter.avg()?, self.clock_rate)
    }

    pub fn percent_loss(&self, direction: StreamDirection) -> f64 {
        self.directions[direction.index()].percent_loss
    }

    pub fn percent_discarded(&self) -> f64 {
        self.directions[StreamDirection::Download.index()].percent_discarded
    }

    pub fn rate_kbps(&self, direction: StreamDirection) -> f64 {
        self.directions[direction.index()].rate_kbps
    }

    pub fn nb_packets(&self, direction: StreamDirection) -> u64 {
        self.directions[direction.index()].packets
    }

    pub fn nb_bytes(&self, direction: StreamDirection) -> u64 {
        self.directions[direction.index()].bytes
    }

    pub fn nb_lost(&self, direction: StreamDirection) -> i64 {
        self.directions[direction.index()].lost
    }

    pub fn nb_discarded(&self) -> u64 {
        self.directions[StreamDirection::Download.index()].discarded
    }

    pub fn nb_fec_received(&self) -> u64 {
        self.nb_fec_received
    }

    pub fn nb_nack_received(&self) -> u64 {
        self.nb_nack_received
    }

    pub fn nb_remb_received(&self) -> u64 {
        self.nb_remb_received
    }

    pub fn last_remb_bitrate(&self) -> Option<u64> {
        self.last_remb_bitrate
    }

    pub fn reports(&self) -> &RtcpReports {
        &self.reports
    }

    pub fn reports_mut(&mut self) -> &mut RtcpReports {
        &mut self.reports
    }

    pub fn tracks(&self) -> &TrackStats {
        &self.tracks
    }

    pub fn tracks_mut(&mut self) -> &mut TrackStats {
        &mut self.tracks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_compute_ewma() {
        let tests = vec![
            // (steps, last, new, expected)
            (0, 10.0, 50.0, 10.0),
            (10, 10.0, 50.0, 14.0),
            (100, 10.0, 50.0, 50.0),
            (1000, 10.0, 50.0, 50.0),
            (-5, 10.0, 50.0, 10.0),
        ];

        for (steps, last, new, expected) in tests {
            let got = compute_ewma(steps, last, new);
            assert!((got - expected).abs() < 1e-9, "steps {steps}: {got}");
        }
    }

    #[test]
    fn test_compute_percent_loss_and_rate() {
        assert_eq!(compute_percent_loss(0, 0), 0.0);
        assert_eq!(compute_percent_loss(5, 15), 25.0);
        assert_eq!(compute_percent_loss(10, 0), 100.0);

        assert_eq!(compute_rate_kbps(1000, 0), 0.0);
        assert_eq!(compute_rate_kbps(1000, 1000), 8.0);
    }

    #[test]
    fn test_jitter_ms() {
        assert_eq!(jitter_ms(480.0, 48000), Some(10.0));
        assert_eq!(jitter_ms(900.0, 90000), Some(10.0));
        assert_eq!(jitter_ms(1.0, 0), None);
    }

    #[test]
    fn test_update_stats_download() {
        let mut stats = MediaStreamStats::new(MediaType::Audio);
        let t0 = stats.last_update_time();

        for seq in 0..100u16 {
            stats.record_packet(StreamDirection::Download, 1, seq, 125);
        }
        stats.set_download_lost(25);
        stats.update_stats(t0 + Duration::from_secs(1));

        let d = stats.direction(StreamDirection::Download);
        assert_eq!(d.nb_packets(), 100);
        assert_eq!(d.nb_lost(), 25);
        // 125 steps saturate the coefficient, so the new sample wins
        assert!((d.percent_loss - 20.0).abs() < 1e-9);
        assert!((d.rate_kbps - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_update_stats_silence_decays_rate() {
        let mut stats = MediaStreamStats::new(MediaType::Audio);
        let t0 = stats.last_update_time();
        for seq in 0..200u16 {
            stats.record_packet(StreamDirection::Upload, 1, seq, 125);
        }
        stats.update_stats(t0 + Duration::from_secs(1));
        let before = stats.rate_kbps(StreamDirection::Upload);
        assert!(before > 0.0);

        // 200 ms without packets counts as 10 steps of 20 ms
        stats.update_stats(t0 + Duration::from_millis(1200));
        let after = stats.rate_kbps(StreamDirection::Upload);
        assert!((after - before * 0.9).abs() < 1e-9, "{after}");
    }

    #[test]
    fn test_discarded_accumulates() {
        let mut stats = MediaStreamStats::new(MediaType::Video);
        let t0 = stats.last_update_time();
        stats.record_discarded(3);
        stats.update_stats(t0 + Duration::from_millis(100));
        stats.record_discarded(2);
        stats.update_stats(t0 + Duration::from_millis(200));
        assert_eq!(stats.direction(StreamDirection::Download).nb_discarded(), 5);
        assert!(stats.percent_discarded() > 0.0);
    }

    #[test]
    fn test_rtcp_report_received_upload_loss_and_rtt() {
        let mut stats = MediaStreamStats::new(MediaType::Video);
        let now = Instant::now();
        let now_short = stats.anchor().ntp_short(now);

        let feedback = RtcpFeedback {
            ssrc: 0xAA,
            fraction_lost: 64,
            cumulative_lost: 50,
            extended_highest_seq: 200,
            jitter: 900,
            lsr: now_short.wrapping_sub(0x1_8010),
            dlsr: 0x10,
        };
        stats.rtcp_report_received(&feedback, LsrTranslation::Direct, now);

        assert_eq!(stats.rtt_ms(), Some(1500));
        assert!((stats.percent_loss(StreamDirection::Upload) - 25.0).abs() < 1e-9);
        assert_eq!(stats.upload_jitter_ms(), Some(10.0));
        assert_eq!(stats.min_upload_jitter_ms(), Some(10.0));
        assert_eq!(stats.tracks().send_stats(0xAA).and_then(|s| s.rtt_ms), Some(1500));

        // an unusable report keeps the previous estimate
        let stale = RtcpFeedback {
            lsr: 0,
            ..feedback
        };
        stats.rtcp_report_received(&stale, LsrTranslation::Direct, now);
        assert_eq!(stats.rtt_ms(), Some(1500));
    }

    #[test]
    fn test_rtcp_report_received_keeps_sources_apart() {
        let mut stats = MediaStreamStats::new(MediaType::Video);
        let now = Instant::now();
        let report = |ssrc, seq, lost| RtcpFeedback {
            ssrc,
            cumulative_lost: lost,
            extended_highest_seq: seq,
            ..Default::default()
        };

        // two sources far apart in sequence space, no loss after the first
        // reports
        stats.rtcp_report_received(&report(0xAA, 100, 0), LsrTranslation::Direct, now);
        stats.rtcp_report_received(&report(0xBB, 50_000, 0), LsrTranslation::Direct, now);
        stats.rtcp_report_received(&report(0xAA, 200, 0), LsrTranslation::Direct, now);
        stats.rtcp_report_received(&report(0xBB, 50_100, 0), LsrTranslation::Direct, now);
        assert_eq!(stats.percent_loss(StreamDirection::Upload), 0.0);
        assert_eq!(stats.nb_lost(StreamDirection::Upload), 0);

        // 10 of the next 100 packets of 0xBB lost
        stats.rtcp_report_received(&report(0xAA, 300, 0), LsrTranslation::Direct, now);
        stats.rtcp_report_received(&report(0xBB, 50_200, 10), LsrTranslation::Direct, now);
        assert_eq!(stats.nb_lost(StreamDirection::Upload), 10);
        assert_eq!(stats.direction(StreamDirection::Upload).nb_lost(), 10);
        assert!((stats.percent_loss(StreamDirection::Upload) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_sr_received_maps_emission_time() {
        let mut stats = MediaStreamStats::new(MediaType::Audio);
        let now = Instant::now();
        stats.sr_received(0x1234_5678_9ABC_DEF0, now);

        assert_eq!(
            stats.emission_to_reception(0x5678_9ABC),
            Some(stats.anchor().ntp_short(now))
        );
        assert_eq!(stats.emission_to_reception(0x1111_1111), None);
    }
}
