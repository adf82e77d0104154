use std::collections::HashMap;

use crate::direction::StreamDirection;

/// Counters of one SSRC in one direction.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SsrcStats {
    pub ssrc: u32,
    pub packets: u64,
    pub bytes: u64,
    pub last_sequence_number: Option<u16>,
    /// Fraction lost from the latest reception report, in 1/256 units.
    pub fraction_lost: u8,
    pub jitter_ms: Option<f64>,
    pub rtt_ms: Option<u32>,
}

impl SsrcStats {
    fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            ..Default::default()
        }
    }
}

/// Per-SSRC statistics, received sources and sent sources kept apart.
#[derive(Debug, Default, Clone)]
pub struct TrackStats {
    receive: HashMap<u32, SsrcStats>,
    send: HashMap<u32, SsrcStats>,
}

impl TrackStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn map_mut(&mut self, direction: StreamDirection) -> &mut HashMap<u32, SsrcStats> {
        match direction {
            StreamDirection::Download => &mut self.receive,
            StreamDirection::Upload => &mut self.send,
        }
    }

    pub fn record_packet(&mut self, direction: StreamDirection, ssrc: u32, seq: u16, bytes: usize) {
        let stats = self
            .map_mut(direction)
            .entry(ssrc)
            .or_insert_with(|| SsrcStats::new(ssrc));
        stats.packets += 1;
        stats.bytes += bytes as u64;
        stats.last_sequence_number = Some(seq);
    }

    /// Jitter reported for `ssrc`. Jitter in received reports describes
    /// what we send, jitter in sent reports what we receive.
    pub fn update_jitter(&mut self, direction: StreamDirection, ssrc: u32, jitter_ms: f64) {
        self.map_mut(direction)
            .entry(ssrc)
            .or_insert_with(|| SsrcStats::new(ssrc))
            .jitter_ms = Some(jitter_ms);
    }

    pub fn update_rtt(&mut self, ssrc: u32, rtt_ms: u32) {
        self.send
            .entry(ssrc)
            .or_insert_with(|| SsrcStats::new(ssrc))
            .rtt_ms = Some(rtt_ms);
    }

    pub fn update_fraction_lost(&mut self, ssrc: u32, fraction_lost: u8) {
        self.send
            .entry(ssrc)
            .or_insert_with(|| SsrcStats::new(ssrc))
            .fraction_lost = fraction_lost;
    }

    pub fn receive_stats(&self, ssrc: u32) -> Option<&SsrcStats> {
        self.receive.get(&ssrc)
    }

    pub fn send_stats(&self, ssrc: u32) -> Option<&SsrcStats> {
        self.send.get(&ssrc)
    }

    pub fn receive_ssrcs(&self) -> Vec<u32> {
        self.receive.keys().copied().collect()
    }

    pub fn send_ssrcs(&self) -> Vec<u32> {
        self.send.keys().copied().collect()
    }

    pub fn remove(&mut self, ssrc: u32) {
        self.receive.remove(&ssrc);
        self.send.remove(&ssrc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_stats_directions_are_separate() {
        let mut tracks = TrackStats::new();
        tracks.record_packet(StreamDirection::Download, 7, 100, 160);
        tracks.record_packet(StreamDirection::Download, 7, 101, 160);
        tracks.record_packet(StreamDirection::Upload, 9, 5, 200);
        tracks.update_rtt(9, 42);
        tracks.update_jitter(StreamDirection::Download, 7, 3.5);

        let rx = tracks.receive_stats(7).unwrap();
        assert_eq!(rx.packets, 2);
        assert_eq!(rx.bytes, 320);
        assert_eq!(rx.last_sequence_number, Some(101));
        assert_eq!(rx.jitter_ms, Some(3.5));
        assert!(tracks.send_stats(7).is_none());

        let tx = tracks.send_stats(9).unwrap();
        assert_eq!(tx.rtt_ms, Some(42));

        tracks.remove(7);
        assert!(tracks.receive_stats(7).is_none());
        assert_eq!(tracks.send_ssrcs(), vec![9]);
    }
}
