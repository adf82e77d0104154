use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::Mutex;
use shared::error::Result;

use super::TransformStage;
use crate::packet::RawPacket;

/// Window over which the receive bitrate is averaged.
pub const DEFAULT_REMB_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct EstimateState {
    latest: Option<u64>,
    ssrcs: Vec<u32>,
}

/// Latest receive bitrate estimate, read by the report generator.
#[derive(Debug, Clone, Default)]
pub struct BitrateEstimate {
    state: Arc<Mutex<EstimateState>>,
}

impl BitrateEstimate {
    /// Estimated receive bitrate in bits per second, once anything arrived.
    pub fn latest_estimate(&self) -> Option<u64> {
        self.state.lock().latest
    }

    /// SSRCs the estimate covers.
    pub fn ssrcs(&self) -> Vec<u32> {
        self.state.lock().ssrcs.clone()
    }

    fn update(&self, bitrate: u64, ssrcs: Vec<u32>) {
        let mut state = self.state.lock();
        state.latest = Some(bitrate);
        state.ssrcs = ssrcs;
    }
}

/// Receive-side bandwidth estimation from the bytes received in a sliding
/// window.
#[derive(Debug)]
pub struct RemoteBitrateEstimator {
    window: Duration,
    arrivals: HashMap<u32, VecDeque<(Instant, usize)>>,
    estimate: BitrateEstimate,
}

impl Default for RemoteBitrateEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_REMB_WINDOW)
    }
}

impl RemoteBitrateEstimator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            arrivals: HashMap::new(),
            estimate: BitrateEstimate::default(),
        }
    }

    /// Publishes into an existing estimate handle.
    pub fn with_estimate(mut self, estimate: BitrateEstimate) -> Self {
        self.estimate = estimate;
        self
    }

    pub fn estimate(&self) -> BitrateEstimate {
        self.estimate.clone()
    }

    fn recompute(&mut self, now: Instant) {
        let window = self.window;
        let mut total = 0usize;
        for arrivals in self.arrivals.values_mut() {
            while let Some((at, _)) = arrivals.front() {
                if now.saturating_duration_since(*at) > window {
                    arrivals.pop_front();
                } else {
                    break;
                }
            }
            total += arrivals.iter().map(|(_, len)| len).sum::<usize>();
        }
        self.arrivals.retain(|_, a| !a.is_empty());

        let window_ms = window.as_millis().max(1) as u64;
        let bitrate = total as u64 * 8 * 1000 / window_ms;
        let mut ssrcs: Vec<u32> = self.arrivals.keys().copied().collect();
        ssrcs.sort_unstable();
        trace!("remb estimate {bitrate} bps over {ssrcs:?}");
        self.estimate.update(bitrate, ssrcs);
    }
}

impl TransformStage for RemoteBitrateEstimator {
    fn name(&self) -> &'static str {
        "remote-bitrate-estimator"
    }

    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        let Some(now) = pkts.iter().map(|p| p.now).max() else {
            return Ok(pkts);
        };
        for pkt in &pkts {
            self.arrivals
                .entry(pkt.ssrc())
                .or_default()
                .push_back((pkt.now, pkt.len()));
        }
        self.recompute(now);
        Ok(pkts)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_util::make_raw_rtp;

    #[test]
    fn test_remb_window() -> Result<()> {
        let mut stage = RemoteBitrateEstimator::default();
        let estimate = stage.estimate();
        assert_eq!(estimate.latest_estimate(), None);

        let t0 = Instant::now();
        let mut a = make_raw_rtp(96, 1, 0xA, &[0; 88]);
        a.now = t0;
        let mut b = make_raw_rtp(96, 1, 0xB, &[0; 88]);
        b.now = t0 + Duration::from_millis(500);
        stage.reverse_transform_rtp(vec![a, b])?;

        // 2 packets of 100 bytes in one second
        assert_eq!(estimate.latest_estimate(), Some(1600));
        assert_eq!(estimate.ssrcs(), vec![0xA, 0xB]);

        let mut c = make_raw_rtp(96, 2, 0xB, &[0; 88]);
        c.now = t0 + Duration::from_millis(1200);
        stage.reverse_transform_rtp(vec![c])?;
        assert_eq!(estimate.latest_estimate(), Some(1600));
        assert_eq!(estimate.ssrcs(), vec![0xB]);
        Ok(())
    }
}
