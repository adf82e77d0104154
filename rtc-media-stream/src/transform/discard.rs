use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::trace;
use parking_lot::RwLock;
use shared::error::Result;

use super::TransformStage;
use crate::packet::RawPacket;
use crate::stats::SharedStats;

#[derive(Debug, Default)]
struct DiscardState {
    muted: AtomicBool,
    ssrcs: RwLock<HashSet<u32>>,
}

/// Mute switch for outbound media and the set of inbound SSRCs to discard.
#[derive(Debug, Clone, Default)]
pub struct DiscardControl {
    state: Arc<DiscardState>,
}

impl DiscardControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mute(&self, muted: bool) {
        self.state.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.state.muted.load(Ordering::Relaxed)
    }

    pub fn discard_ssrc(&self, ssrc: u32) {
        self.state.ssrcs.write().insert(ssrc);
    }

    pub fn accept_ssrc(&self, ssrc: u32) {
        self.state.ssrcs.write().remove(&ssrc);
    }

    pub fn is_discarded(&self, ssrc: u32) -> bool {
        self.state.ssrcs.read().contains(&ssrc)
    }
}

pub struct DiscardTransformer {
    control: DiscardControl,
    stats: Option<SharedStats>,
}

impl DiscardTransformer {
    pub fn new(control: DiscardControl) -> Self {
        Self {
            control,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: SharedStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn control(&self) -> DiscardControl {
        self.control.clone()
    }
}

impl TransformStage for DiscardTransformer {
    fn name(&self) -> &'static str {
        "discard"
    }

    fn transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        if self.control.is_muted() {
            trace!("muted, {} packets dropped", pkts.len());
            return Ok(vec![]);
        }
        Ok(pkts)
    }

    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        let before = pkts.len();
        let kept: Vec<RawPacket> = pkts
            .into_iter()
            .filter(|pkt| !self.control.is_discarded(pkt.ssrc()))
            .collect();

        let discarded = (before - kept.len()) as u64;
        if discarded > 0
            && let Some(stats) = &self.stats
        {
            stats.lock().record_discarded(discarded);
        }
        Ok(kept)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
