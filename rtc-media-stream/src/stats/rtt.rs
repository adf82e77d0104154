//! Round trip time from the LSR/DLSR fields of RTCP reception reports
//! (RFC 3550 section 6.4.1).

use std::collections::VecDeque;

use log::{debug, trace};
use shared::time::ntp_short_to_ms;

/// Round trip times at or above this bound are treated as clock skew.
pub const MAX_RTT_MS: i64 = 3000;

/// Number of forwarded sender reports remembered for LSR remapping.
pub const EMISSION_LRU_CAPACITY: usize = 100;

/// Computes the round trip time, in milliseconds, of a reception report
/// received when the local NTP short clock read `now_ntp_short`.
///
/// Returns `None` when the report carries no LSR/DLSR or when the result is
/// negative or at least [`MAX_RTT_MS`]. The value is never clamped.
pub fn compute_rtt_ms(lsr: u32, dlsr: u32, now_ntp_short: u32) -> Option<u32> {
    if lsr == 0 || dlsr == 0 {
        return None;
    }

    let rtt = now_ntp_short.wrapping_sub(lsr).wrapping_sub(dlsr) as i32;
    let rtt_ms = ntp_short_to_ms(rtt as i64);
    if !(0..MAX_RTT_MS).contains(&rtt_ms) {
        debug!(
            "invalid rtt {} ms: now={:#x} lsr={:#x} dlsr={:#x}",
            rtt_ms, now_ntp_short, lsr, dlsr
        );
        return None;
    }

    trace!("rtt {} ms", rtt_ms);
    Some(rtt_ms as u32)
}

/// How the LSR of a reception report relates to the local clock.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LsrTranslation {
    /// The report echoes a sender report this endpoint generated itself.
    Direct,
    /// The report echoes a forwarded sender report; the value is the local
    /// NTP short time at which the original was received.
    Mapped(u32),
    /// The report echoes a forwarded sender report whose reception time is
    /// not known.
    Unmapped,
}

/// Emission NTP short time of received sender reports mapped to their local
/// reception NTP short time. Lookups refresh an entry; inserting beyond
/// capacity evicts the least recently used one.
#[derive(Debug, Clone)]
pub struct EmissionLru {
    capacity: usize,
    entries: VecDeque<(u32, u32)>,
}

impl Default for EmissionLru {
    fn default() -> Self {
        Self::new(EMISSION_LRU_CAPACITY)
    }
}

impl EmissionLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, emission: u32, reception: u32) {
        if let Some(pos) = self.entries.iter().position(|(e, _)| *e == emission) {
            self.entries.remove(pos);
        }
        self.entries.push_back((emission, reception));
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn get(&mut self, emission: u32) -> Option<u32> {
        let pos = self.entries.iter().position(|(e, _)| *e == emission)?;
        let entry = self.entries.remove(pos)?;
        self.entries.push_back(entry);
        Some(entry.1)
    }

    pub fn contains(&self, emission: u32) -> bool {
        self.entries.iter().any(|(e, _)| *e == emission)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Last known round trip time plus the emission table used when this
/// stream's sender reports are forwarded by a translator.
#[derive(Debug, Default, Clone)]
pub struct RttEstimator {
    emissions: EmissionLru,
    rtt_ms: Option<u32>,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_emission(&mut self, emission: u32, reception: u32) {
        self.emissions.insert(emission, reception);
    }

    pub fn emission_to_reception(&mut self, emission: u32) -> Option<u32> {
        self.emissions.get(emission)
    }

    /// Computes a new sample. A sample that cannot be computed keeps the
    /// previous estimate and returns `None`.
    pub fn estimate(
        &mut self,
        lsr: u32,
        dlsr: u32,
        translation: LsrTranslation,
        now_ntp_short: u32,
    ) -> Option<u32> {
        let lsr = match translation {
            LsrTranslation::Direct => lsr,
            LsrTranslation::Mapped(reception) if lsr != 0 => reception,
            LsrTranslation::Mapped(_) => 0,
            LsrTranslation::Unmapped => return None,
        };

        let rtt = compute_rtt_ms(lsr, dlsr, now_ntp_short)?;
        self.rtt_ms = Some(rtt);
        Some(rtt)
    }

    pub fn rtt_ms(&self) -> Option<u32> {
        self.rtt_ms
    }
}
