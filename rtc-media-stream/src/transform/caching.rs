//! Cache of recently sent packets, used to answer retransmission requests.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;
use rtp::sequence::SequenceUnwrapper;
use shared::error::Result;

use super::TransformStage;
use crate::config::CacheConfig;
use crate::packet::RawPacket;

#[derive(Debug, Clone)]
struct CachedPacket {
    packet: RawPacket,
    cached_at: Instant,
}

#[derive(Debug, Default)]
struct SsrcCache {
    unwrapper: SequenceUnwrapper,
    packets: BTreeMap<i64, CachedPacket>,
    bytes: usize,
}

impl SsrcCache {
    fn insert(&mut self, pkt: RawPacket, config: &CacheConfig) {
        let now = pkt.now;
        let seq = self.unwrapper.unwrap(pkt.sequence_number());
        self.bytes += pkt.len();
        if let Some(old) = self.packets.insert(
            seq,
            CachedPacket {
                packet: pkt,
                cached_at: now,
            },
        ) {
            self.bytes -= old.packet.len();
        }
        self.evict(now, config);
    }

    fn evict(&mut self, now: Instant, config: &CacheConfig) {
        let max_age = Duration::from_millis(config.size_millis);
        loop {
            let over_limit = self.packets.len() > config.max_size_packets;
            let Some(entry) = self.packets.first_entry() else {
                break;
            };
            let expired = now.saturating_duration_since(entry.get().cached_at) > max_age;
            if !expired && !over_limit {
                break;
            }
            self.bytes -= entry.get().packet.len();
            entry.remove();
        }
    }
}

#[derive(Debug)]
struct CacheState {
    config: CacheConfig,
    caches: HashMap<u32, SsrcCache>,
    hits: u64,
    misses: u64,
    closed: bool,
    overflow_logged: bool,
}

/// Outbound packets per SSRC, bounded in age, in packet count and in the
/// number of SSRCs.
#[derive(Debug, Clone)]
pub struct PacketCache {
    state: Arc<Mutex<CacheState>>,
}

impl Default for PacketCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl PacketCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                config,
                caches: HashMap::new(),
                hits: 0,
                misses: 0,
                closed: false,
                overflow_logged: false,
            })),
        }
    }

    pub fn insert(&self, pkt: RawPacket) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }

        let ssrc = pkt.ssrc();
        if !state.caches.contains_key(&ssrc) && state.caches.len() >= state.config.max_ssrc_count {
            if !state.overflow_logged {
                warn!(
                    "packet cache holds {} ssrcs, not caching {ssrc}",
                    state.caches.len()
                );
                state.overflow_logged = true;
            }
            return;
        }

        let config = state.config;
        state.caches.entry(ssrc).or_default().insert(pkt, &config);
    }

    /// The cached packet `seq` of `ssrc`, if still cached.
    pub fn get(&self, ssrc: u32, seq: u16) -> Option<RawPacket> {
        let mut state = self.state.lock();
        let found = state.caches.get(&ssrc).and_then(|cache| {
            let ext = cache.unwrapper.peek(seq);
            cache.packets.get(&ext).map(|c| c.packet.clone())
        });
        if found.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        found
    }

    /// The most recent packets of `ssrc` whose total size fits in `bytes`,
    /// oldest first.
    pub fn get_many(&self, ssrc: u32, bytes: usize) -> Vec<RawPacket> {
        let state = self.state.lock();
        let Some(cache) = state.caches.get(&ssrc) else {
            return vec![];
        };

        let mut budget = bytes;
        let mut out = vec![];
        for cached in cache.packets.values().rev() {
            if cached.packet.len() > budget {
                break;
            }
            budget -= cached.packet.len();
            out.push(cached.packet.clone());
        }
        out.reverse();
        out
    }

    /// Restarts the age of a cached packet, after it was retransmitted.
    pub fn update_timestamp(&self, ssrc: u32, seq: u16, now: Instant) {
        let mut state = self.state.lock();
        if let Some(cache) = state.caches.get_mut(&ssrc) {
            let ext = cache.unwrapper.peek(seq);
            if let Some(cached) = cache.packets.get_mut(&ext) {
                cached.cached_at = now;
            }
        }
    }

    pub fn len(&self, ssrc: u32) -> usize {
        self.state
            .lock()
            .caches
            .get(&ssrc)
            .map_or(0, |c| c.packets.len())
    }

    pub fn bytes(&self, ssrc: u32) -> usize {
        self.state.lock().caches.get(&ssrc).map_or(0, |c| c.bytes)
    }

    pub fn ssrc_count(&self) -> usize {
        self.state.lock().caches.len()
    }

    pub fn hits(&self) -> u64 {
        self.state.lock().hits
    }

    pub fn misses(&self) -> u64 {
        self.state.lock().misses
    }

    pub fn remove_ssrc(&self, ssrc: u32) {
        self.state.lock().caches.remove(&ssrc);
    }

    /// Drops everything and refuses further packets.
    pub fn close(&self) {
        let mut state = self.state.lock();
        debug!(
            "packet cache closed, {} hits {} misses",
            state.hits, state.misses
        );
        state.closed = true;
        state.caches.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Copies every outbound RTP packet into a [`PacketCache`].
#[derive(Debug)]
pub struct CachingTransformer {
    cache: PacketCache,
}

impl CachingTransformer {
    pub fn new(cache: PacketCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> PacketCache {
        self.cache.clone()
    }
}

impl TransformStage for CachingTransformer {
    fn name(&self) -> &'static str {
        "caching"
    }

    fn transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        for pkt in &pkts {
            self.cache.insert(pkt.clone());
        }
        Ok(pkts)
    }

    fn close(&mut self) {
        self.cache.close();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_util::make_raw_rtp;

    fn config(size_millis: u64, max_ssrc_count: usize, max_size_packets: usize) -> CacheConfig {
        CacheConfig {
            size_millis,
            max_ssrc_count,
            max_size_packets,
        }
    }

    #[test]
    fn test_cache_get_and_counters() -> Result<()> {
        let cache = PacketCache::default();
        let mut stage = CachingTransformer::new(cache.clone());

        let pkts: Vec<RawPacket> = (0..5).map(|seq| make_raw_rtp(96, seq, 1, &[seq as u8])).collect();
        let out = stage.transform_rtp(pkts.clone())?;
        assert_eq!(out, pkts);

        assert_eq!(cache.get(1, 3), Some(pkts[3].clone()));
        assert_eq!(cache.get(1, 9), None);
        assert_eq!(cache.get(2, 0), None);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 2);
        assert_eq!(cache.len(1), 5);
        Ok(())
    }

    #[test]
    fn test_cache_packet_limit() {
        let cache = PacketCache::new(config(1000, 50, 3));
        for seq in 0..5u16 {
            cache.insert(make_raw_rtp(96, seq, 1, &[0]));
        }
        assert_eq!(cache.len(1), 3);
        assert!(cache.get(1, 1).is_none());
        assert!(cache.get(1, 2).is_some());
    }

    #[test]
    fn test_cache_age_limit_and_refresh() {
        let cache = PacketCache::new(config(1000, 50, 500));
        let t0 = Instant::now();

        let mut old = make_raw_rtp(96, 1, 1, &[0]);
        old.now = t0;
        cache.insert(old);
        let mut kept = make_raw_rtp(96, 2, 1, &[0]);
        kept.now = t0;
        cache.insert(kept);
        cache.update_timestamp(1, 2, t0 + Duration::from_millis(900));

        let mut fresh = make_raw_rtp(96, 3, 1, &[0]);
        fresh.now = t0 + Duration::from_millis(1500);
        cache.insert(fresh);

        // the refreshed packet keeps the ones behind it until it expires
        assert!(cache.get(1, 1).is_none());
        assert!(cache.get(1, 2).is_some());
        assert!(cache.get(1, 3).is_some());
    }

    #[test]
    fn test_cache_ssrc_limit_and_close() {
        let cache = PacketCache::new(config(1000, 2, 500));
        for ssrc in 1..=3 {
            cache.insert(make_raw_rtp(96, 1, ssrc, &[0]));
        }
        assert_eq!(cache.ssrc_count(), 2);
        assert!(cache.get(3, 1).is_none());

        cache.close();
        assert!(cache.is_closed());
        cache.insert(make_raw_rtp(96, 2, 1, &[0]));
        assert_eq!(cache.ssrc_count(), 0);
    }

    #[test]
    fn test_cache_get_many() {
        let cache = PacketCache::default();
        for seq in 0..4u16 {
            cache.insert(make_raw_rtp(96, seq, 1, &[0; 8]));
        }
        // 20 bytes each
        let got = cache.get_many(1, 45);
        let seqs: Vec<u16> = got.iter().map(|p| p.sequence_number()).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert!(cache.get_many(7, 100).is_empty());
    }
}
