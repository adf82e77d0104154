//! Receiver side of RTP retransmission: detects sequence gaps and asks the
//! sender for the missing packets with generic NACKs (RFC 4585).

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, trace};
use rtcp::transport_feedbacks::transport_layer_nack::{
    TransportLayerNack, nack_pairs_from_sequence_numbers,
};
use rtp::sequence::SequenceUnwrapper;
use shared::error::Result;

use super::{InjectedPacket, TransformStage};
use crate::config::RetransmissionConfig;
use crate::packet::RawPacket;

#[derive(Debug, Clone, Copy)]
struct Request {
    sent: u32,
    next_at: Instant,
}

/// Outstanding requests of one remote SSRC, keyed by extended sequence
/// number.
#[derive(Debug, Default)]
struct Requester {
    unwrapper: SequenceUnwrapper,
    last_received: Option<i64>,
    requests: BTreeMap<i64, Request>,
}

impl Requester {
    fn received(&mut self, seq: u16, now: Instant, max_missing: u16) {
        let ext = self.unwrapper.unwrap(seq);
        let Some(last) = self.last_received else {
            self.last_received = Some(ext);
            return;
        };

        if ext <= last {
            if self.requests.remove(&ext).is_some() {
                trace!("seq {seq} recovered");
            }
            return;
        }

        let missing = ext - last - 1;
        if missing > max_missing as i64 {
            debug!("gap of {missing} packets, resetting requests");
            self.requests.clear();
        } else {
            for lost in last + 1..ext {
                self.requests.insert(
                    lost,
                    Request {
                        sent: 0,
                        next_at: now,
                    },
                );
            }
        }
        self.last_received = Some(ext);
    }

    /// Sequence numbers to request now. Requests sent `max_requests` times
    /// are abandoned.
    fn due(&mut self, now: Instant, config: &RetransmissionConfig) -> Vec<u16> {
        let re_request_after = Duration::from_millis(config.re_request_after_ms);
        let mut due = vec![];
        self.requests.retain(|ext, request| {
            if request.next_at > now {
                return true;
            }
            if request.sent >= config.max_requests {
                trace!("giving up on seq {}", *ext as u16);
                return false;
            }
            request.sent += 1;
            request.next_at = now + re_request_after;
            due.push(*ext as u16);
            true
        });
        due
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.requests.values().map(|r| r.next_at).min()
    }
}

pub struct RetransmissionRequesterBuilder {
    config: RetransmissionConfig,
}

impl Default for RetransmissionRequesterBuilder {
    fn default() -> Self {
        Self {
            config: RetransmissionConfig::default(),
        }
    }
}

impl RetransmissionRequesterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: RetransmissionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self, now: Instant) -> RetransmissionRequester {
        RetransmissionRequester {
            config: self.config,
            sender_ssrc: 0,
            requesters: HashMap::new(),
            eto: now + Duration::from_millis(self.config.wakeup_interval_ms),
            write_queue: VecDeque::new(),
            nacks_sent: 0,
        }
    }
}

pub struct RetransmissionRequester {
    config: RetransmissionConfig,
    sender_ssrc: u32,
    requesters: HashMap<u32, Requester>,
    /// Next periodic wakeup.
    eto: Instant,
    write_queue: VecDeque<InjectedPacket>,
    nacks_sent: u64,
}

impl RetransmissionRequester {
    pub fn nacks_sent(&self) -> u64 {
        self.nacks_sent
    }

    /// Number of sequence numbers currently requested for `ssrc`.
    pub fn pending(&self, ssrc: u32) -> usize {
        self.requesters
            .get(&ssrc)
            .map_or(0, |r| r.requests.len())
    }

    pub fn remove_ssrc(&mut self, ssrc: u32) {
        self.requesters.remove(&ssrc);
    }
}

impl TransformStage for RetransmissionRequester {
    fn name(&self) -> &'static str {
        "retransmission-requester"
    }

    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        for pkt in &pkts {
            self.requesters.entry(pkt.ssrc()).or_default().received(
                pkt.sequence_number(),
                pkt.now,
                self.config.max_missing,
            );
        }
        Ok(pkts)
    }

    fn set_local_ssrc(&mut self, ssrc: u32) {
        self.sender_ssrc = ssrc;
    }

    fn poll_timeout(&self) -> Option<Instant> {
        let earliest = self
            .requesters
            .values()
            .filter_map(Requester::next_deadline)
            .min();
        Some(earliest.map_or(self.eto, |at| at.min(self.eto)))
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if now >= self.eto {
            self.eto = now + Duration::from_millis(self.config.wakeup_interval_ms);
        }

        let mut media_ssrcs: Vec<u32> = self.requesters.keys().copied().collect();
        media_ssrcs.sort_unstable();
        for media_ssrc in media_ssrcs {
            let Some(requester) = self.requesters.get_mut(&media_ssrc) else {
                continue;
            };
            let due = requester.due(now, &self.config);
            if due.is_empty() {
                continue;
            }

            debug!("nack ssrc {media_ssrc}: {due:?}");
            let nack: Box<dyn rtcp::Packet> = Box::new(TransportLayerNack {
                sender_ssrc: self.sender_ssrc,
                media_ssrc,
                nacks: nack_pairs_from_sequence_numbers(&due),
            });
            self.write_queue
                .push_back(InjectedPacket::rtcp(RawPacket::from_rtcp(&[nack], now)?));
            self.nacks_sent += 1;
        }
        Ok(())
    }

    fn poll_injected(&mut self) -> Option<InjectedPacket> {
        self.write_queue.pop_front()
    }

    fn close(&mut self) {
        self.requesters.clear();
        self.write_queue.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_util::make_raw_rtp;

    fn arrive(stage: &mut RetransmissionRequester, seq: u16, now: Instant) -> Result<()> {
        let mut pkt = make_raw_rtp(96, seq, 0xAA, &[0]);
        pkt.now = now;
        stage.reverse_transform_rtp(vec![pkt])?;
        Ok(())
    }

    fn nacked(stage: &mut RetransmissionRequester) -> Vec<Vec<u16>> {
        let mut out = vec![];
        while let Some(injected) = stage.poll_injected() {
            for p in injected.packet.to_rtcp().unwrap() {
                let nack = p
                    .as_any()
                    .downcast_ref::<TransportLayerNack>()
                    .unwrap();
                assert_eq!(nack.media_ssrc, 0xAA);
                assert_eq!(nack.sender_ssrc, 0x1234);
                out.push(
                    nack.nacks
                        .iter()
                        .flat_map(|pair| pair.packet_list())
                        .collect(),
                );
            }
        }
        out
    }

    #[test]
    fn test_requester_requests_gap() -> Result<()> {
        let t0 = Instant::now();
        let mut stage = RetransmissionRequesterBuilder::new().build(t0);
        stage.set_local_ssrc(0x1234);

        arrive(&mut stage, 10, t0)?;
        arrive(&mut stage, 13, t0)?;
        assert_eq!(stage.pending(0xAA), 2);
        assert_eq!(stage.poll_timeout(), Some(t0));

        stage.handle_timeout(t0)?;
        assert_eq!(nacked(&mut stage), vec![vec![11, 12]]);
        assert_eq!(
            stage.poll_timeout(),
            Some(t0 + Duration::from_millis(150))
        );

        // 11 arrives, only 12 is requested again
        arrive(&mut stage, 11, t0 + Duration::from_millis(50))?;
        stage.handle_timeout(t0 + Duration::from_millis(100))?;
        assert!(nacked(&mut stage).is_empty());
        stage.handle_timeout(t0 + Duration::from_millis(150))?;
        assert_eq!(nacked(&mut stage), vec![vec![12]]);
        Ok(())
    }

    #[test]
    fn test_requester_gives_up_after_max_requests() -> Result<()> {
        let t0 = Instant::now();
        let config = RetransmissionConfig {
            max_requests: 3,
            ..Default::default()
        };
        let mut stage = RetransmissionRequesterBuilder::new()
            .with_config(config)
            .build(t0);
        stage.set_local_ssrc(0x1234);

        arrive(&mut stage, 1, t0)?;
        arrive(&mut stage, 3, t0)?;

        let mut sent = 0;
        for i in 0..6 {
            stage.handle_timeout(t0 + Duration::from_millis(150 * i))?;
            sent += nacked(&mut stage).len();
        }
        assert_eq!(sent, 3);
        assert_eq!(stage.pending(0xAA), 0);
        assert_eq!(stage.nacks_sent(), 3);
        Ok(())
    }

    #[test]
    fn test_requester_resets_on_large_gap() -> Result<()> {
        let t0 = Instant::now();
        let mut stage = RetransmissionRequesterBuilder::new().build(t0);

        arrive(&mut stage, 100, t0)?;
        arrive(&mut stage, 102, t0)?;
        assert_eq!(stage.pending(0xAA), 1);

        arrive(&mut stage, 400, t0)?;
        assert_eq!(stage.pending(0xAA), 0);
        Ok(())
    }

    #[test]
    fn test_requester_gap_across_wrap() -> Result<()> {
        let t0 = Instant::now();
        let mut stage = RetransmissionRequesterBuilder::new().build(t0);
        stage.set_local_ssrc(0x1234);

        arrive(&mut stage, 65534, t0)?;
        arrive(&mut stage, 1, t0)?;
        assert_eq!(stage.pending(0xAA), 2);

        stage.handle_timeout(t0)?;
        assert_eq!(nacked(&mut stage), vec![vec![65535, 0]]);
        Ok(())
    }

    #[test]
    fn test_requester_wakes_up_periodically() {
        let t0 = Instant::now();
        let mut stage = RetransmissionRequesterBuilder::new().build(t0);
        assert_eq!(stage.poll_timeout(), Some(t0 + Duration::from_millis(1000)));

        let later = t0 + Duration::from_millis(1000);
        stage.handle_timeout(later).unwrap();
        assert_eq!(
            stage.poll_timeout(),
            Some(later + Duration::from_millis(1000))
        );
    }
}
