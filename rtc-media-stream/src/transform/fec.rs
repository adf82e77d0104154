use std::any::Any;

use log::{debug, trace};
use shared::error::Result;

use super::{PayloadTypeMap, TransformStage};
use crate::packet::RawPacket;
use crate::stats::SharedStats;

/// Terminates inbound forward error correction packets (ulpfec, flexfec).
///
/// Recovery is left to the decoder side; this stage keeps FEC packets away
/// from the media path and counts them.
pub struct FecReceiver {
    fec_payload_types: Vec<u8>,
    stats: Option<SharedStats>,
    received: u64,
}

impl Default for FecReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl FecReceiver {
    pub fn new() -> Self {
        Self {
            fec_payload_types: vec![],
            stats: None,
            received: 0,
        }
    }

    pub fn with_stats(mut self, stats: SharedStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn fec_payload_types(&self) -> &[u8] {
        &self.fec_payload_types
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

impl TransformStage for FecReceiver {
    fn name(&self) -> &'static str {
        "fec"
    }

    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        if self.fec_payload_types.is_empty() {
            return Ok(pkts);
        }

        let mut out = Vec::with_capacity(pkts.len());
        for pkt in pkts {
            if self.fec_payload_types.contains(&pkt.payload_type()) {
                trace!("fec packet ssrc {} seq {}", pkt.ssrc(), pkt.sequence_number());
                self.received += 1;
                if let Some(stats) = &self.stats {
                    stats.lock().record_fec();
                }
            } else {
                out.push(pkt);
            }
        }
        Ok(out)
    }

    fn bind_payload_types(&mut self, payload_types: &PayloadTypeMap) {
        self.fec_payload_types = payload_types
            .iter()
            .filter(|(_, format)| format.is_fec())
            .map(|(pt, _)| *pt)
            .collect();
        debug!("fec payload types {:?}", self.fec_payload_types);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{MediaFormat, MediaType, ULPFEC_ENCODING};
    use crate::stats::MediaStreamStats;
    use crate::transform::test_util::make_raw_rtp;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_fec_packets_terminated() -> Result<()> {
        let stats: SharedStats = Arc::new(Mutex::new(MediaStreamStats::new(MediaType::Video)));
        let mut stage = FecReceiver::new().with_stats(Arc::clone(&stats));

        // nothing negotiated: everything passes
        assert_eq!(
            stage
                .reverse_transform_rtp(vec![make_raw_rtp(127, 1, 1, &[0])])?
                .len(),
            1
        );

        let mut map = PayloadTypeMap::new();
        map.insert(96, MediaFormat::new("VP8", 90000, MediaType::Video));
        map.insert(127, MediaFormat::new(ULPFEC_ENCODING, 90000, MediaType::Video));
        stage.bind_payload_types(&map);
        assert_eq!(stage.fec_payload_types(), &[127]);

        let out = stage.reverse_transform_rtp(vec![
            make_raw_rtp(96, 1, 1, &[0]),
            make_raw_rtp(127, 2, 1, &[0]),
        ])?;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload_type(), 96);
        assert_eq!(stage.received(), 1);
        assert_eq!(stats.lock().nb_fec_received(), 1);

        // renegotiation without FEC
        map.remove(&127);
        stage.bind_payload_types(&map);
        assert_eq!(
            stage
                .reverse_transform_rtp(vec![make_raw_rtp(127, 3, 1, &[0])])?
                .len(),
            1
        );
        Ok(())
    }
}
