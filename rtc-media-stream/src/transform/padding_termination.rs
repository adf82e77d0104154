use std::any::Any;
use std::collections::HashMap;

use log::trace;
use shared::error::Result;

use super::TransformStage;
use crate::packet::RawPacket;

/// Drops inbound packets made only of padding, which senders use to estimate
/// bandwidth. They carry no media and must not reach the decoder.
#[derive(Debug, Default)]
pub struct PaddingTermination {
    dropped: u64,
    last_padding_seq: HashMap<u32, u16>,
}

impl PaddingTermination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn last_padding_seq(&self, ssrc: u32) -> Option<u16> {
        self.last_padding_seq.get(&ssrc).copied()
    }
}

impl TransformStage for PaddingTermination {
    fn name(&self) -> &'static str {
        "padding-termination"
    }

    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        Ok(pkts
            .into_iter()
            .filter(|pkt| {
                if pkt.has_padding() && pkt.payload_length() == 0 {
                    trace!("ssrc {} seq {} padding only", pkt.ssrc(), pkt.sequence_number());
                    self.dropped += 1;
                    self.last_padding_seq
                        .insert(pkt.ssrc(), pkt.sequence_number());
                    false
                } else {
                    true
                }
            })
            .collect())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
