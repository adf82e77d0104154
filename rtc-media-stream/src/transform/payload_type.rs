use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use log::trace;
use parking_lot::RwLock;
use shared::error::Result;

use super::TransformStage;
use crate::packet::RawPacket;

/// Outbound payload type rewrites, keyed by the payload type the encoder
/// produces.
#[derive(Debug, Clone, Default)]
pub struct PayloadTypeOverrides {
    map: Arc<RwLock<HashMap<u8, u8>>>,
}

impl PayloadTypeOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, from: u8, to: u8) {
        self.map.write().insert(from & 0x7F, to & 0x7F);
    }

    pub fn remove(&self, from: u8) -> Option<u8> {
        self.map.write().remove(&from)
    }

    pub fn get(&self, from: u8) -> Option<u8> {
        self.map.read().get(&from).copied()
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PayloadTypeTransformer {
    overrides: PayloadTypeOverrides,
}

impl PayloadTypeTransformer {
    pub fn new(overrides: PayloadTypeOverrides) -> Self {
        Self { overrides }
    }

    pub fn overrides(&self) -> PayloadTypeOverrides {
        self.overrides.clone()
    }
}

impl TransformStage for PayloadTypeTransformer {
    fn name(&self) -> &'static str {
        "payload-type"
    }

    fn transform_rtp(&mut self, mut pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        if self.overrides.is_empty() {
            return Ok(pkts);
        }
        for pkt in pkts.iter_mut() {
            let pt = pkt.payload_type();
            if let Some(to) = self.overrides.get(pt) {
                trace!("payload type {pt} -> {to}");
                pkt.set_payload_type(to);
            }
        }
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
    fn test_payload_type_override() -> Result<()> {
        let overrides = PayloadTypeOverrides::new();
        let mut stage = PayloadTypeTransformer::new(overrides.clone());

        let pkts = vec![make_raw_rtp(100, 1, 1, &[1]), make_raw_rtp(111, 2, 1, &[2])];
        overrides.add(100, 96);

        let out = stage.transform_rtp(pkts)?;
        assert_eq!(out[0].payload_type(), 96);
        assert_eq!(out[1].payload_type(), 111);
        assert_eq!(out[0].payload(), &[1]);

        // inbound is untouched
        let back = stage.reverse_transform_rtp(out)?;
        assert_eq!(back[0].payload_type(), 96);

        assert_eq!(overrides.remove(100), Some(96));
        let out = stage.transform_rtp(vec![make_raw_rtp(100, 3, 1, &[3])])?;
        assert_eq!(out[0].payload_type(), 100);
        Ok(())
    }
}
