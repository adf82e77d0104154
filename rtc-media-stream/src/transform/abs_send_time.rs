use std::any::Any;

use log::debug;
use rtp::extension::ABS_SEND_TIME_URI;
use rtp::extension::abs_send_time_extension::{
    ABS_SEND_TIME_EXTENSION_SIZE, AbsSendTimeExtension,
};
use shared::error::Result;
use shared::marshal::Marshal;
use shared::time::SystemInstant;

use super::TransformStage;
use crate::format::ExtensionMap;
use crate::packet::RawPacket;

/// Stamps outbound packets with their send time, 6.18 fixed point seconds
/// on the NTP timescale. Inbound packets are left alone; the bitrate
/// estimator reads the extension.
#[derive(Debug)]
pub struct AbsSendTimeStamper {
    anchor: SystemInstant,
    extension_id: Option<u8>,
}

impl AbsSendTimeStamper {
    pub fn new(anchor: SystemInstant) -> Self {
        Self {
            anchor,
            extension_id: None,
        }
    }

    pub fn extension_id(&self) -> Option<u8> {
        self.extension_id
    }
}

impl TransformStage for AbsSendTimeStamper {
    fn name(&self) -> &'static str {
        "abs-send-time"
    }

    fn transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        let Some(id) = self.extension_id else {
            return Ok(pkts);
        };

        let mut value = [0u8; ABS_SEND_TIME_EXTENSION_SIZE];
        pkts.into_iter()
            .map(|mut pkt| {
                AbsSendTimeExtension::new(self.anchor.unix(pkt.now)).marshal_to(&mut value)?;
                pkt.set_header_extension(id, &value)?;
                Ok(pkt)
            })
            .collect()
    }

    fn bind_extensions(&mut self, extensions: &ExtensionMap) {
        self.extension_id = extensions.id_for(ABS_SEND_TIME_URI);
        debug!("abs-send-time extension id {:?}", self.extension_id);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
