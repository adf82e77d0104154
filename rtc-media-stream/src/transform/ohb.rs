use std::any::Any;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace, warn};
use rtp::extension::ORIGINAL_HEADER_BLOCK_URI;
use shared::error::Result;

use super::TransformStage;
use crate::format::ExtensionMap;
use crate::packet::RawPacket;

/// Fields restored from an original header block. The extension length
/// selects which fields are present; they appear in the order payload type,
/// sequence number, SSRC.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct OriginalHeader {
    pub payload_type: Option<u8>,
    pub sequence_number: Option<u16>,
    pub ssrc: Option<u32>,
}

impl OriginalHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let (pt, seq, ssrc) = match data.len() {
            1 => (true, false, false),
            2 => (false, true, false),
            3 => (true, true, false),
            4 => (false, false, true),
            5 => (true, false, true),
            6 => (false, true, true),
            7 => (true, true, true),
            _ => return None,
        };

        let mut off = 0;
        let mut header = OriginalHeader::default();
        if pt {
            header.payload_type = Some(data[off] & 0x7F);
            off += 1;
        }
        if seq {
            header.sequence_number = Some(BigEndian::read_u16(&data[off..off + 2]));
            off += 2;
        }
        if ssrc {
            header.ssrc = Some(BigEndian::read_u32(&data[off..off + 4]));
        }
        Some(header)
    }
}

/// Strips the original-header-block extension from inbound packets and
/// restores the payload type, sequence number and SSRC it carries.
#[derive(Debug, Default)]
pub struct OriginalHeaderBlockTransformer {
    extension_id: Option<u8>,
}

impl OriginalHeaderBlockTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    fn restore(&self, mut pkt: RawPacket, id: u8) -> Result<RawPacket> {
        let Some(data) = pkt.header_extension(id) else {
            return Ok(pkt);
        };
        let (parsed, len) = (OriginalHeader::parse(data), data.len());

        match parsed {
            Some(orig) => {
                trace!("ohb restores {orig:?}");
                if let Some(pt) = orig.payload_type {
                    pkt.set_payload_type(pt);
                }
                if let Some(seq) = orig.sequence_number {
                    pkt.set_sequence_number(seq);
                }
                if let Some(ssrc) = orig.ssrc {
                    pkt.set_ssrc(ssrc);
                }
            }
            None => warn!("invalid original header block of {len} bytes"),
        }

        pkt.remove_header_extension(id)?;
        Ok(pkt)
    }
}

impl TransformStage for OriginalHeaderBlockTransformer {
    fn name(&self) -> &'static str {
        "original-header-block"
    }

    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        let Some(id) = self.extension_id else {
            return Ok(pkts);
        };
        pkts.into_iter()
            .map(|pkt| {
                if pkt.has_extension() {
                    self.restore(pkt, id)
                } else {
                    Ok(pkt)
                }
            })
            .collect()
    }

    fn bind_extensions(&mut self, extensions: &ExtensionMap) {
        self.extension_id = extensions.id_for(ORIGINAL_HEADER_BLOCK_URI);
        debug!("ohb extension id {:?}", self.extension_id);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
