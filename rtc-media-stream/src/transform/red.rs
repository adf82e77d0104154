//! Redundant audio data (RFC 2198).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |F|   block PT  |  timestamp offset         |   block length    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The last header is a single octet with F clear, naming the primary
//! encoding. Block data follows the headers in the same order.

use std::any::Any;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace, warn};
use shared::error::{Error, Result};

use super::{PayloadTypeMap, TransformStage};
use crate::packet::RawPacket;

const RED_HEADER_LENGTH: usize = 4;
const RED_PRIMARY_HEADER_LENGTH: usize = 1;
const F_BIT: u8 = 0x80;

/// Extracts the primary encoding of a RED payload, returning its payload
/// type and data.
pub fn parse_primary(payload: &[u8]) -> Result<(u8, Bytes)> {
    let mut offset = 0;
    let mut redundant_len = 0usize;

    loop {
        let Some(&b) = payload.get(offset) else {
            return Err(Error::ErrShortBuffer);
        };
        if b & F_BIT == 0 {
            let pt = b & 0x7F;
            let start = offset + RED_PRIMARY_HEADER_LENGTH + redundant_len;
            if start > payload.len() {
                return Err(Error::ErrShortBuffer);
            }
            return Ok((pt, Bytes::copy_from_slice(&payload[start..])));
        }
        if offset + RED_HEADER_LENGTH > payload.len() {
            return Err(Error::ErrShortBuffer);
        }
        let len = (((payload[offset + 2] & 0x03) as usize) << 8) | payload[offset + 3] as usize;
        redundant_len += len;
        offset += RED_HEADER_LENGTH;
    }
}

/// Wraps `payload` as the primary and only block of a RED payload.
pub fn build_primary(pt: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(RED_PRIMARY_HEADER_LENGTH + payload.len());
    buf.put_u8(pt & 0x7F);
    buf.put_slice(payload);
    buf.freeze()
}

/// Outbound: encapsulates packets in RED when it is negotiated and enabled.
/// Inbound: replaces RED packets with their primary encoding.
#[derive(Debug, Default)]
pub struct RedTransformer {
    red_payload_type: Option<u8>,
    encapsulate: bool,
}

impl RedTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables outbound encapsulation.
    pub fn with_encapsulation(mut self, encapsulate: bool) -> Self {
        self.encapsulate = encapsulate;
        self
    }

    pub fn red_payload_type(&self) -> Option<u8> {
        self.red_payload_type
    }

    fn wrap(&self, pkt: RawPacket, red_pt: u8) -> Result<RawPacket> {
        let mut rtp = pkt.to_rtp()?;
        rtp.payload = build_primary(rtp.header.payload_type, &rtp.payload);
        rtp.header.payload_type = red_pt;
        RawPacket::from_rtp(&rtp, pkt.now)
    }

    fn unwrap(&self, pkt: RawPacket) -> Result<Option<RawPacket>> {
        let mut rtp = pkt.to_rtp()?;
        match parse_primary(&rtp.payload) {
            Ok((pt, data)) => {
                trace!("red primary pt {pt}, {} bytes", data.len());
                rtp.header.payload_type = pt;
                rtp.payload = data;
                Ok(Some(RawPacket::from_rtp(&rtp, pkt.now)?))
            }
            Err(err) => {
                warn!("malformed red packet from ssrc {}: {err}", rtp.header.ssrc);
                Ok(None)
            }
        }
    }
}

impl TransformStage for RedTransformer {
    fn name(&self) -> &'static str {
        "red"
    }

    fn transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        let Some(red_pt) = self.red_payload_type.filter(|_| self.encapsulate) else {
            return Ok(pkts);
        };
        pkts.into_iter()
            .map(|pkt| {
                if pkt.payload_type() == red_pt {
                    Ok(pkt)
                } else {
                    self.wrap(pkt, red_pt)
                }
            })
            .collect()
    }

    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        let Some(red_pt) = self.red_payload_type else {
            return Ok(pkts);
        };
        let mut out = Vec::with_capacity(pkts.len());
        for pkt in pkts {
            if pkt.payload_type() != red_pt {
                out.push(pkt);
            } else if let Some(pkt) = self.unwrap(pkt)? {
                out.push(pkt);
            }
        }
        Ok(out)
    }

    fn bind_payload_types(&mut self, payload_types: &PayloadTypeMap) {
        self.red_payload_type = payload_types
            .iter()
            .find(|(_, format)| format.is_red())
            .map(|(pt, _)| *pt);
        debug!("red payload type {:?}", self.red_payload_type);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
