//! Transport-wide congestion control sequence numbers.
//!
//! One engine is shared by an egress stage, which numbers every outbound
//! packet across all SSRCs of the transport, and an ingress stage, which
//! records the arrival of numbered inbound packets for feedback generation.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};
use parking_lot::Mutex;
use rtp::extension::TRANSPORT_CC_URI;
use rtp::extension::transport_cc_extension::{
    TRANSPORT_CC_EXTENSION_SIZE, TransportCcExtension,
};
use shared::error::Result;
use shared::marshal::{Marshal, Unmarshal};

use super::TransformStage;
use crate::format::ExtensionMap;
use crate::packet::RawPacket;

/// Arrivals kept for feedback before the oldest are dropped.
pub const DEFAULT_ARRIVAL_CAPACITY: usize = 1000;

#[derive(Debug)]
struct TccState {
    next_sequence: u16,
    arrivals: VecDeque<(u16, Instant)>,
    capacity: usize,
}

/// State shared by [`TccEgress`] and [`TccIngress`].
#[derive(Debug, Clone)]
pub struct TransportCcEngine {
    state: Arc<Mutex<TccState>>,
}

impl Default for TransportCcEngine {
    fn default() -> Self {
        Self::new(DEFAULT_ARRIVAL_CAPACITY)
    }
}

impl TransportCcEngine {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TccState {
                next_sequence: 0,
                arrivals: VecDeque::new(),
                capacity,
            })),
        }
    }

    pub fn next_sequence_number(&self) -> u16 {
        let mut state = self.state.lock();
        let seq = state.next_sequence;
        state.next_sequence = seq.wrapping_add(1);
        seq
    }

    pub fn record_arrival(&self, seq: u16, at: Instant) {
        let mut state = self.state.lock();
        if state.arrivals.len() >= state.capacity {
            state.arrivals.pop_front();
        }
        state.arrivals.push_back((seq, at));
    }

    /// Arrivals in the order they were recorded.
    pub fn received_packets(&self) -> Vec<(u16, Instant)> {
        self.state.lock().arrivals.iter().copied().collect()
    }

    /// Removes and returns the recorded arrivals.
    pub fn take_received_packets(&self) -> Vec<(u16, Instant)> {
        self.state.lock().arrivals.drain(..).collect()
    }
}

/// Stamps the transport-wide sequence number on outbound packets.
#[derive(Debug)]
pub struct TccEgress {
    engine: TransportCcEngine,
    extension_id: Option<u8>,
}

impl TccEgress {
    pub fn new(engine: TransportCcEngine) -> Self {
        Self {
            engine,
            extension_id: None,
        }
    }
}

impl TransformStage for TccEgress {
    fn name(&self) -> &'static str {
        "tcc-egress"
    }

    fn transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        let Some(id) = self.extension_id else {
            return Ok(pkts);
        };

        let mut value = [0u8; TRANSPORT_CC_EXTENSION_SIZE];
        pkts.into_iter()
            .map(|mut pkt| {
                let ext = TransportCcExtension {
                    transport_sequence: self.engine.next_sequence_number(),
                };
                ext.marshal_to(&mut value)?;
                pkt.set_header_extension(id, &value)?;
                Ok(pkt)
            })
            .collect()
    }

    fn bind_extensions(&mut self, extensions: &ExtensionMap) {
        self.extension_id = extensions.id_for(TRANSPORT_CC_URI);
        debug!("tcc egress extension id {:?}", self.extension_id);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Records the transport-wide sequence number of inbound packets.
#[derive(Debug)]
pub struct TccIngress {
    engine: TransportCcEngine,
    extension_id: Option<u8>,
}

impl TccIngress {
    pub fn new(engine: TransportCcEngine) -> Self {
        Self {
            engine,
            extension_id: None,
        }
    }

    fn read(&self, pkt: &RawPacket, id: u8) -> Option<u16> {
        let mut raw = pkt.header_extension(id)?;
        TransportCcExtension::unmarshal(&mut raw)
            .ok()
            .map(|ext| ext.transport_sequence)
    }
}

impl TransformStage for TccIngress {
    fn name(&self) -> &'static str {
        "tcc-ingress"
    }

    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        if let Some(id) = self.extension_id {
            for pkt in &pkts {
                if let Some(seq) = self.read(pkt, id) {
                    trace!("tcc seq {seq} from ssrc {}", pkt.ssrc());
                    self.engine.record_arrival(seq, pkt.now);
                }
            }
        }
        Ok(pkts)
    }

    fn bind_extensions(&mut self, extensions: &ExtensionMap) {
        self.extension_id = extensions.id_for(TRANSPORT_CC_URI);
        debug!("tcc ingress extension id {:?}", self.extension_id);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
