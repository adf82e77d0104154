use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;
use rtp::extension::ABS_SEND_TIME_URI;
use rtp::extension::abs_send_time_extension::AbsSendTimeExtension;
use shared::error::Result;
use shared::marshal::Unmarshal;
use shared::time::SystemInstant;

use super::TransformStage;
use crate::format::ExtensionMap;
use crate::packet::RawPacket;

/// What is known about one inbound source.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub ssrc: u32,
    pub payload_type: u8,
    pub packets: u64,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub last_sequence_number: u16,
    pub last_timestamp: u32,
    /// Send time estimated from abs-send-time, as a duration since the unix
    /// epoch.
    pub last_send_time: Option<Duration>,
}

/// Inbound tracks, shared between the stage and the stream.
#[derive(Debug, Clone, Default)]
pub struct TrackTable {
    tracks: Arc<Mutex<HashMap<u32, TrackInfo>>>,
}

impl TrackTable {
    pub fn track(&self, ssrc: u32) -> Option<TrackInfo> {
        self.tracks.lock().get(&ssrc).cloned()
    }

    pub fn ssrcs(&self) -> Vec<u32> {
        let mut ssrcs: Vec<u32> = self.tracks.lock().keys().copied().collect();
        ssrcs.sort_unstable();
        ssrcs
    }

    pub fn remove(&self, ssrc: u32) -> Option<TrackInfo> {
        self.tracks.lock().remove(&ssrc)
    }

    pub fn len(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.lock().is_empty()
    }
}

/// Observes inbound RTP and maintains a [`TrackInfo`] per SSRC.
#[derive(Debug)]
pub struct TrackReceiver {
    table: TrackTable,
    anchor: SystemInstant,
    abs_send_time_id: Option<u8>,
}

impl TrackReceiver {
    pub fn new(anchor: SystemInstant) -> Self {
        Self {
            table: TrackTable::default(),
            anchor,
            abs_send_time_id: None,
        }
    }

    /// Records into an existing table, kept across chain rebuilds.
    pub fn with_table(mut self, table: TrackTable) -> Self {
        self.table = table;
        self
    }

    pub fn table(&self) -> TrackTable {
        self.table.clone()
    }

    fn send_time(&self, pkt: &RawPacket) -> Option<Duration> {
        let id = self.abs_send_time_id?;
        let mut raw = pkt.header_extension(id)?;
        let ext = AbsSendTimeExtension::unmarshal(&mut raw).ok()?;
        Some(ext.estimate(self.anchor.unix(pkt.now)))
    }
}

impl TransformStage for TrackReceiver {
    fn name(&self) -> &'static str {
        "track-receiver"
    }

    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        for pkt in &pkts {
            let send_time = self.send_time(pkt);
            let mut tracks = self.table.tracks.lock();
            let info = tracks.entry(pkt.ssrc()).or_insert_with(|| {
                debug!("new track ssrc {} pt {}", pkt.ssrc(), pkt.payload_type());
                TrackInfo {
                    ssrc: pkt.ssrc(),
                    payload_type: pkt.payload_type(),
                    packets: 0,
                    first_seen: pkt.now,
                    last_seen: pkt.now,
                    last_sequence_number: pkt.sequence_number(),
                    last_timestamp: pkt.timestamp(),
                    last_send_time: None,
                }
            });
            info.packets += 1;
            info.payload_type = pkt.payload_type();
            info.last_seen = pkt.now;
            info.last_sequence_number = pkt.sequence_number();
            info.last_timestamp = pkt.timestamp();
            if send_time.is_some() {
                info.last_send_time = send_time;
            }
        }
        Ok(pkts)
    }

    fn bind_extensions(&mut self, extensions: &ExtensionMap) {
        self.abs_send_time_id = extensions.id_for(ABS_SEND_TIME_URI);
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
    fn test_track_receiver_tracks_ssrcs() -> Result<()> {
        let mut stage = TrackReceiver::new(SystemInstant::now());
        let table = stage.table();

        stage.reverse_transform_rtp(vec![
            make_raw_rtp(96, 1, 0xA, &[0]),
            make_raw_rtp(96, 2, 0xA, &[0]),
            make_raw_rtp(97, 9, 0xB, &[0]),
        ])?;

        assert_eq!(table.ssrcs(), vec![0xA, 0xB]);
        let a = table.track(0xA).unwrap();
        assert_eq!(a.packets, 2);
        assert_eq!(a.last_sequence_number, 2);
        assert_eq!(a.last_timestamp, 320);
        assert!(a.last_send_time.is_none());
        assert_eq!(table.track(0xB).unwrap().payload_type, 97);

        assert!(table.remove(0xA).is_some());
        assert_eq!(table.len(), 1);
        Ok(())
    }
}
