//! Contributing sources (RFC 3550 section 5.1) and their audio levels
//! (RFC 6465).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use rtp::extension::CSRC_AUDIO_LEVEL_URI;
use rtp::extension::audio_level_extension::AUDIO_LEVEL_SILENCE;
use rtp::header::MAX_CSRC_COUNT;
use shared::error::Result;

use super::TransformStage;
use crate::format::{ExtensionMap, MediaType};
use crate::packet::RawPacket;

/// A contributing source and, for audio, its level in -dBov.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CsrcEntry {
    pub csrc: u32,
    pub level: Option<u8>,
}

impl CsrcEntry {
    pub fn new(csrc: u32) -> Self {
        Self { csrc, level: None }
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = Some(level & 0x7F);
        self
    }
}

/// The CSRC list stamped on outbound packets, updated by a mixer.
#[derive(Debug, Clone, Default)]
pub struct CsrcList {
    entries: Arc<Mutex<Vec<CsrcEntry>>>,
}

impl CsrcList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the list; entries beyond the 15 the header can carry are
    /// ignored.
    pub fn set(&self, mut entries: Vec<CsrcEntry>) {
        entries.truncate(MAX_CSRC_COUNT);
        *self.entries.lock() = entries;
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn get(&self) -> Vec<CsrcEntry> {
        self.entries.lock().clone()
    }
}

/// Called with the SSRC of an inbound packet and its (CSRC, level) pairs.
pub type CsrcAudioLevelListener = Box<dyn Fn(u32, &[(u32, u8)]) + Send + Sync>;

/// Listener list shared between the stage and the stream owning it.
#[derive(Clone, Default)]
pub struct CsrcAudioLevelListeners {
    inner: Arc<RwLock<Vec<CsrcAudioLevelListener>>>,
}

impl fmt::Debug for CsrcAudioLevelListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrcAudioLevelListeners")
            .field("len", &self.inner.read().len())
            .finish()
    }
}

impl CsrcAudioLevelListeners {
    pub fn add(&self, listener: CsrcAudioLevelListener) {
        self.inner.write().push(listener);
    }

    fn notify(&self, ssrc: u32, levels: &[(u32, u8)]) {
        for listener in self.inner.read().iter() {
            listener(ssrc, levels);
        }
    }
}

pub struct CsrcTransformerBuilder {
    media_type: MediaType,
    list: CsrcList,
    listeners: CsrcAudioLevelListeners,
}

impl Default for CsrcTransformerBuilder {
    fn default() -> Self {
        Self {
            media_type: MediaType::Audio,
            list: CsrcList::new(),
            listeners: CsrcAudioLevelListeners::default(),
        }
    }
}

impl CsrcTransformerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = media_type;
        self
    }

    pub fn with_list(mut self, list: CsrcList) -> Self {
        self.list = list;
        self
    }

    pub fn with_listeners(mut self, listeners: CsrcAudioLevelListeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn build(self) -> CsrcTransformer {
        CsrcTransformer {
            media_type: self.media_type,
            list: self.list,
            listeners: self.listeners,
            extension_id: None,
        }
    }
}

/// Outbound: stamps the CSRC list and, for audio, the CSRC audio levels.
/// Inbound: strips the CSRC audio-level extension and reports its levels.
pub struct CsrcTransformer {
    media_type: MediaType,
    list: CsrcList,
    listeners: CsrcAudioLevelListeners,
    extension_id: Option<u8>,
}

impl CsrcTransformer {
    pub fn list(&self) -> CsrcList {
        self.list.clone()
    }

    pub fn listeners(&self) -> CsrcAudioLevelListeners {
        self.listeners.clone()
    }

    fn stamp(&self, pkt: RawPacket, entries: &[CsrcEntry]) -> Result<RawPacket> {
        let mut rtp = pkt.to_rtp()?;
        rtp.header.csrc = entries.iter().map(|e| e.csrc).collect();

        if self.media_type == MediaType::Audio
            && let Some(id) = self.extension_id
            && entries.iter().any(|e| e.level.is_some())
        {
            let levels: Vec<u8> = entries
                .iter()
                .map(|e| e.level.unwrap_or(AUDIO_LEVEL_SILENCE) & 0x7F)
                .collect();
            rtp.header.set_extension(id, Bytes::from(levels))?;
        }

        RawPacket::from_rtp(&rtp, pkt.now)
    }

    fn strip(&self, pkt: RawPacket, id: u8) -> Result<RawPacket> {
        let mut rtp = pkt.to_rtp()?;
        let Some(levels) = rtp.header.get_extension(id) else {
            return Ok(pkt);
        };

        let pairs: Vec<(u32, u8)> = rtp
            .header
            .csrc
            .iter()
            .zip(levels.iter())
            .map(|(csrc, level)| (*csrc, level & 0x7F))
            .collect();
        trace!("ssrc {} csrc levels {:?}", rtp.header.ssrc, pairs);
        self.listeners.notify(rtp.header.ssrc, &pairs);

        rtp.header.del_extension(id)?;
        RawPacket::from_rtp(&rtp, pkt.now)
    }
}

impl TransformStage for CsrcTransformer {
    fn name(&self) -> &'static str {
        "csrc"
    }

    fn transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        let entries = self.list.get();
        if entries.is_empty() {
            return Ok(pkts);
        }
        pkts.into_iter()
            .map(|pkt| self.stamp(pkt, &entries))
            .collect()
    }

    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        let Some(id) = self.extension_id else {
            return Ok(pkts);
        };
        pkts.into_iter()
            .map(|pkt| {
                if pkt.has_extension() {
                    self.strip(pkt, id)
                } else {
                    Ok(pkt)
                }
            })
            .collect()
    }

    fn bind_extensions(&mut self, extensions: &ExtensionMap) {
        self.extension_id = extensions.id_for(CSRC_AUDIO_LEVEL_URI);
        debug!("csrc audio level extension id {:?}", self.extension_id);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ExtensionDescriptor;
    use crate::transform::test_util::make_raw_rtp;

    fn bound(media_type: MediaType) -> CsrcTransformer {
        let mut stage = CsrcTransformerBuilder::new()
            .with_media_type(media_type)
            .build();
        let mut map = ExtensionMap::new();
        map.insert(3, ExtensionDescriptor::new(CSRC_AUDIO_LEVEL_URI));
        stage.bind_extensions(&map);
        stage
    }

    #[test]
    fn test_csrc_stamp_and_strip() -> Result<()> {
        let mut stage = bound(MediaType::Audio);
        stage.list().set(vec![
            CsrcEntry::new(0x11).with_level(30),
            CsrcEntry::new(0x22).with_level(90),
        ]);

        let payload = [1u8, 2, 3, 4];
        let out = stage.transform_rtp(vec![make_raw_rtp(111, 1, 0xABCD, &payload)])?;
        let rtp = out[0].to_rtp()?;
        assert_eq!(rtp.header.csrc, vec![0x11, 0x22]);
        assert_eq!(
            rtp.header.get_extension(3),
            Some(Bytes::from_static(&[30, 90]))
        );

        let seen = Arc::new(Mutex::new(vec![]));
        let seen2 = Arc::clone(&seen);
        stage.listeners().add(Box::new(move |ssrc, levels| {
            seen2.lock().push((ssrc, levels.to_vec()));
        }));

        let back = stage.reverse_transform_rtp(out)?;
        let rtp = back[0].to_rtp()?;
        assert!(rtp.header.get_extension(3).is_none());
        assert_eq!(&rtp.payload[..], &payload);
        assert_eq!(
            *seen.lock(),
            vec![(0xABCD, vec![(0x11, 30), (0x22, 90)])]
        );
        Ok(())
    }

    #[test]
    fn test_csrc_video_has_no_levels() -> Result<()> {
        let mut stage = bound(MediaType::Video);
        stage.list().set(vec![CsrcEntry::new(7).with_level(10)]);

        let out = stage.transform_rtp(vec![make_raw_rtp(96, 1, 1, &[0])])?;
        let rtp = out[0].to_rtp()?;
        assert_eq!(rtp.header.csrc, vec![7]);
        assert!(!rtp.header.extension);
        Ok(())
    }

    #[test]
    fn test_csrc_empty_list_is_identity() -> Result<()> {
        let mut stage = bound(MediaType::Audio);
        let pkt = make_raw_rtp(111, 9, 5, &[9, 9]);
        let out = stage.transform_rtp(vec![pkt.clone()])?;
        assert_eq!(out, vec![pkt]);
        Ok(())
    }
}
