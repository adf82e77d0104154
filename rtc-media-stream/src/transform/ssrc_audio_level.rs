//! Client-to-mixer audio level (RFC 6464).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use rtp::extension::SSRC_AUDIO_LEVEL_URI;
use rtp::extension::audio_level_extension::AudioLevelExtension;
use shared::error::Result;
use shared::marshal::{Marshal, Unmarshal};

use super::TransformStage;
use crate::format::ExtensionMap;
use crate::packet::RawPacket;

/// Called with the SSRC and level (-dBov) of each inbound audio packet.
pub type AudioLevelListener = Box<dyn Fn(u32, u8) + Send + Sync>;

#[derive(Clone, Default)]
pub struct AudioLevelListeners {
    inner: Arc<RwLock<Vec<AudioLevelListener>>>,
}

impl fmt::Debug for AudioLevelListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioLevelListeners")
            .field("len", &self.inner.read().len())
            .finish()
    }
}

impl AudioLevelListeners {
    pub fn add(&self, listener: AudioLevelListener) {
        self.inner.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    fn notify(&self, ssrc: u32, level: u8) {
        for listener in self.inner.read().iter() {
            listener(ssrc, level);
        }
    }
}

/// Level of the locally captured audio, set by the capture device.
#[derive(Debug, Clone, Default)]
pub struct LocalAudioLevel {
    level: Arc<Mutex<Option<AudioLevelExtension>>>,
}

impl LocalAudioLevel {
    pub fn set(&self, level: u8, voice: bool) {
        *self.level.lock() = Some(AudioLevelExtension {
            level: level.min(127),
            voice,
        });
    }

    pub fn clear(&self) {
        *self.level.lock() = None;
    }

    pub fn get(&self) -> Option<AudioLevelExtension> {
        *self.level.lock()
    }
}

#[derive(Debug, Default)]
pub struct SsrcAudioLevelBuilder {
    drop_silence: bool,
    listeners: AudioLevelListeners,
    local_level: LocalAudioLevel,
}

impl SsrcAudioLevelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops inbound packets whose level is silence (127 -dBov).
    pub fn with_drop_silence(mut self, drop_silence: bool) -> Self {
        self.drop_silence = drop_silence;
        self
    }

    pub fn with_listeners(mut self, listeners: AudioLevelListeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn with_local_level(mut self, local_level: LocalAudioLevel) -> Self {
        self.local_level = local_level;
        self
    }

    pub fn build(self) -> SsrcAudioLevelTransformer {
        SsrcAudioLevelTransformer {
            drop_silence: self.drop_silence,
            listeners: self.listeners,
            local_level: self.local_level,
            extension_id: None,
            silence_dropped: 0,
        }
    }
}

#[derive(Debug)]
pub struct SsrcAudioLevelTransformer {
    drop_silence: bool,
    listeners: AudioLevelListeners,
    local_level: LocalAudioLevel,
    extension_id: Option<u8>,
    silence_dropped: u64,
}

impl SsrcAudioLevelTransformer {
    pub fn listeners(&self) -> AudioLevelListeners {
        self.listeners.clone()
    }

    pub fn local_level(&self) -> LocalAudioLevel {
        self.local_level.clone()
    }

    pub fn set_drop_silence(&mut self, drop_silence: bool) {
        self.drop_silence = drop_silence;
    }

    pub fn silence_dropped(&self) -> u64 {
        self.silence_dropped
    }

    fn read(pkt: &RawPacket, id: u8) -> Option<AudioLevelExtension> {
        let mut raw = pkt.header_extension(id)?;
        AudioLevelExtension::unmarshal(&mut raw).ok()
    }
}

impl TransformStage for SsrcAudioLevelTransformer {
    fn name(&self) -> &'static str {
        "ssrc-audio-level"
    }

    fn transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        let (Some(id), Some(level)) = (self.extension_id, self.local_level.get()) else {
            return Ok(pkts);
        };

        let raw = level.marshal()?;
        pkts.into_iter()
            .map(|mut pkt| {
                pkt.set_header_extension(id, &raw)?;
                Ok(pkt)
            })
            .collect()
    }

    fn reverse_transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        let Some(id) = self.extension_id else {
            return Ok(pkts);
        };

        let mut out = Vec::with_capacity(pkts.len());
        for pkt in pkts {
            match Self::read(&pkt, id) {
                Some(level) if level.is_silence() && self.drop_silence => {
                    trace!("ssrc {} silent, dropped", pkt.ssrc());
                    self.silence_dropped += 1;
                }
                Some(level) => {
                    self.listeners.notify(pkt.ssrc(), level.level);
                    out.push(pkt);
                }
                None => out.push(pkt),
            }
        }
        Ok(out)
    }

    fn bind_extensions(&mut self, extensions: &ExtensionMap) {
        self.extension_id = extensions.id_for(SSRC_AUDIO_LEVEL_URI);
        debug!("ssrc audio level extension id {:?}", self.extension_id);
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

    fn bound(drop_silence: bool) -> SsrcAudioLevelTransformer {
        let mut stage = SsrcAudioLevelBuilder::new()
            .with_drop_silence(drop_silence)
            .build();
        let mut map = ExtensionMap::new();
        map.insert(1, ExtensionDescriptor::new(SSRC_AUDIO_LEVEL_URI));
        stage.bind_extensions(&map);
        stage
    }

    #[test]
    fn test_audio_level_stamp_and_read() -> Result<()> {
        let mut stage = bound(false);
        let levels = Arc::new(Mutex::new(vec![]));
        let levels2 = Arc::clone(&levels);
        stage
            .listeners()
            .add(Box::new(move |ssrc, level| levels2.lock().push((ssrc, level))));

        let pkt = make_raw_rtp(111, 1, 0xA, &[1, 2, 3]);
        assert_eq!(stage.transform_rtp(vec![pkt.clone()])?, vec![pkt.clone()]);

        stage.local_level().set(42, true);
        let out = stage.transform_rtp(vec![pkt])?;
        assert!(out[0].has_extension());

        let back = stage.reverse_transform_rtp(out)?;
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].payload(), &[1, 2, 3]);
        assert_eq!(*levels.lock(), vec![(0xA, 42)]);
        Ok(())
    }

    #[test]
    fn test_silence_dropped_when_enabled() -> Result<()> {
        let tests = vec![(true, 0usize, 1u64), (false, 1, 0)];

        for (drop_silence, kept, dropped) in tests {
            let mut stage = bound(drop_silence);
            stage.local_level().set(127, false);
            let out = stage.transform_rtp(vec![make_raw_rtp(111, 1, 1, &[0])])?;

            let back = stage.reverse_transform_rtp(out)?;
            assert_eq!(back.len(), kept);
            assert_eq!(stage.silence_dropped(), dropped);
        }
        Ok(())
    }
}
