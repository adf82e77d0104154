use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::debug;
use shared::error::{Error, Result};

use super::{MediaKind, MediaStream, StageHandles};
use crate::config::MediaStreamConfig;
use crate::format::{FormatRegistry, MediaType};
use crate::transform::csrc::{CsrcAudioLevelListener, CsrcEntry};
use crate::transform::dtmf::{DEFAULT_DTMF_VOLUME, DtmfTone, DtmfTransformer};
use crate::transform::ssrc_audio_level::{
    AudioLevelListener, SsrcAudioLevelBuilder, SsrcAudioLevelTransformer,
};
use crate::transform::{StageSlot, TransformStage};

/// Audio streams carry DTMF and the audio level stages.
#[derive(Debug, Default, Copy, Clone)]
pub struct AudioKind;

impl MediaKind for AudioKind {
    fn media_type(&self) -> MediaType {
        MediaType::Audio
    }

    fn create_dtmf_stage(&self, handles: &StageHandles) -> Option<Box<dyn TransformStage>> {
        Some(Box::new(DtmfTransformer::new(handles.dtmf.clone())))
    }

    fn create_ssrc_audio_level_stage(
        &self,
        handles: &StageHandles,
    ) -> Option<Box<dyn TransformStage>> {
        Some(Box::new(
            SsrcAudioLevelBuilder::new()
                .with_drop_silence(handles.drop_silence.load(Ordering::Acquire))
                .with_listeners(handles.audio_levels.clone())
                .with_local_level(handles.local_level.clone())
                .build(),
        ))
    }

    fn priority(&self) -> u8 {
        7
    }
}

/// A [`MediaStream`] of audio, with DTMF and audio level control.
#[derive(Debug, Clone)]
pub struct AudioMediaStream {
    stream: MediaStream,
}

impl Deref for AudioMediaStream {
    type Target = MediaStream;

    fn deref(&self) -> &MediaStream {
        &self.stream
    }
}

impl AudioMediaStream {
    pub fn new(config: MediaStreamConfig, registry: Arc<dyn FormatRegistry>) -> Result<Self> {
        let config = MediaStreamConfig {
            media_type: MediaType::Audio,
            ..config
        };
        Ok(Self {
            stream: MediaStream::new(config, Box::new(AudioKind), registry)?,
        })
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    /// Queues `tone`; it replaces outgoing audio until
    /// [`AudioMediaStream::stop_sending_dtmf`]. Fails when no
    /// telephone-event payload type is negotiated.
    pub fn start_sending_dtmf(&self, tone: DtmfTone) -> Result<()> {
        self.start_sending_dtmf_with_volume(tone, DEFAULT_DTMF_VOLUME)
    }

    pub fn start_sending_dtmf_with_volume(&self, tone: DtmfTone, volume: u8) -> Result<()> {
        self.stream.ensure_open()?;
        let negotiated = self
            .stream
            .dynamic_rtp_payload_types()
            .values()
            .any(|f| f.is_telephone_event());
        if !negotiated {
            return Err(Error::ErrNegotiation(
                "telephone-event not negotiated".to_owned(),
            ));
        }
        self.stream.handles().dtmf.start_sending_with_volume(tone, volume);
        Ok(())
    }

    pub fn stop_sending_dtmf(&self) {
        self.stream.handles().dtmf.stop_sending();
    }

    pub fn is_sending_dtmf(&self) -> bool {
        self.stream.handles().dtmf.is_active()
    }

    /// Called with (ssrc, level) for every inbound packet carrying the
    /// ssrc-audio-level extension.
    pub fn add_audio_level_listener(&self, listener: AudioLevelListener) {
        self.stream.handles().audio_levels.add(listener);
    }

    pub fn add_csrc_audio_level_listener(&self, listener: CsrcAudioLevelListener) {
        self.stream.handles().csrc_listeners.add(listener);
    }

    /// Level stamped on outbound packets, in -dBov.
    pub fn set_local_audio_level(&self, level: u8, voice: bool) {
        self.stream.handles().local_level.set(level, voice);
    }

    pub fn clear_local_audio_level(&self) {
        self.stream.handles().local_level.clear();
    }

    /// Contributing sources of the mix this stream sends.
    pub fn set_csrc_list(&self, entries: Vec<CsrcEntry>) {
        self.stream.handles().csrcs.set(entries);
    }

    /// Drops inbound packets flagged as silence before they reach the rest
    /// of the chain.
    pub fn set_drop_silence(&self, drop_silence: bool) {
        debug!("stream {}: drop silence {}", self.stream.id(), drop_silence);
        self.stream
            .handles()
            .drop_silence
            .store(drop_silence, Ordering::Release);
        self.stream
            .with_stage::<SsrcAudioLevelTransformer, _>(StageSlot::SsrcAudioLevel, |stage| {
                stage.set_drop_silence(drop_silence)
            });
    }

    pub fn silence_dropped(&self) -> u64 {
        self.stream
            .with_stage::<SsrcAudioLevelTransformer, _>(StageSlot::SsrcAudioLevel, |stage| {
                stage.silence_dropped()
            })
            .unwrap_or_default()
    }
}
