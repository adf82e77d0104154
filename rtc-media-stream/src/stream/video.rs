use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use shared::error::{Error, Result};

use super::{MediaKind, MediaStream, StageHandles};
use crate::config::MediaStreamConfig;
use crate::format::{FormatRegistry, MediaType};
use crate::packet::RawPacket;
use crate::stats::SharedStats;
use crate::transform::TransformStage;
use crate::transform::caching::PacketCache;
use crate::transform::fec::FecReceiver;
use crate::transform::red::RedTransformer;
use crate::transform::rtx::RtxTransformer;

/// Video streams cache what they send and add the FEC, RED and RTX stages.
#[derive(Debug, Default, Copy, Clone)]
pub struct VideoKind {
    /// Wrap outbound media in RED when a RED payload type is negotiated.
    pub red_encapsulation: bool,
}

impl MediaKind for VideoKind {
    fn media_type(&self) -> MediaType {
        MediaType::Video
    }

    fn create_fec_stage(&self, stats: &SharedStats) -> Option<Box<dyn TransformStage>> {
        Some(Box::new(FecReceiver::new().with_stats(Arc::clone(stats))))
    }

    fn create_red_stage(&self) -> Option<Box<dyn TransformStage>> {
        Some(Box::new(
            RedTransformer::new().with_encapsulation(self.red_encapsulation),
        ))
    }

    fn create_rtx_stage(&self, handles: &StageHandles) -> Option<Box<dyn TransformStage>> {
        Some(Box::new(RtxTransformer::new(
            handles.cache.clone(),
            handles.rtx_ssrcs.clone(),
        )))
    }

    fn uses_caching(&self) -> bool {
        true
    }

    fn uses_retransmission_requester(&self) -> bool {
        true
    }
}

/// A [`MediaStream`] of video.
#[derive(Debug, Clone)]
pub struct VideoMediaStream {
    stream: MediaStream,
}

impl Deref for VideoMediaStream {
    type Target = MediaStream;

    fn deref(&self) -> &MediaStream {
        &self.stream
    }
}

impl VideoMediaStream {
    pub fn new(config: MediaStreamConfig, registry: Arc<dyn FormatRegistry>) -> Result<Self> {
        Self::with_kind(config, VideoKind::default(), registry)
    }

    pub fn with_kind(
        config: MediaStreamConfig,
        kind: VideoKind,
        registry: Arc<dyn FormatRegistry>,
    ) -> Result<Self> {
        let config = MediaStreamConfig {
            media_type: MediaType::Video,
            ..config
        };
        Ok(Self {
            stream: MediaStream::new(config, Box::new(kind), registry)?,
        })
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    /// Sends a PLI asking the sender of `media_ssrc` for a key frame.
    pub fn request_key_frame(&self, media_ssrc: u32) -> Result<()> {
        let sender_ssrc = self
            .stream
            .local_source_id()
            .ok_or_else(|| Error::Other("no local ssrc".to_owned()))?;
        debug!(
            "stream {}: requesting key frame of {}",
            self.stream.id(),
            media_ssrc
        );
        let pli: Vec<Box<dyn rtcp::Packet>> = vec![Box::new(PictureLossIndication {
            sender_ssrc,
            media_ssrc,
        })];
        self.stream
            .send_rtcp(RawPacket::from_rtcp(&pli, Instant::now())?)
    }

    /// Pairs `media_ssrc` with the SSRC its retransmissions are sent on.
    pub fn set_rtx_ssrc(&self, media_ssrc: u32, rtx_ssrc: u32) {
        self.stream.handles().rtx_ssrcs.insert(media_ssrc, rtx_ssrc);
    }

    pub fn remove_rtx_ssrc(&self, media_ssrc: u32) -> Option<u32> {
        self.stream.handles().rtx_ssrcs.remove(media_ssrc)
    }

    pub fn rtx_ssrc(&self, media_ssrc: u32) -> Option<u32> {
        self.stream.handles().rtx_ssrcs.rtx_ssrc(media_ssrc)
    }

    /// Recently sent packets, served to retransmission requests.
    pub fn packet_cache(&self) -> &PacketCache {
        &self.stream.handles().cache
    }

    /// Transport-wide sequence numbers received and their arrival times.
    pub fn transport_cc_received(&self) -> Vec<(u16, Instant)> {
        self.stream.handles().tcc.received_packets()
    }

    /// Latest receive bitrate estimate, in bits per second.
    pub fn remote_bitrate_estimate(&self) -> Option<u64> {
        self.stream.handles().bitrate_estimate.latest_estimate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::transport::PacketTransport;
    use crate::connector::transport::mock::MockTransport;
    use crate::format::StaticFormatRegistry;
    use crate::stream::MediaStreamEvent;
    use crate::transform::test_util::make_raw_rtcp;
    use parking_lot::Mutex;

    fn video_stream(ssrc: u32) -> VideoMediaStream {
        VideoMediaStream::new(
            MediaStreamConfig::default().with_initial_local_ssrc(ssrc),
            Arc::new(StaticFormatRegistry::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_video_stream_chain_has_video_stages() {
        let stream = video_stream(1);
        assert_eq!(stream.media_type(), MediaType::Video);
        let (data, _data_feed) = MockTransport::new();
        let (control, _control_feed) = MockTransport::new();
        stream.connect(Arc::new(data), Arc::new(control)).unwrap();

        let names = stream.stage_names();
        for name in ["fec", "red", "rtx", "caching"] {
            assert!(names.contains(&name), "missing {name} in {names:?}");
        }
        assert!(!names.contains(&"dtmf"));
        stream.close();
    }

    #[test]
    fn test_video_stream_sends_pli() {
        let stream = video_stream(0x4444);
        let (data, _data_feed) = MockTransport::new();
        let (control, _control_feed) = MockTransport::new();
        let control = Arc::new(control);
        stream
            .connect(
                Arc::new(data),
                Arc::clone(&control) as Arc<dyn PacketTransport>,
            )
            .unwrap();
        stream
            .inner
            .state
            .lock()
            .connector
            .as_ref()
            .unwrap()
            .add_target(MockTransport::peer(), MockTransport::peer());

        stream.request_key_frame(0x7777).unwrap();

        let sent = control.sent.lock();
        assert_eq!(sent.len(), 1);
        let packets = RawPacket::new(&sent[0].0, Instant::now()).to_rtcp().unwrap();
        let pli = packets[0]
            .as_any()
            .downcast_ref::<PictureLossIndication>()
            .unwrap();
        assert_eq!(pli.sender_ssrc, 0x4444);
        assert_eq!(pli.media_ssrc, 0x7777);
        drop(sent);
        stream.close();
    }

    #[test]
    fn test_video_stream_reports_inbound_pli() {
        let stream = video_stream(0x4444);
        let (data, _data_feed) = MockTransport::new();
        let (control, _control_feed) = MockTransport::new();
        stream.connect(Arc::new(data), Arc::new(control)).unwrap();

        let events = Arc::new(Mutex::new(vec![]));
        let sink = Arc::clone(&events);
        stream.on_event(Box::new(move |e| sink.lock().push(e.clone())));

        stream
            .receive_rtcp(make_raw_rtcp(vec![Box::new(PictureLossIndication {
                sender_ssrc: 0x9999,
                media_ssrc: 0x4444,
            })]))
            .unwrap();

        assert_eq!(
            *events.lock(),
            vec![MediaStreamEvent::KeyFrameRequested(0x4444)]
        );
        stream.close();
    }

    #[test]
    fn test_video_stream_rtx_ssrcs() {
        let stream = video_stream(1);
        stream.set_rtx_ssrc(10, 11);
        assert_eq!(stream.rtx_ssrc(10), Some(11));
        assert_eq!(stream.remove_rtx_ssrc(10), Some(11));
        assert_eq!(stream.rtx_ssrc(10), None);
        assert!(stream.remote_bitrate_estimate().is_none());
        assert!(stream.transport_cc_received().is_empty());
    }
}
