//! Interfaces of the components a media stream works with but does not own:
//! capture/render devices, encryption and multi-party translation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use shared::error::Result;

use crate::connector::ConnectorKind;
use crate::direction::MediaDirection;
use crate::format::MediaFormat;
use crate::packet::RawPacket;
use crate::stats::SharedStats;
use crate::transform::TransformStage;

/// Device session property carrying the negotiated output format.
pub const OUTPUT_FORMAT_PROPERTY: &str = "output-format";
/// Device session property carrying the output data source.
pub const OUTPUT_DATA_SOURCE_PROPERTY: &str = "output-data-source";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub name: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

impl PropertyChange {
    pub fn new(name: &str, old: Option<String>, new: Option<String>) -> Self {
        Self {
            name: name.to_owned(),
            old,
            new,
        }
    }
}

pub type PropertyChangeFn = Box<dyn Fn(&PropertyChange) + Send + Sync>;

/// Inbound media of one remote SSRC, as handed to a device session.
pub trait ReceiveStreamHandle: Send + Sync {
    fn ssrc(&self) -> u32;
    fn data_source(&self) -> Option<&str>;
    fn last_activity(&self) -> Option<Instant>;
}

/// Capture and render side of a stream.
pub trait DeviceSession: Send + Sync {
    /// Starts capture (sending half) and/or playback (receiving half).
    fn start(&self, direction: MediaDirection) -> Result<()>;
    fn stop(&self, direction: MediaDirection);

    fn add_receive_stream(&self, stream: &dyn ReceiveStreamHandle);
    fn remove_receive_stream(&self, stream: &dyn ReceiveStreamHandle);

    /// Hands an inbound RTP packet, after the reverse chain, to the renderer.
    fn deliver(&self, _stream: &dyn ReceiveStreamHandle, _packet: &RawPacket) {}

    fn set_format(&self, format: &MediaFormat);

    /// Registers a callback for output format and data source changes.
    fn on_property_change(&self, handler: PropertyChangeFn);

    fn close(&self);
}

/// Plug-in point of SRTP or an equivalent. Failures raised while
/// registering are negotiation failures and reach the caller unchanged.
pub trait EncryptionControl: Send + Sync {
    fn register_user(&self, stream_id: u64) -> Result<()>;
    fn set_connector(&self, kind: ConnectorKind);
    /// Creates the stage occupying the encryption slot of the chain.
    fn create_stage(&self) -> Box<dyn TransformStage>;
    fn set_local_ssrc(&self, ssrc: u32);
    fn cleanup(&self);
}

/// Relay shared by several streams of a conference.
pub trait RtpTranslator: Send + Sync {
    fn add_stream(&self, stream_id: u64, stats: SharedStats);
    fn remove_stream(&self, stream_id: u64);

    /// Records that `ssrc` is received by the stream `stream_id`.
    fn add_receive_ssrc(&self, stream_id: u64, ssrc: u32);

    /// Statistics of the stream receiving `ssrc`, if any.
    fn stream_stats_for_receive_ssrc(&self, ssrc: u32) -> Option<SharedStats>;

    /// A receiver asked for a key frame of `media_ssrc`.
    fn request_key_frame(&self, _media_ssrc: u32) {}
}

/// Translator keeping its stream and SSRC tables in memory.
#[derive(Default)]
pub struct BasicRtpTranslator {
    streams: RwLock<HashMap<u64, SharedStats>>,
    receive_ssrcs: RwLock<HashMap<u32, u64>>,
}

impl fmt::Debug for BasicRtpTranslator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicRtpTranslator")
            .field("streams", &self.streams.read().len())
            .field("receive_ssrcs", &*self.receive_ssrcs.read())
            .finish()
    }
}

impl BasicRtpTranslator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    pub fn stream_for_receive_ssrc(&self, ssrc: u32) -> Option<u64> {
        self.receive_ssrcs.read().get(&ssrc).copied()
    }
}

impl RtpTranslator for BasicRtpTranslator {
    fn add_stream(&self, stream_id: u64, stats: SharedStats) {
        self.streams.write().insert(stream_id, stats);
    }

    fn remove_stream(&self, stream_id: u64) {
        self.streams.write().remove(&stream_id);
        self.receive_ssrcs.write().retain(|_, id| *id != stream_id);
    }

    fn add_receive_ssrc(&self, stream_id: u64, ssrc: u32) {
        self.receive_ssrcs.write().insert(ssrc, stream_id);
    }

    fn stream_stats_for_receive_ssrc(&self, ssrc: u32) -> Option<SharedStats> {
        let stream_id = self.stream_for_receive_ssrc(ssrc)?;
        self.streams.read().get(&stream_id).cloned()
    }
}
