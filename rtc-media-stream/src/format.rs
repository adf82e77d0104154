//! Media format descriptors, the read-only format registry and the
//! negotiated header extension map.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::direction::MediaDirection;

pub const RTX_ENCODING: &str = "rtx";
pub const RED_ENCODING: &str = "red";
pub const ULPFEC_ENCODING: &str = "ulpfec";
pub const FLEXFEC_ENCODING: &str = "flexfec-03";
pub const TELEPHONE_EVENT_ENCODING: &str = "telephone-event";

/// Format parameter naming the payload type an RTX format repairs.
pub const APT_PARAMETER: &str = "apt";

pub const DEFAULT_AUDIO_CLOCK_RATE: u32 = 48000;
pub const DEFAULT_VIDEO_CLOCK_RATE: u32 = 90000;

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    #[default]
    Audio,
    Video,
}

impl MediaType {
    /// Clock rate assumed when no negotiated format is known.
    pub fn default_clock_rate(&self) -> u32 {
        match self {
            MediaType::Audio => DEFAULT_AUDIO_CLOCK_RATE,
            MediaType::Video => DEFAULT_VIDEO_CLOCK_RATE,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Audio => write!(f, "audio"),
            MediaType::Video => write!(f, "video"),
        }
    }
}

/// One negotiated encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFormat {
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub media_type: MediaType,
    pub parameters: Vec<(String, String)>,
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.encoding, self.clock_rate)?;
        if self.channels > 1 {
            write!(f, "/{}", self.channels)?;
        }
        Ok(())
    }
}

impl MediaFormat {
    pub fn new(encoding: &str, clock_rate: u32, media_type: MediaType) -> Self {
        Self {
            encoding: encoding.to_owned(),
            clock_rate,
            channels: 1,
            media_type,
            parameters: vec![],
        }
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_parameter(mut self, name: &str, value: &str) -> Self {
        self.parameters.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn is(&self, encoding: &str) -> bool {
        self.encoding.eq_ignore_ascii_case(encoding)
    }

    pub fn is_rtx(&self) -> bool {
        self.is(RTX_ENCODING)
    }

    pub fn is_red(&self) -> bool {
        self.is(RED_ENCODING)
    }

    pub fn is_fec(&self) -> bool {
        self.is(ULPFEC_ENCODING) || self.is(FLEXFEC_ENCODING)
    }

    pub fn is_telephone_event(&self) -> bool {
        self.is(TELEPHONE_EVENT_ENCODING)
    }

    /// Associated payload type of an RTX format.
    pub fn apt(&self) -> Option<u8> {
        self.parameter(APT_PARAMETER)?.parse().ok()
    }
}

/// Read-only lookup of static encodings, owned by the caller.
pub trait FormatRegistry: Send + Sync {
    /// Payload type registered for the given encoding, if any.
    fn payload_type(&self, encoding: &str, clock_rate: u32) -> Option<u8>;

    /// Channel count of the given encoding.
    fn channels(&self, encoding: &str, clock_rate: u32) -> Option<u16>;

    /// Format statically bound to `payload_type`.
    fn format(&self, payload_type: u8) -> Option<MediaFormat>;
}

/// A [`FormatRegistry`] backed by a fixed table.
#[derive(Debug, Clone, Default)]
pub struct StaticFormatRegistry {
    entries: Vec<(u8, MediaFormat)>,
}

impl StaticFormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The RFC 3551 static payload types commonly seen in practice.
    pub fn rfc3551() -> Self {
        Self::new()
            .with_format(0, MediaFormat::new("PCMU", 8000, MediaType::Audio))
            .with_format(3, MediaFormat::new("GSM", 8000, MediaType::Audio))
            .with_format(8, MediaFormat::new("PCMA", 8000, MediaType::Audio))
            .with_format(9, MediaFormat::new("G722", 8000, MediaType::Audio))
            .with_format(18, MediaFormat::new("G729", 8000, MediaType::Audio))
            .with_format(34, MediaFormat::new("H263", 90000, MediaType::Video))
    }

    pub fn with_format(mut self, payload_type: u8, format: MediaFormat) -> Self {
        self.entries.retain(|(pt, _)| *pt != payload_type);
        self.entries.push((payload_type, format));
        self
    }
}

impl FormatRegistry for StaticFormatRegistry {
    fn payload_type(&self, encoding: &str, clock_rate: u32) -> Option<u8> {
        self.entries
            .iter()
            .find(|(_, f)| f.encoding.eq_ignore_ascii_case(encoding) && f.clock_rate == clock_rate)
            .map(|(pt, _)| *pt)
    }

    fn channels(&self, encoding: &str, clock_rate: u32) -> Option<u16> {
        self.entries
            .iter()
            .find(|(_, f)| f.encoding.eq_ignore_ascii_case(encoding) && f.clock_rate == clock_rate)
            .map(|(_, f)| f.channels)
    }

    fn format(&self, payload_type: u8) -> Option<MediaFormat> {
        self.entries
            .iter()
            .find(|(pt, _)| *pt == payload_type)
            .map(|(_, f)| f.clone())
    }
}

/// A negotiated header extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtensionDescriptor {
    pub uri: String,
    pub direction: MediaDirection,
}

impl ExtensionDescriptor {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_owned(),
            direction: MediaDirection::SendRecv,
        }
    }

    pub fn with_direction(mut self, direction: MediaDirection) -> Self {
        self.direction = direction;
        self
    }
}

/// Active header extension bindings, keyed by extension id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionMap {
    extensions: BTreeMap<u8, ExtensionDescriptor>,
}

impl ExtensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u8, descriptor: ExtensionDescriptor) -> Option<ExtensionDescriptor> {
        self.extensions.insert(id, descriptor)
    }

    pub fn remove(&mut self, id: u8) -> Option<ExtensionDescriptor> {
        self.extensions.remove(&id)
    }

    pub fn get(&self, id: u8) -> Option<&ExtensionDescriptor> {
        self.extensions.get(&id)
    }

    /// Id bound to `uri`, if the extension was negotiated.
    pub fn id_for(&self, uri: &str) -> Option<u8> {
        self.extensions
            .iter()
            .find(|(_, d)| d.uri == uri)
            .map(|(id, _)| *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u8, &ExtensionDescriptor)> {
        self.extensions.iter()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn clear(&mut self) {
        self.extensions.clear();
    }
}
