use std::fmt;

use crate::direction::MediaDirection;

/// Notifications a stream delivers, synchronously, on the thread that
/// caused them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaStreamEvent {
    LocalSsrcChanged { old: Option<u32>, new: u32 },
    RemoteSsrcAdded(u32),
    DirectionChanged {
        old: Option<MediaDirection>,
        new: Option<MediaDirection>,
    },
    ReceiveStreamAdded(u32),
    ReceiveStreamRemoved(u32),
    /// A remote receiver asked for a key frame of the given media SSRC.
    KeyFrameRequested(u32),
    Closed,
}

impl fmt::Display for MediaStreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaStreamEvent::LocalSsrcChanged { old, new } => {
                write!(f, "local ssrc {old:?} -> {new}")
            }
            MediaStreamEvent::RemoteSsrcAdded(ssrc) => write!(f, "remote ssrc {ssrc} added"),
            MediaStreamEvent::DirectionChanged { old, new } => {
                write!(f, "direction {old:?} -> {new:?}")
            }
            MediaStreamEvent::ReceiveStreamAdded(ssrc) => {
                write!(f, "receive stream {ssrc} added")
            }
            MediaStreamEvent::ReceiveStreamRemoved(ssrc) => {
                write!(f, "receive stream {ssrc} removed")
            }
            MediaStreamEvent::KeyFrameRequested(ssrc) => {
                write!(f, "key frame requested for {ssrc}")
            }
            MediaStreamEvent::Closed => write!(f, "closed"),
        }
    }
}

pub type MediaStreamEventFn = Box<dyn Fn(&MediaStreamEvent) + Send + Sync>;

/// Receive-side notifications coming from the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveStreamEvent {
    NewReceiveStream {
        ssrc: u32,
        data_source: Option<String>,
    },
    Timeout(u32),
    Bye(u32),
}

impl ReceiveStreamEvent {
    pub fn ssrc(&self) -> u32 {
        match self {
            ReceiveStreamEvent::NewReceiveStream { ssrc, .. } => *ssrc,
            ReceiveStreamEvent::Timeout(ssrc) | ReceiveStreamEvent::Bye(ssrc) => *ssrc,
        }
    }
}
