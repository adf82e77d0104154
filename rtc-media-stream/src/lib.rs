#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod collaborators;
pub mod config;
pub mod connector;
pub mod direction;
pub mod format;
pub mod packet;
pub mod ssrc;
pub mod stats;
pub mod stream;
pub mod transform;

pub use config::MediaStreamConfig;
pub use connector::RtpConnector;
pub use direction::{MediaDirection, StreamDirection};
pub use format::{MediaFormat, MediaType};
pub use packet::{PacketKind, PacketPool, RawPacket};
pub use stream::audio::AudioMediaStream;
pub use stream::video::VideoMediaStream;
pub use stream::{MediaStream, MediaStreamEvent, ReceiveStreamEvent};
