#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! RTCP packet codec (RFC 3550, RFC 4585, RFC 5104) for the subset of
//! packets a media stream generates, terminates or inspects.

pub mod goodbye;
pub mod header;
pub mod packet;
pub mod payload_feedbacks;
pub mod raw_packet;
pub mod receiver_report;
pub mod reception_report;
pub mod sender_report;
pub mod transport_feedbacks;
mod util;

pub use packet::Packet;
