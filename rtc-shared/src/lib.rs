#![warn(rust_2018_idioms)]
#![allow(dead_code)]

#[cfg(feature = "marshal")]
pub mod marshal;

pub mod error;
pub mod tcp_framing;
pub mod time;
mod transport;
pub mod util;

pub use transport::TransportProtocol;
