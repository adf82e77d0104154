use std::time::Duration;

use bytes::{Buf, BufMut};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};
use shared::time::SystemInstant;

pub const ABS_SEND_TIME_EXTENSION_SIZE: usize = 3;

/// AbsSendTimeExtension is a extension payload format in
/// http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time
///
/// The 24-bit value is the NTP send time in 6.18 fixed point seconds.
#[derive(PartialEq, Eq, Debug, Default, Copy, Clone)]
pub struct AbsSendTimeExtension {
    pub timestamp: u32,
}

impl Unmarshal for AbsSendTimeExtension {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if raw_packet.remaining() < ABS_SEND_TIME_EXTENSION_SIZE {
            return Err(Error::ErrBufferTooSmall);
        }
        let b0 = raw_packet.get_u8() as u32;
        let b1 = raw_packet.get_u8() as u32;
        let b2 = raw_packet.get_u8() as u32;

        Ok(AbsSendTimeExtension {
            timestamp: (b0 << 16) | (b1 << 8) | b2,
        })
    }
}

impl MarshalSize for AbsSendTimeExtension {
    fn marshal_size(&self) -> usize {
        ABS_SEND_TIME_EXTENSION_SIZE
    }
}

impl Marshal for AbsSendTimeExtension {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < ABS_SEND_TIME_EXTENSION_SIZE {
            return Err(Error::ErrBufferTooSmall);
        }

        buf.put_u8(((self.timestamp >> 16) & 0xFF) as u8);
        buf.put_u8(((self.timestamp >> 8) & 0xFF) as u8);
        buf.put_u8((self.timestamp & 0xFF) as u8);

        Ok(ABS_SEND_TIME_EXTENSION_SIZE)
    }
}

impl AbsSendTimeExtension {
    /// Builds the extension from a send time given as duration since the unix epoch.
    pub fn new(send_time: Duration) -> Self {
        AbsSendTimeExtension {
            timestamp: ((SystemInstant::unix2ntp(send_time) >> 14) & 0x00FF_FFFF) as u32,
        }
    }

    /// Reconstructs the absolute send time using the receive time to
    /// resolve the 64 second wrap of the 24-bit field.
    pub fn estimate(&self, receive: Duration) -> Duration {
        let receive_ntp = SystemInstant::unix2ntp(receive);
        let mut ntp = (receive_ntp & 0xFFFF_FFC0_0000_0000) | ((self.timestamp as u64) << 14);
        if receive_ntp < ntp {
            // Receive time must be always later than send time
            ntp = ntp.wrapping_sub(0x0000_0040_0000_0000);
        }

        SystemInstant::ntp2unix(ntp)
    }
}
