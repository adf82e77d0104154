//! Wall-clock anchoring and NTP time formats used by RTCP timing fields.

use std::ops::Add;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the unix epoch (1970).
pub const NTP_UNIX_OFFSET_SECS: u64 = 0x83AA7E80;

/// An [`Instant`] pinned to the wall clock at construction, so monotonic
/// instants can be converted into NTP timestamps.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SystemInstant {
    instant: Instant,
    duration_since_unix_epoch: Duration,
}

impl Default for SystemInstant {
    fn default() -> Self {
        Self::now()
    }
}

impl SystemInstant {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            duration_since_unix_epoch: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_secs(0)),
        }
    }

    pub fn duration_since_unix_epoch(&self) -> Duration {
        self.duration_since_unix_epoch
    }

    pub fn unix(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.instant)
            .add(self.duration_since_unix_epoch)
    }

    /// 64-bit NTP timestamp of `now`.
    pub fn ntp(&self, now: Instant) -> u64 {
        SystemInstant::unix2ntp(self.unix(now))
    }

    /// NTP short format (middle 32 bits) of `now`.
    pub fn ntp_short(&self, now: Instant) -> u32 {
        ntp_to_short(self.ntp(now))
    }

    pub fn unix2ntp(duration_since_unix_epoch: Duration) -> u64 {
        let secs = duration_since_unix_epoch.as_secs() + NTP_UNIX_OFFSET_SECS;
        let frac =
            ((duration_since_unix_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;

        (secs << 32) | frac
    }

    pub fn ntp2unix(ntp: u64) -> Duration {
        let secs = (ntp >> 32).saturating_sub(NTP_UNIX_OFFSET_SECS);
        let nanos = ((ntp & 0xFFFF_FFFF) * 1_000_000_000) >> 32;

        Duration::new(secs, nanos as u32)
    }
}

/// Middle 32 bits of a 64-bit NTP timestamp (16.16 fixed point seconds).
pub fn ntp_to_short(ntp: u64) -> u32 {
    (ntp >> 16) as u32
}

/// Converts a signed NTP short-format interval to milliseconds.
pub fn ntp_short_to_ms(ntp_short: i64) -> i64 {
    (ntp_short * 1000) >> 16
}

/// Converts milliseconds to an NTP short-format interval.
pub fn ms_to_ntp_short(ms: u64) -> u32 {
    ((ms << 16) / 1000) as u32
}

/// Converts a [`Duration`] into 1/65536 second units, as carried by DLSR.
pub fn duration_to_ntp_short(d: Duration) -> u32 {
    (d.as_secs_f64() * 65536.0) as u32
}
