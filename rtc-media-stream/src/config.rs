//! Engine configuration, constructed by the caller and passed in.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::format::MediaType;

pub const DEFAULT_POOL_CAPACITY: usize = 256;
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_STATS_UPDATE_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_RTCP_REPORT_INTERVAL_MS: u64 = 500;

/// Limits of the outbound packet cache used to answer retransmission requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Packets older than this are evicted.
    pub size_millis: u64,
    /// Number of SSRCs cached at once; packets of further SSRCs are not cached.
    pub max_ssrc_count: usize,
    /// Hard cap of packets per SSRC.
    pub max_size_packets: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_millis: 1000,
            max_ssrc_count: 50,
            max_size_packets: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetransmissionConfig {
    /// Gaps wider than this reset the requester instead of being requested.
    pub max_missing: u16,
    /// Times a single sequence number is requested before giving up.
    pub max_requests: u32,
    pub re_request_after_ms: u64,
    /// Upper bound on the time between two requester wakeups.
    pub wakeup_interval_ms: u64,
}

impl Default for RetransmissionConfig {
    fn default() -> Self {
        Self {
            max_missing: 100,
            max_requests: 10,
            re_request_after_ms: 150,
            wakeup_interval_ms: 1000,
        }
    }
}

/// Configuration of one [`MediaStream`](crate::stream::MediaStream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaStreamConfig {
    pub media_type: MediaType,
    /// First value returned by the SSRC generator.
    pub initial_local_ssrc: Option<u32>,
    pub pool_capacity: usize,
    pub receive_buffer_size: usize,
    pub receive_timeout_ms: u64,
    pub stats_update_interval_ms: u64,
    pub rtcp_report_interval_ms: u64,
    pub caching: CacheConfig,
    pub retransmission: RetransmissionConfig,
    /// Whether the stream relays media for other participants.
    pub translator_mode: bool,
}

impl Default for MediaStreamConfig {
    fn default() -> Self {
        Self {
            media_type: MediaType::Audio,
            initial_local_ssrc: None,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            stats_update_interval_ms: DEFAULT_STATS_UPDATE_INTERVAL_MS,
            rtcp_report_interval_ms: DEFAULT_RTCP_REPORT_INTERVAL_MS,
            caching: CacheConfig::default(),
            retransmission: RetransmissionConfig::default(),
            translator_mode: false,
        }
    }
}

impl MediaStreamConfig {
    pub fn new(media_type: MediaType) -> Self {
        Self {
            media_type,
            ..Default::default()
        }
    }

    pub fn with_initial_local_ssrc(mut self, ssrc: u32) -> Self {
        self.initial_local_ssrc = Some(ssrc);
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_caching(mut self, caching: CacheConfig) -> Self {
        self.caching = caching;
        self
    }

    pub fn with_retransmission(mut self, retransmission: RetransmissionConfig) -> Self {
        self.retransmission = retransmission;
        self
    }

    pub fn with_translator_mode(mut self, translator_mode: bool) -> Self {
        self.translator_mode = translator_mode;
        self
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn rtcp_report_interval(&self) -> Duration {
        Duration::from_millis(self.rtcp_report_interval_ms)
    }

    pub fn stats_update_interval(&self) -> Duration {
        Duration::from_millis(self.stats_update_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_stream_config_defaults() {
        let config = MediaStreamConfig::default();
        assert_eq!(config.pool_capacity, 256);
        assert_eq!(config.receive_buffer_size, 4096);
        assert_eq!(config.receive_timeout(), Duration::from_secs(1));
        assert_eq!(config.rtcp_report_interval(), Duration::from_millis(500));
        assert_eq!(config.caching.max_ssrc_count, 50);
        assert_eq!(config.retransmission.max_missing, 100);
        assert!(!config.translator_mode);
    }

    #[test]
    fn test_media_stream_config_partial_json() {
        let config: MediaStreamConfig = serde_json::from_str(
            r#"{
                "media_type": "Video",
                "initial_local_ssrc": 1234,
                "caching": { "size_millis": 2000 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.media_type, MediaType::Video);
        assert_eq!(config.initial_local_ssrc, Some(1234));
        assert_eq!(config.caching.size_millis, 2000);
        assert_eq!(config.caching.max_size_packets, 500);
        assert_eq!(config.pool_capacity, DEFAULT_POOL_CAPACITY);

        let json = serde_json::to_string(&config).unwrap();
        let back: MediaStreamConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_media_stream_config_builder() {
        let config = MediaStreamConfig::new(MediaType::Video)
            .with_initial_local_ssrc(7)
            .with_pool_capacity(8)
            .with_receive_timeout(Duration::from_millis(50))
            .with_translator_mode(true);

        assert_eq!(config.media_type, MediaType::Video);
        assert_eq!(config.initial_local_ssrc, Some(7));
        assert_eq!(config.pool_capacity, 8);
        assert_eq!(config.receive_timeout_ms, 50);
        assert!(config.translator_mode);
    }
}
