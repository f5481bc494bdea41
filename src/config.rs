//! Centralized configuration for Slipstream.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

/// Central configuration for all Slipstream components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SlipstreamConfig {
    pub torrent: TorrentConfig,
    pub buffer: BufferLimits,
    pub http: HttpConfig,
    pub remux: RemuxConfig,
}

/// Torrent session configuration.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// How long to wait for torrent metadata before giving up
    pub metadata_timeout: Duration,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            metadata_timeout: Duration::from_secs(60),
        }
    }
}

/// Memory and window limits for the piece buffer.
///
/// The scheduler keeps resident piece bytes under `max_buffer_bytes` at
/// steady state and hard-pauses the swarm past `hard_cap_bytes`.
#[derive(Debug, Clone)]
pub struct BufferLimits {
    /// Soft cap on resident piece bytes
    pub max_buffer_bytes: u64,
    /// Hard cap; breaching it pauses the swarm until usage recovers
    pub hard_cap_bytes: u64,
    /// Process heap ceiling that also triggers the hard pause
    pub heap_cap_bytes: u64,
    /// Fraction of `max_buffer_bytes` below which a hard pause is lifted
    pub resume_ratio: f64,
    /// Seconds of already-played content kept behind the read head
    pub behind_seconds: f64,
    /// Seconds of content ahead of the read head marked critical
    pub critical_window_seconds: f64,
    /// Critical window used when reacting to a seek
    pub seek_critical_seconds: f64,
    /// Playback-time jump treated as a seek
    pub seek_threshold_seconds: f64,
    /// Scheduler tick period
    pub tick_interval: Duration,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 70 * 1024 * 1024,
            hard_cap_bytes: 75 * 1024 * 1024,
            heap_cap_bytes: 500 * 1024 * 1024,
            resume_ratio: 0.8,
            behind_seconds: 10.0,
            critical_window_seconds: 10.0,
            seek_critical_seconds: 15.0,
            seek_threshold_seconds: 5.0,
            tick_interval: Duration::from_millis(500),
        }
    }
}

/// HTTP surface configuration.
///
/// Both listeners bind to loopback only; the port fields are floors,
/// the first free port at or above each floor is used.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Lowest port tried for the raw range server
    pub raw_port_floor: u16,
    /// Lowest port tried for the remux server
    pub remux_port_floor: u16,
    /// How many consecutive ports to try before giving up
    pub port_scan_span: u16,
    /// Chunk size for streaming response bodies
    pub chunk_size: usize,
    /// Delay before re-polling the store when pieces are not yet present
    pub piece_retry_delay: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            raw_port_floor: 9090,
            remux_port_floor: 9091,
            port_scan_span: 64,
            chunk_size: 256 * 1024,
            piece_retry_delay: Duration::from_millis(100),
        }
    }
}

/// Remux pipeline configuration.
#[derive(Debug, Clone)]
pub struct RemuxConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_path: String,
    /// Path to the ffprobe binary used by the duration probe
    pub ffprobe_path: String,
    /// Audio bitrate for the AAC transcode
    pub audio_bitrate: &'static str,
    /// Input probe size handed to ffmpeg; the source stream skips ahead
    /// in bursts as pieces arrive, so this is generous
    pub probesize: &'static str,
    /// Input analyze duration in microseconds
    pub analyzeduration: &'static str,
    /// Delays before each duration-probe attempt, from stream start
    pub probe_schedule: [Duration; 3],
}

impl Default for RemuxConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            audio_bitrate: "192k",
            probesize: "50M",
            analyzeduration: "20000000",
            probe_schedule: [
                Duration::from_millis(1500),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
        }
    }
}

impl SlipstreamConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("SLIPSTREAM_METADATA_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.torrent.metadata_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(cap) = std::env::var("SLIPSTREAM_MAX_BUFFER_MB") {
            if let Ok(mb) = cap.parse::<u64>() {
                config.buffer.max_buffer_bytes = mb * 1024 * 1024;
                config.buffer.hard_cap_bytes = (mb + 5) * 1024 * 1024;
            }
        }

        if let Ok(port) = std::env::var("SLIPSTREAM_RAW_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.http.raw_port_floor = port;
            }
        }

        if let Ok(port) = std::env::var("SLIPSTREAM_REMUX_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.http.remux_port_floor = port;
            }
        }

        if let Ok(path) = std::env::var("SLIPSTREAM_FFMPEG") {
            config.remux.ffmpeg_path = path;
        }

        if let Ok(path) = std::env::var("SLIPSTREAM_FFPROBE") {
            config.remux.ffprobe_path = path;
        }

        config
    }

    /// Creates a configuration with fast timers for deterministic tests.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.torrent.metadata_timeout = Duration::from_millis(200);
        config.buffer.tick_interval = Duration::from_millis(20);
        config.http.piece_retry_delay = Duration::from_millis(5);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = SlipstreamConfig::default();

        assert_eq!(config.torrent.metadata_timeout, Duration::from_secs(60));
        assert_eq!(config.buffer.max_buffer_bytes, 70 * 1024 * 1024);
        assert_eq!(config.buffer.hard_cap_bytes, 75 * 1024 * 1024);
        assert_eq!(config.buffer.tick_interval, Duration::from_millis(500));
        assert_eq!(config.http.raw_port_floor, 9090);
        assert_eq!(config.http.remux_port_floor, 9091);
        assert_eq!(config.remux.ffmpeg_path, "ffmpeg");
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("SLIPSTREAM_METADATA_TIMEOUT", "30");
            std::env::set_var("SLIPSTREAM_MAX_BUFFER_MB", "100");
            std::env::set_var("SLIPSTREAM_RAW_PORT", "19090");
        }

        let config = SlipstreamConfig::from_env();

        assert_eq!(config.torrent.metadata_timeout, Duration::from_secs(30));
        assert_eq!(config.buffer.max_buffer_bytes, 100 * 1024 * 1024);
        assert_eq!(config.buffer.hard_cap_bytes, 105 * 1024 * 1024);
        assert_eq!(config.http.raw_port_floor, 19090);

        // Cleanup
        unsafe {
            std::env::remove_var("SLIPSTREAM_METADATA_TIMEOUT");
            std::env::remove_var("SLIPSTREAM_MAX_BUFFER_MB");
            std::env::remove_var("SLIPSTREAM_RAW_PORT");
        }
    }

    #[test]
    fn test_testing_config_is_fast() {
        let config = SlipstreamConfig::for_testing();
        assert!(config.torrent.metadata_timeout < Duration::from_secs(1));
        assert!(config.buffer.tick_interval < Duration::from_millis(100));
    }
}
