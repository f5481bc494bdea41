//! Buffer sizing model derived from the selected file.
//!
//! File size stands in for quality: a 40 GB file is almost certainly a
//! 4K remux that eats memory fast, a 2 GB file is a 720p encode that can
//! afford a deep buffer. The tier picks how many seconds to hold ahead
//! of the read head; the global byte caps then bound everything.

use serde::Serialize;

use crate::config::BufferLimits;

const GIB: u64 = 1024 * 1024 * 1024;

/// Quality tier inferred from file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QualityTier {
    /// > 30 GB
    #[serde(rename = "4K")]
    FourK,
    /// > 15 GB
    #[serde(rename = "1080p_high")]
    FullHdHigh,
    /// > 5 GB
    #[serde(rename = "1080p")]
    FullHd,
    /// <= 5 GB
    #[serde(rename = "720p")]
    Hd,
}

impl QualityTier {
    /// Infers the tier from file size.
    pub fn for_file_size(bytes: u64) -> Self {
        if bytes > 30 * GIB {
            QualityTier::FourK
        } else if bytes > 15 * GIB {
            QualityTier::FullHdHigh
        } else if bytes > 5 * GIB {
            QualityTier::FullHd
        } else {
            QualityTier::Hd
        }
    }

    /// Minimum seconds of buffer before playback is considered healthy.
    pub fn min_ahead_seconds(self) -> f64 {
        match self {
            QualityTier::FourK => 15.0,
            QualityTier::FullHdHigh => 20.0,
            QualityTier::FullHd => 30.0,
            QualityTier::Hd => 45.0,
        }
    }

    /// Seconds of buffer at which the download is soft-paused.
    pub fn max_ahead_seconds(self) -> f64 {
        match self {
            QualityTier::FourK => 45.0,
            QualityTier::FullHdHigh => 60.0,
            QualityTier::FullHd => 90.0,
            QualityTier::Hd => 120.0,
        }
    }

    /// Seconds immediately ahead of the read head that must arrive first.
    pub fn critical_seconds(self) -> f64 {
        match self {
            QualityTier::FourK => 5.0,
            QualityTier::FullHdHigh => 8.0,
            QualityTier::FullHd => 10.0,
            QualityTier::Hd => 15.0,
        }
    }
}

/// Rough duration guess from file size, used until the container is probed.
pub fn estimated_duration_seconds(file_size: u64) -> f64 {
    if file_size > 30 * GIB {
        7200.0
    } else if file_size > 15 * GIB {
        5400.0
    } else if file_size > 5 * GIB {
        3600.0
    } else if file_size > GIB {
        2400.0
    } else {
        1200.0
    }
}

/// Per-file buffer budget, derived once at selection time.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Inferred quality tier
    pub quality_tier: QualityTier,
    /// Initial bytes-per-second estimate
    pub bytes_per_second: f64,
    /// Duration estimate backing `bytes_per_second`
    pub estimated_duration: f64,
    /// Byte budget ahead of the read head
    pub ahead_bytes: u64,
    /// Byte budget behind the read head
    pub behind_bytes: u64,
}

impl BufferConfig {
    /// Derives the budget for a file of the given length.
    pub fn for_file(file_length: u64, limits: &BufferLimits) -> Self {
        let quality_tier = QualityTier::for_file_size(file_length);
        let estimated_duration = estimated_duration_seconds(file_length);
        Self::with_duration(file_length, quality_tier, estimated_duration, limits)
    }

    /// Rebuilds the budget around a probed duration.
    pub fn reprobed(&self, file_length: u64, duration: f64, limits: &BufferLimits) -> Self {
        Self::with_duration(file_length, self.quality_tier, duration, limits)
    }

    fn with_duration(
        file_length: u64,
        quality_tier: QualityTier,
        estimated_duration: f64,
        limits: &BufferLimits,
    ) -> Self {
        let bytes_per_second = file_length as f64 / estimated_duration.max(1.0);

        let behind_bytes = ((limits.behind_seconds * bytes_per_second) as u64)
            .min(limits.max_buffer_bytes / 10);
        // Ahead and behind together must fit the soft cap
        let ahead_bytes = ((quality_tier.max_ahead_seconds() * bytes_per_second) as u64)
            .min(limits.max_buffer_bytes - behind_bytes);

        Self {
            quality_tier,
            bytes_per_second,
            estimated_duration,
            ahead_bytes,
            behind_bytes,
        }
    }

    /// Seconds of buffer that fills the ahead budget; reaching it soft-pauses.
    pub fn full_ahead_seconds(&self, bytes_per_second: f64) -> f64 {
        self.ahead_bytes as f64 / bytes_per_second.max(1.0)
    }
}

/// Scheduler state snapshot, republished atomically every tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferInfo {
    /// Contiguous seconds buffered ahead of the read head
    pub buffered_ahead_seconds: f64,
    /// Resident piece bytes, in MiB
    pub buffer_size_mb: f64,
    /// First piece of the current window
    pub window_start: u32,
    /// Last piece of the current window
    pub window_end: u32,
    /// Piece under the read head
    pub current_piece: u32,
    /// First piece of the contiguous buffered run around the read head
    pub buffered_start: u32,
    /// Last piece of the contiguous buffered run
    pub buffered_end: u32,
    /// Quality tier of the selected file
    pub quality_tier: Option<QualityTier>,
    /// Whether the swarm is paused because the buffer is full
    pub soft_paused: bool,
    /// Whether the swarm is paused because memory ran over the cap
    pub hard_paused: bool,
}
