//! Best-effort bytes-per-second estimation for the selected file.
//!
//! Starts from the file-size heuristic, then folds in two better
//! signals as they appear: deltas between successive range requests,
//! and the container's actual duration once the probe lands.

use std::time::{Duration, Instant};

use super::buffer::estimated_duration_seconds;

/// Only range requests this close together update the estimate;
/// anything older is a stall or a seek, not playback pacing.
const OBSERVATION_WINDOW: Duration = Duration::from_secs(5);

/// Exponential smoothing weight kept for the running estimate.
const SMOOTHING: f64 = 0.7;

/// Produces a bytes-per-second estimate for read-head positioning.
#[derive(Debug)]
pub struct BitrateEstimator {
    file_length: u64,
    bytes_per_second: f64,
    estimated_duration: f64,
    probed_duration: Option<f64>,
    last_request: Option<(Instant, u64)>,
}

impl BitrateEstimator {
    /// Seeds the estimate from file size alone.
    pub fn new(file_length: u64) -> Self {
        let estimated_duration = estimated_duration_seconds(file_length);
        Self {
            file_length,
            bytes_per_second: file_length as f64 / estimated_duration.max(1.0),
            estimated_duration,
            probed_duration: None,
            last_request: None,
        }
    }

    /// Current estimate in bytes per second.
    pub fn bytes_per_second(&self) -> f64 {
        self.bytes_per_second
    }

    /// Duration estimate currently in effect, probed if available.
    pub fn estimated_duration(&self) -> f64 {
        self.probed_duration.unwrap_or(self.estimated_duration)
    }

    /// Probed duration, once the container has answered.
    pub fn probed_duration(&self) -> Option<f64> {
        self.probed_duration
    }

    /// Folds in the start offset of a new range request.
    ///
    /// Consecutive requests within the observation window yield an
    /// instantaneous rate that is smoothed into the estimate.
    pub fn record_range_request(&mut self, start_byte: u64) {
        let now = Instant::now();
        if let Some((prev_at, prev_byte)) = self.last_request {
            let elapsed = now.duration_since(prev_at);
            let delta_bytes = start_byte.abs_diff(prev_byte);
            if elapsed < OBSERVATION_WINDOW && !elapsed.is_zero() && delta_bytes > 0 {
                let instantaneous = delta_bytes as f64 / elapsed.as_secs_f64();
                self.bytes_per_second =
                    SMOOTHING * self.bytes_per_second + (1.0 - SMOOTHING) * instantaneous;
            }
        }
        self.last_request = Some((now, start_byte));
    }

    /// Replaces the duration estimate with the container's real one.
    ///
    /// Resets the rate to `file_length / duration`; observed smoothing
    /// continues from there.
    pub fn set_probed_duration(&mut self, duration: f64) {
        if duration <= 0.0 {
            return;
        }
        self.probed_duration = Some(duration);
        self.bytes_per_second = self.file_length as f64 / duration;
    }
}
