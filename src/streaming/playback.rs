//! Shared read-head and pause state.
//!
//! Written by the HTTP handlers (range starts), the control surface
//! (player time reports), and the scheduler (pause flags, buffer info);
//! read by all of them. Every mutation is a short lock or an atomic,
//! never held across an await point.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::bitrate::BitrateEstimator;
use super::buffer::BufferInfo;

/// Shared per-session playback state.
pub struct PlaybackState {
    /// Latest HTTP range-request start; authoritative when non-zero
    byte_offset: AtomicU64,
    /// Latest player-reported time, in milliseconds for atomic storage
    time_millis: AtomicU64,
    estimator: Mutex<BitrateEstimator>,
    buffer_info: Mutex<BufferInfo>,
    soft_paused: AtomicBool,
    hard_paused: AtomicBool,
    remux_consumers: AtomicUsize,
}

impl PlaybackState {
    /// Fresh state for a newly selected file.
    pub fn new(file_length: u64) -> Self {
        Self {
            byte_offset: AtomicU64::new(0),
            time_millis: AtomicU64::new(0),
            estimator: Mutex::new(BitrateEstimator::new(file_length)),
            buffer_info: Mutex::new(BufferInfo::default()),
            soft_paused: AtomicBool::new(false),
            hard_paused: AtomicBool::new(false),
            remux_consumers: AtomicUsize::new(0),
        }
    }

    /// Records a range-request start: moves the read head and feeds the
    /// bitrate estimator.
    pub fn record_range_request(&self, start_byte: u64) {
        self.byte_offset.store(start_byte, Ordering::SeqCst);
        self.lock_estimator().record_range_request(start_byte);
    }

    /// Records a player time report; returns the previous value.
    pub fn update_time(&self, seconds: f64) -> f64 {
        let millis = (seconds.max(0.0) * 1000.0) as u64;
        let previous = self.time_millis.swap(millis, Ordering::SeqCst);
        previous as f64 / 1000.0
    }

    /// Player-reported playback time in seconds.
    pub fn time_seconds(&self) -> f64 {
        self.time_millis.load(Ordering::SeqCst) as f64 / 1000.0
    }

    /// Current read-head byte position.
    ///
    /// The range-request byte offset wins when non-zero; otherwise the
    /// player time is converted through the bitrate estimate.
    pub fn read_head_byte(&self) -> u64 {
        let byte_offset = self.byte_offset.load(Ordering::SeqCst);
        if byte_offset > 0 {
            return byte_offset;
        }
        (self.time_seconds() * self.bytes_per_second()) as u64
    }

    /// Moves the byte read head directly, used on seeks.
    pub fn set_read_head_byte(&self, byte: u64) {
        self.byte_offset.store(byte, Ordering::SeqCst);
    }

    /// Current bytes-per-second estimate.
    pub fn bytes_per_second(&self) -> f64 {
        self.lock_estimator().bytes_per_second()
    }

    /// Duration estimate currently in effect.
    pub fn estimated_duration(&self) -> f64 {
        self.lock_estimator().estimated_duration()
    }

    /// Container-probed duration, if the probe has landed.
    pub fn probed_duration(&self) -> Option<f64> {
        self.lock_estimator().probed_duration()
    }

    /// Installs a probed duration into the estimator.
    pub fn set_probed_duration(&self, duration: f64) {
        self.lock_estimator().set_probed_duration(duration);
    }

    /// Publishes a fresh buffer snapshot; readers see it atomically.
    pub fn publish_buffer_info(&self, info: BufferInfo) {
        *self.lock_buffer_info() = info;
    }

    /// Latest published buffer snapshot.
    pub fn buffer_info(&self) -> BufferInfo {
        self.lock_buffer_info().clone()
    }

    /// Whether the scheduler has soft-paused the swarm.
    pub fn soft_paused(&self) -> bool {
        self.soft_paused.load(Ordering::SeqCst)
    }

    /// Sets the soft-pause flag.
    pub fn set_soft_paused(&self, paused: bool) {
        self.soft_paused.store(paused, Ordering::SeqCst);
    }

    /// Whether the scheduler has hard-paused the swarm over memory.
    pub fn hard_paused(&self) -> bool {
        self.hard_paused.load(Ordering::SeqCst)
    }

    /// Sets the hard-pause flag.
    pub fn set_hard_paused(&self, paused: bool) {
        self.hard_paused.store(paused, Ordering::SeqCst);
    }

    /// Clears both pause flags, used on seeks.
    pub fn clear_pause_flags(&self) {
        self.soft_paused.store(false, Ordering::SeqCst);
        self.hard_paused.store(false, Ordering::SeqCst);
    }

    /// Registers a remux consumer; the guard deregisters on drop.
    pub fn begin_remux(self: &Arc<Self>) -> RemuxConsumerGuard {
        self.remux_consumers.fetch_add(1, Ordering::SeqCst);
        RemuxConsumerGuard {
            playback: Arc::clone(self),
        }
    }

    /// Whether a remux child is currently consuming the stream.
    pub fn remux_active(&self) -> bool {
        self.remux_consumers.load(Ordering::SeqCst) > 0
    }

    fn lock_estimator(&self) -> std::sync::MutexGuard<'_, BitrateEstimator> {
        self.estimator.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_buffer_info(&self) -> std::sync::MutexGuard<'_, BufferInfo> {
        self.buffer_info.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keeps the remux-active flag raised while a consumer is attached.
pub struct RemuxConsumerGuard {
    playback: Arc<PlaybackState>,
}

impl Drop for RemuxConsumerGuard {
    fn drop(&mut self) {
        self.playback
            .remux_consumers
            .fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_offset_wins_over_time() {
        let playback = PlaybackState::new(600 * 1024 * 1024);
        playback.update_time(100.0);
        let from_time = playback.read_head_byte();
        assert!(from_time > 0);

        playback.record_range_request(12345);
        assert_eq!(playback.read_head_byte(), 12345);
    }

    #[test]
    fn test_update_time_returns_previous() {
        let playback = PlaybackState::new(1024);
        assert_eq!(playback.update_time(10.0), 0.0);
        assert_eq!(playback.update_time(42.5), 10.0);
        assert_eq!(playback.time_seconds(), 42.5);
    }

    #[test]
    fn test_pause_flags() {
        let playback = PlaybackState::new(1024);
        playback.set_soft_paused(true);
        playback.set_hard_paused(true);
        assert!(playback.soft_paused());
        assert!(playback.hard_paused());
        playback.clear_pause_flags();
        assert!(!playback.soft_paused());
        assert!(!playback.hard_paused());
    }

    #[test]
    fn test_remux_consumer_guard() {
        let playback = Arc::new(PlaybackState::new(1024));
        assert!(!playback.remux_active());
        let guard = playback.begin_remux();
        assert!(playback.remux_active());
        let second = playback.begin_remux();
        drop(guard);
        assert!(playback.remux_active());
        drop(second);
        assert!(!playback.remux_active());
    }

    #[test]
    fn test_buffer_info_replacement() {
        let playback = PlaybackState::new(1024);
        let mut info = BufferInfo::default();
        info.current_piece = 7;
        info.soft_paused = true;
        playback.publish_buffer_info(info);
        let seen = playback.buffer_info();
        assert_eq!(seen.current_piece, 7);
        assert!(seen.soft_paused);
    }
}
