//! Sliding-window piece scheduler.
//!
//! A periodic control loop that keeps the swarm working on exactly the
//! pieces playback needs next: it re-derives the window around the read
//! head every tick, elevates the leading edge to critical priority,
//! evicts everything outside the window, and pauses the swarm when the
//! buffer is full or memory runs past its cap.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::buffer::{BufferConfig, BufferInfo};
use super::playback::PlaybackState;
use crate::config::BufferLimits;
use crate::storage::PieceStore;
use crate::torrent::{TorrentClient, TorrentError, TorrentFileEntry, TorrentMetadata};

/// Tick failures are logged at most this often.
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Periodic scheduler driving piece priorities for one selected file.
pub struct StreamScheduler {
    client: Arc<dyn TorrentClient>,
    store: Arc<PieceStore>,
    playback: Arc<PlaybackState>,
    metadata: TorrentMetadata,
    file_index: usize,
    file: TorrentFileEntry,
    file_piece_start: u32,
    file_piece_end: u32,
    config: Mutex<BufferConfig>,
    limits: BufferLimits,
    last_error_log: Mutex<Option<Instant>>,
}

impl StreamScheduler {
    /// Builds a scheduler for the selected file.
    pub fn new(
        client: Arc<dyn TorrentClient>,
        store: Arc<PieceStore>,
        playback: Arc<PlaybackState>,
        metadata: TorrentMetadata,
        file_index: usize,
        limits: BufferLimits,
    ) -> Self {
        let file = metadata.files[file_index].clone();
        let (file_piece_start, file_piece_end) = metadata.piece_range_of(&file);
        let config = BufferConfig::for_file(file.length, &limits);
        Self {
            client,
            store,
            playback,
            metadata,
            file_index,
            file,
            file_piece_start,
            file_piece_end,
            config: Mutex::new(config),
            limits,
            last_error_log: Mutex::new(None),
        }
    }

    /// Current buffer budget.
    pub fn buffer_config(&self) -> BufferConfig {
        self.lock_config().clone()
    }

    /// Runs the tick loop until the returned task is aborted.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.limits.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = self.tick_once().await {
                    self.log_throttled(&error);
                }
            }
        })
    }

    /// Executes one scheduler tick.
    ///
    /// Tick order is fixed: read head, window, reselect, critical range,
    /// eviction, memory pressure, pause hysteresis, publish.
    ///
    /// # Errors
    ///
    /// Propagates client command failures; the tick loop swallows and
    /// rate-limits them, the interval continues regardless.
    pub async fn tick_once(&self) -> Result<(), TorrentError> {
        let info_hash = self.metadata.info_hash;
        let piece_len = self.metadata.piece_length as u64;
        let was_hard_paused = self.playback.hard_paused();

        let bps = self.playback.bytes_per_second().max(1.0);
        let read_head = self
            .playback
            .read_head_byte()
            .min(self.file.length.saturating_sub(1));
        let current_piece = (((self.file.offset + read_head) / piece_len) as u32)
            .clamp(self.file_piece_start, self.file_piece_end);

        let (window_start, window_end) = self.window_around(current_piece, bps, piece_len);

        // The underlying engine must never re-include other files, so
        // selection is reasserted every tick rather than once.
        for index in 0..self.metadata.files.len() {
            if index != self.file_index {
                let _ = self.client.deselect_file(info_hash, index).await;
            }
        }
        self.client.select_file(info_hash, self.file_index).await?;

        let critical_span =
            (((self.limits.critical_window_seconds * bps) as u64).div_ceil(piece_len)) as u32;
        let critical_end = current_piece.saturating_add(critical_span).min(window_end);
        self.client
            .mark_critical(info_hash, current_piece, critical_end)
            .await?;

        // Unconditional eviction of everything outside the window, done
        // every tick rather than only under memory pressure.
        self.evict_outside(window_start, window_end);

        let mut resident = self.store.resident_bytes();
        let heap = process_heap_bytes();
        if resident > self.limits.hard_cap_bytes
            || heap.is_some_and(|h| h > self.limits.heap_cap_bytes)
        {
            self.playback.set_hard_paused(true);
            let _ = self.client.pause(info_hash).await;
            // Pieces may have landed between the sweep and the
            // measurement; sweep again before re-measuring
            self.evict_outside(window_start, window_end);
            resident = self.store.resident_bytes();
            debug!(
                resident,
                heap = heap.unwrap_or(0),
                "memory cap breached, swarm hard-paused"
            );
        }

        let (buffered_start, buffered_end) = self.contiguous_run(current_piece);
        let ahead_seconds = self.ahead_seconds(current_piece, buffered_end, read_head, bps);

        self.apply_pause_hysteresis(ahead_seconds, resident, was_hard_paused)
            .await;

        let quality_tier = self.lock_config().quality_tier;
        self.playback.publish_buffer_info(BufferInfo {
            buffered_ahead_seconds: ahead_seconds,
            buffer_size_mb: resident as f64 / (1024.0 * 1024.0),
            window_start,
            window_end,
            current_piece,
            buffered_start,
            buffered_end,
            quality_tier: Some(quality_tier),
            soft_paused: self.playback.soft_paused(),
            hard_paused: self.playback.hard_paused(),
        });

        Ok(())
    }

    /// Reacts to a large playback-time jump.
    ///
    /// Clears both pause flags, resumes the swarm, moves the read head
    /// to the new position, and marks the seconds after it critical so
    /// the next tick completes the window transition.
    pub async fn handle_seek(&self, seconds: f64) {
        let info_hash = self.metadata.info_hash;
        self.playback.clear_pause_flags();
        let _ = self.client.resume(info_hash).await;

        let bps = self.playback.bytes_per_second().max(1.0);
        let byte = ((seconds * bps) as u64).min(self.file.length.saturating_sub(1));
        self.playback.set_read_head_byte(byte);

        let piece_len = self.metadata.piece_length as u64;
        let current_piece = (((self.file.offset + byte) / piece_len) as u32)
            .clamp(self.file_piece_start, self.file_piece_end);
        let span =
            (((self.limits.seek_critical_seconds * bps) as u64).div_ceil(piece_len)) as u32;
        let end = current_piece
            .saturating_add(span)
            .min(self.metadata.piece_count.saturating_sub(1));
        let _ = self.client.mark_critical(info_hash, current_piece, end).await;

        debug!(seconds, current_piece, "seek handled, critical range moved");
    }

    /// Installs a container-probed duration and rebuilds the budget.
    pub fn apply_probed_duration(&self, duration: f64) {
        self.playback.set_probed_duration(duration);
        let mut config = self.lock_config();
        *config = config.reprobed(self.file.length, duration, &self.limits);
        debug!(duration, "buffer budget rebuilt from probed duration");
    }

    fn window_around(&self, current_piece: u32, bps: f64, piece_len: u64) -> (u32, u32) {
        let config = self.lock_config();
        let behind_bytes =
            ((self.limits.behind_seconds * bps) as u64).min(self.limits.max_buffer_bytes / 10);
        let ahead_bytes = ((self.limits.max_buffer_bytes as f64 * 0.9) as u64)
            .min(config.ahead_bytes);

        let pieces_behind = behind_bytes.div_ceil(piece_len) as u32;
        let pieces_ahead = ahead_bytes.div_ceil(piece_len) as u32;

        let window_start = current_piece
            .saturating_sub(pieces_behind)
            .max(self.file_piece_start);
        let window_end = current_piece
            .saturating_add(pieces_ahead)
            .min(self.file_piece_end);
        (window_start, window_end)
    }

    fn evict_outside(&self, window_start: u32, window_end: u32) {
        for index in self.store.resident_pieces() {
            let in_file = index >= self.file_piece_start && index <= self.file_piece_end;
            if in_file && (index < window_start || index > window_end) {
                self.store.evict(index);
            }
        }
    }

    /// Contiguous buffered run around the read head, from the bitfield.
    fn contiguous_run(&self, current_piece: u32) -> (u32, u32) {
        if !self.store.has_piece(current_piece) {
            return (current_piece, current_piece);
        }
        let mut start = current_piece;
        while start > self.file_piece_start && self.store.has_piece(start - 1) {
            start -= 1;
        }
        let mut end = current_piece;
        while end < self.file_piece_end && self.store.has_piece(end + 1) {
            end += 1;
        }
        (start, end)
    }

    fn ahead_seconds(&self, current_piece: u32, buffered_end: u32, read_head: u64, bps: f64) -> f64 {
        if !self.store.has_piece(current_piece) {
            return 0.0;
        }
        let piece_len = self.metadata.piece_length as u64;
        let run_pieces = (buffered_end - current_piece + 1) as u64;
        let into_piece = (self.file.offset + read_head) % piece_len;
        let ahead_bytes = (run_pieces * piece_len).saturating_sub(into_piece);
        ahead_bytes as f64 / bps
    }

    async fn apply_pause_hysteresis(
        &self,
        ahead_seconds: f64,
        resident: u64,
        was_hard_paused: bool,
    ) {
        let info_hash = self.metadata.info_hash;
        let t_full = {
            let config = self.lock_config();
            let bps = self.playback.bytes_per_second();
            config.full_ahead_seconds(bps)
        };
        let t_resume = 0.5 * t_full;
        let remux_consuming = self.playback.remux_active();

        let hard = self.playback.hard_paused();
        let soft = self.playback.soft_paused();

        if !hard && !soft && ahead_seconds >= t_full && !remux_consuming {
            self.playback.set_soft_paused(true);
            let _ = self.client.pause(info_hash).await;
            debug!(ahead_seconds, t_full, "buffer full, swarm soft-paused");
        } else if soft && !hard && (ahead_seconds < t_resume || remux_consuming) {
            self.playback.set_soft_paused(false);
            let _ = self.client.resume(info_hash).await;
            debug!(ahead_seconds, t_resume, "buffer drained, swarm resumed");
        }

        // Hard pauses lift one tick later at the earliest, once eviction
        // has brought residency back under the recovery line
        let recovery =
            (self.limits.resume_ratio * self.limits.max_buffer_bytes as f64) as u64;
        if was_hard_paused && self.playback.hard_paused() && resident < recovery {
            self.playback.set_hard_paused(false);
            if !self.playback.soft_paused() {
                let _ = self.client.resume(info_hash).await;
            }
            debug!(resident, recovery, "memory recovered, hard pause lifted");
        }
    }

    fn log_throttled(&self, error: &TorrentError) {
        let mut last = self
            .last_error_log
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let due = last.is_none_or(|at| at.elapsed() >= ERROR_LOG_INTERVAL);
        if due {
            warn!(%error, "scheduler tick failed");
            *last = Some(Instant::now());
        }
    }

    fn lock_config(&self) -> std::sync::MutexGuard<'_, BufferConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resident set size of this process, if the platform exposes it.
fn process_heap_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::torrent::client::StoreFactory;
    use crate::torrent::sim::{SimClientConfig, SimTorrentClient};
    use crate::torrent::{TorrentClient, TorrentInput};

    const MAGNET: &str =
        "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=movie.mp4";

    fn store_factory() -> StoreFactory {
        Arc::new(|metadata: &crate::torrent::TorrentMetadata| {
            Arc::new(PieceStore::new(
                metadata.piece_length,
                metadata.piece_count,
                metadata.total_size,
            ))
        })
    }

    fn tight_limits() -> BufferLimits {
        BufferLimits {
            max_buffer_bytes: 2 * 1024 * 1024,
            hard_cap_bytes: 16 * 1024 * 1024,
            tick_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn hard_cap_limits() -> BufferLimits {
        BufferLimits {
            hard_cap_bytes: 1280 * 1024,
            ..tight_limits()
        }
    }

    async fn scheduler_fixture(
        swarm_speed: u64,
        limits: BufferLimits,
    ) -> (Arc<SimTorrentClient>, Arc<StreamScheduler>, Arc<PieceStore>) {
        let client = Arc::new(SimTorrentClient::new(SimClientConfig {
            swarm_speed,
            delivery_interval: Duration::from_millis(5),
            file_size: 16 * 1024 * 1024,
            piece_length: 64 * 1024,
            ..Default::default()
        }));
        let input = TorrentInput::parse(MAGNET).unwrap();
        let session = client.add(&input, store_factory()).await.unwrap();
        let playback = Arc::new(PlaybackState::new(session.metadata.files[0].length));
        let scheduler = Arc::new(StreamScheduler::new(
            client.clone(),
            session.store.clone(),
            playback,
            session.metadata.clone(),
            0,
            limits,
        ));
        (client, scheduler, session.store)
    }

    #[tokio::test]
    async fn test_tick_selects_file_and_marks_critical() {
        let (client, scheduler, _) = scheduler_fixture(0, tight_limits()).await;
        scheduler.tick_once().await.unwrap();

        assert_eq!(client.selected_files(), vec![true]);
        let (start, _end) = client.critical_range().unwrap();
        assert_eq!(start, 0);
    }

    #[tokio::test]
    async fn test_tick_evicts_outside_window() {
        let (_, scheduler, store) = scheduler_fixture(0, tight_limits()).await;

        // Pieces far past any window with the read head at zero
        for index in [200u32, 220, 250] {
            store
                .insert(index, Bytes::from(vec![0u8; 64 * 1024]))
                .unwrap();
        }
        scheduler.tick_once().await.unwrap();

        for index in [200u32, 220, 250] {
            assert!(!store.has_piece(index), "piece {index} survived the sweep");
        }
        let info = scheduler.playback.buffer_info();
        assert!(info.window_end < 200);
    }

    #[tokio::test]
    async fn test_window_moves_with_read_head() {
        let (_, scheduler, _) = scheduler_fixture(0, tight_limits()).await;

        scheduler.tick_once().await.unwrap();
        let at_zero = scheduler.playback.buffer_info();
        assert_eq!(at_zero.current_piece, 0);

        // Move the read head 8 MiB in, piece 128
        scheduler.playback.record_range_request(8 * 1024 * 1024);
        scheduler.tick_once().await.unwrap();
        let moved = scheduler.playback.buffer_info();
        assert_eq!(moved.current_piece, 128);
        assert!(moved.window_start <= 128 && moved.window_end >= 128);
        assert!(moved.window_start > at_zero.window_start);
    }

    #[tokio::test]
    async fn test_hard_cap_pauses_and_recovers() {
        let limits = hard_cap_limits();
        let (client, scheduler, store) = scheduler_fixture(0, limits.clone()).await;

        scheduler.tick_once().await.unwrap();
        let info = scheduler.playback.buffer_info();

        // Fill the window itself past the hard cap: window pieces are
        // not evictable, so the sweep cannot save us and the pause must
        for index in info.window_start..=info.window_end {
            store
                .insert(index, Bytes::from(vec![0u8; 64 * 1024]))
                .unwrap();
        }
        assert!(store.resident_bytes() > limits.hard_cap_bytes);

        scheduler.tick_once().await.unwrap();
        assert!(scheduler.playback.hard_paused());
        assert!(client.is_paused());

        // Drain below the recovery line and confirm the lift next tick
        for index in store.resident_pieces() {
            store.evict(index);
        }
        scheduler.tick_once().await.unwrap();
        assert!(!scheduler.playback.hard_paused());
        assert!(!client.is_paused());
    }

    #[tokio::test]
    async fn test_soft_pause_hysteresis() {
        let limits = tight_limits();
        let (client, scheduler, store) = scheduler_fixture(0, limits).await;

        scheduler.tick_once().await.unwrap();
        let info = scheduler.playback.buffer_info();

        // Fill the whole window so the observed ahead buffer is full
        for index in info.window_start..=info.window_end {
            store
                .insert(index, Bytes::from(vec![0u8; 64 * 1024]))
                .unwrap();
        }
        scheduler.tick_once().await.unwrap();
        assert!(scheduler.playback.soft_paused());
        assert!(client.is_paused());

        // A full buffer one tick later must not flap
        scheduler.tick_once().await.unwrap();
        assert!(scheduler.playback.soft_paused());

        // Drain to nothing: ahead drops below the resume line
        for index in store.resident_pieces() {
            store.evict(index);
        }
        scheduler.tick_once().await.unwrap();
        assert!(!scheduler.playback.soft_paused());
        assert!(!client.is_paused());
    }

    #[tokio::test]
    async fn test_soft_pause_skipped_while_remux_consumes() {
        let limits = tight_limits();
        let (_, scheduler, store) = scheduler_fixture(0, limits).await;

        scheduler.tick_once().await.unwrap();
        let info = scheduler.playback.buffer_info();
        for index in info.window_start..=info.window_end {
            store
                .insert(index, Bytes::from(vec![0u8; 64 * 1024]))
                .unwrap();
        }

        let guard = scheduler.playback.begin_remux();
        scheduler.tick_once().await.unwrap();
        assert!(!scheduler.playback.soft_paused());
        drop(guard);
    }

    #[tokio::test]
    async fn test_seek_moves_critical_range_and_clears_pauses() {
        let (client, scheduler, _) = scheduler_fixture(0, tight_limits()).await;
        scheduler.tick_once().await.unwrap();

        scheduler.playback.set_soft_paused(true);
        let bps = scheduler.playback.bytes_per_second();
        scheduler.handle_seek(60.0).await;

        assert!(!scheduler.playback.soft_paused());
        assert!(!scheduler.playback.hard_paused());
        assert!(!client.is_paused());

        let expected_piece = ((60.0 * bps) as u64 / (64 * 1024)) as u32;
        let (start, end) = client.critical_range().unwrap();
        assert_eq!(start, expected_piece);
        assert!(end > start);

        // The next tick recenters the window on the new position
        scheduler.tick_once().await.unwrap();
        let info = scheduler.playback.buffer_info();
        assert_eq!(info.current_piece, expected_piece);
    }

    #[tokio::test]
    async fn test_probed_duration_rebuilds_budget() {
        let (_, scheduler, _) = scheduler_fixture(0, tight_limits()).await;
        let before = scheduler.buffer_config();

        scheduler.apply_probed_duration(60.0);
        let after = scheduler.buffer_config();
        assert_ne!(before.bytes_per_second, after.bytes_per_second);
        assert_eq!(
            scheduler.playback.probed_duration(),
            Some(60.0)
        );
    }
}
