//! Deterministic in-process torrent client.
//!
//! Synthesizes a swarm that delivers pieces at a configurable rate,
//! honoring the pause, selection, and priority commands of the
//! [`TorrentClient`] contract. Piece payloads are a deterministic
//! function of their byte offset, so tests can assert exact body
//! contents for any range.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::debug;

use super::client::{StoreFactory, TorrentClient, TorrentSession};
use super::types::{SwarmStats, TorrentFileEntry, TorrentMetadata};
use super::{InfoHash, TorrentError, TorrentInput};
use crate::storage::{PieceStore, StorageError};

/// Configuration for the simulated swarm.
#[derive(Debug, Clone)]
pub struct SimClientConfig {
    /// Delivery rate in bytes per second
    pub swarm_speed: u64,
    /// Granularity of piece delivery
    pub delivery_interval: Duration,
    /// Artificial metadata resolution latency
    pub metadata_delay: Duration,
    /// Reported peer count
    pub num_peers: u32,
    /// Metadata to use instead of synthesizing one from the input
    pub metadata: Option<TorrentMetadata>,
    /// Content size of a synthesized single-file torrent
    pub file_size: u64,
    /// Piece length of a synthesized torrent
    pub piece_length: u32,
}

impl Default for SimClientConfig {
    fn default() -> Self {
        Self {
            swarm_speed: 8 * 1024 * 1024,
            delivery_interval: Duration::from_millis(25),
            metadata_delay: Duration::ZERO,
            num_peers: 12,
            metadata: None,
            file_size: 256 * 1024 * 1024,
            piece_length: 256 * 1024,
        }
    }
}

/// Deterministic torrent client satisfying the capability contract.
pub struct SimTorrentClient {
    config: SimClientConfig,
    active: Mutex<Option<SimSession>>,
}

struct SimSession {
    metadata: TorrentMetadata,
    store: Arc<PieceStore>,
    shared: Arc<SimShared>,
    task: tokio::task::JoinHandle<()>,
}

struct SimShared {
    paused: AtomicBool,
    downloaded: AtomicU64,
    selected: Mutex<Vec<bool>>,
    critical: Mutex<Option<(u32, u32)>>,
}

/// Deterministic content byte at a global torrent offset.
///
/// Tests use this to verify that range responses carry the right bytes.
pub fn expected_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

impl SimTorrentClient {
    /// Creates a client with the given swarm behavior.
    pub fn new(config: SimClientConfig) -> Self {
        Self {
            config,
            active: Mutex::new(None),
        }
    }

    /// Creates a client with default swarm behavior.
    pub fn new_default() -> Self {
        Self::new(SimClientConfig::default())
    }

    /// Whether the simulated swarm is currently paused.
    pub fn is_paused(&self) -> bool {
        self.lock_active()
            .as_ref()
            .map(|s| s.shared.paused.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// The most recent critical range, if any.
    pub fn critical_range(&self) -> Option<(u32, u32)> {
        self.lock_active()
            .as_ref()
            .and_then(|s| *s.shared.critical.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Per-file selection flags, in torrent file order.
    pub fn selected_files(&self) -> Vec<bool> {
        self.lock_active()
            .as_ref()
            .map(|s| {
                s.shared
                    .selected
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
            })
            .unwrap_or_default()
    }

    /// Whether a torrent is currently admitted.
    pub fn has_active(&self) -> bool {
        self.lock_active().is_some()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<SimSession>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session_shared(
        &self,
        info_hash: InfoHash,
    ) -> Result<(Arc<SimShared>, TorrentMetadata, Arc<PieceStore>), TorrentError> {
        let guard = self.lock_active();
        match guard.as_ref() {
            Some(s) if s.metadata.info_hash == info_hash => {
                Ok((s.shared.clone(), s.metadata.clone(), s.store.clone()))
            }
            _ => Err(TorrentError::TorrentNotFound { info_hash }),
        }
    }

    fn synthesize_metadata(&self, input: &TorrentInput) -> TorrentMetadata {
        let info_hash = input.info_hash_hint().unwrap_or_else(|| {
            let mut hasher = Sha1::new();
            match input {
                TorrentInput::Magnet(uri) => hasher.update(uri.as_bytes()),
                TorrentInput::MetainfoFile(path) => {
                    hasher.update(path.to_string_lossy().as_bytes())
                }
                TorrentInput::MetainfoBlob(blob) => hasher.update(blob),
            }
            let digest = hasher.finalize();
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&digest);
            InfoHash::new(hash)
        });

        let name = input
            .display_name_hint()
            .unwrap_or_else(|| format!("sim-{info_hash}"));
        let file_name = if std::path::Path::new(&name).extension().is_some() {
            name.clone()
        } else {
            format!("{name}.mp4")
        };

        let piece_count = self.config.file_size.div_ceil(self.config.piece_length as u64) as u32;
        TorrentMetadata {
            info_hash,
            name,
            piece_length: self.config.piece_length,
            piece_count,
            total_size: self.config.file_size,
            files: vec![TorrentFileEntry {
                name: file_name,
                offset: 0,
                length: self.config.file_size,
            }],
        }
    }
}

#[async_trait]
impl TorrentClient for SimTorrentClient {
    async fn add(
        &self,
        input: &TorrentInput,
        make_store: StoreFactory,
    ) -> Result<TorrentSession, TorrentError> {
        if !self.config.metadata_delay.is_zero() {
            tokio::time::sleep(self.config.metadata_delay).await;
        }

        let metadata = self
            .config
            .metadata
            .clone()
            .unwrap_or_else(|| self.synthesize_metadata(input));
        let store = make_store(&metadata);

        let shared = Arc::new(SimShared {
            paused: AtomicBool::new(false),
            downloaded: AtomicU64::new(0),
            selected: Mutex::new(vec![false; metadata.files.len()]),
            critical: Mutex::new(None),
        });

        let task = tokio::spawn(deliver_pieces(
            metadata.clone(),
            store.clone(),
            shared.clone(),
            self.config.swarm_speed,
            self.config.delivery_interval,
        ));

        let mut guard = self.lock_active();
        if let Some(prior) = guard.take() {
            prior.task.abort();
            debug!("replaced prior simulated session {}", prior.metadata.info_hash);
        }
        *guard = Some(SimSession {
            metadata: metadata.clone(),
            store: store.clone(),
            shared,
            task,
        });

        Ok(TorrentSession { metadata, store })
    }

    async fn remove(&self, info_hash: InfoHash, destroy_store: bool) -> Result<(), TorrentError> {
        let mut guard = self.lock_active();
        match guard.take() {
            Some(session) if session.metadata.info_hash == info_hash => {
                session.task.abort();
                if destroy_store {
                    session.store.destroy();
                }
                Ok(())
            }
            other => {
                *guard = other;
                Err(TorrentError::TorrentNotFound { info_hash })
            }
        }
    }

    async fn select_file(
        &self,
        info_hash: InfoHash,
        file_index: usize,
    ) -> Result<(), TorrentError> {
        let (shared, metadata, _) = self.session_shared(info_hash)?;
        let mut selected = shared.selected.lock().unwrap_or_else(|e| e.into_inner());
        let slot = selected
            .get_mut(file_index)
            .ok_or(TorrentError::FileOutOfRange {
                index: file_index,
                count: metadata.files.len(),
            })?;
        *slot = true;
        Ok(())
    }

    async fn deselect_file(
        &self,
        info_hash: InfoHash,
        file_index: usize,
    ) -> Result<(), TorrentError> {
        let (shared, metadata, _) = self.session_shared(info_hash)?;
        let mut selected = shared.selected.lock().unwrap_or_else(|e| e.into_inner());
        let slot = selected
            .get_mut(file_index)
            .ok_or(TorrentError::FileOutOfRange {
                index: file_index,
                count: metadata.files.len(),
            })?;
        *slot = false;
        Ok(())
    }

    async fn mark_critical(
        &self,
        info_hash: InfoHash,
        start_piece: u32,
        end_piece: u32,
    ) -> Result<(), TorrentError> {
        let (shared, metadata, _) = self.session_shared(info_hash)?;
        let last = metadata.piece_count.saturating_sub(1);
        let range = (start_piece.min(last), end_piece.min(last));
        *shared.critical.lock().unwrap_or_else(|e| e.into_inner()) = Some(range);
        Ok(())
    }

    async fn pause(&self, info_hash: InfoHash) -> Result<(), TorrentError> {
        let (shared, _, _) = self.session_shared(info_hash)?;
        shared.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, info_hash: InfoHash) -> Result<(), TorrentError> {
        let (shared, _, _) = self.session_shared(info_hash)?;
        shared.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn has_piece(&self, info_hash: InfoHash, piece_index: u32) -> bool {
        match self.session_shared(info_hash) {
            Ok((_, _, store)) => store.has_piece(piece_index),
            Err(_) => false,
        }
    }

    async fn read_at(
        &self,
        info_hash: InfoHash,
        offset: u64,
        length: usize,
    ) -> Result<Bytes, TorrentError> {
        let (_, _, store) = self.session_shared(info_hash)?;
        if length == 0 {
            return Ok(Bytes::new());
        }
        match store.read_range(offset, offset + length as u64 - 1) {
            Ok(bytes) => Ok(bytes),
            Err(StorageError::PieceNotPresent { .. }) => Err(TorrentError::NotYetAvailable),
            Err(other) => Err(TorrentError::Storage(other)),
        }
    }

    async fn stats(&self, info_hash: InfoHash) -> SwarmStats {
        match self.session_shared(info_hash) {
            Ok((shared, _, _)) => {
                let paused = shared.paused.load(Ordering::SeqCst);
                SwarmStats {
                    download_speed: if paused { 0 } else { self.config.swarm_speed },
                    upload_speed: 0,
                    num_peers: self.config.num_peers,
                    downloaded: shared.downloaded.load(Ordering::SeqCst),
                    ratio: 0.0,
                }
            }
            Err(_) => SwarmStats::default(),
        }
    }
}

/// Delivery loop feeding synthesized pieces into the store.
///
/// Picks the first absent piece starting at the critical range, falling
/// back to the start of the selected files. Evicted pieces regrow their
/// have-bit only when the playhead returns to them, which mirrors how a
/// sequential picker behaves after a seek.
async fn deliver_pieces(
    metadata: TorrentMetadata,
    store: Arc<PieceStore>,
    shared: Arc<SimShared>,
    swarm_speed: u64,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let budget_per_tick = ((swarm_speed as f64) * interval.as_secs_f64()) as u64;

    loop {
        ticker.tick().await;
        if budget_per_tick == 0 || shared.paused.load(Ordering::SeqCst) {
            continue;
        }

        let selected_ranges: Vec<(u32, u32)> = {
            let selected = shared.selected.lock().unwrap_or_else(|e| e.into_inner());
            metadata
                .files
                .iter()
                .zip(selected.iter())
                .filter(|&(_, &wanted)| wanted)
                .map(|(file, _)| metadata.piece_range_of(file))
                .collect()
        };
        if selected_ranges.is_empty() {
            continue;
        }

        let critical = *shared.critical.lock().unwrap_or_else(|e| e.into_inner());
        let mut budget = budget_per_tick;

        while budget > 0 {
            let Some(index) = next_wanted_piece(&store, critical, &selected_ranges) else {
                break;
            };
            let len = store.length_of(index) as usize;
            let payload = synthesize_piece(&store, index, len);
            if store.insert(index, payload).is_err() {
                // Store destroyed with the session
                return;
            }
            shared.downloaded.fetch_add(len as u64, Ordering::SeqCst);
            budget = budget.saturating_sub(len as u64);
        }
    }
}

fn next_wanted_piece(
    store: &PieceStore,
    critical: Option<(u32, u32)>,
    selected_ranges: &[(u32, u32)],
) -> Option<u32> {
    let in_selected =
        |index: u32| selected_ranges.iter().any(|&(s, e)| index >= s && index <= e);

    // Critical range first, then sequentially from the critical start so
    // evicted trailing pieces are not immediately refetched.
    if let Some((start, end)) = critical {
        for index in start..=end {
            if in_selected(index) && !store.has_piece(index) {
                return Some(index);
            }
        }
        let tail_end = selected_ranges.iter().map(|&(_, e)| e).max()?;
        for index in end.saturating_add(1)..=tail_end {
            if in_selected(index) && !store.has_piece(index) {
                return Some(index);
            }
        }
        return None;
    }

    for &(start, end) in selected_ranges {
        for index in start..=end {
            if !store.has_piece(index) {
                return Some(index);
            }
        }
    }
    None
}

fn synthesize_piece(store: &PieceStore, index: u32, len: usize) -> Bytes {
    let piece_start = index as u64 * store.piece_length() as u64;
    let mut payload = Vec::with_capacity(len);
    for i in 0..len as u64 {
        payload.push(expected_byte(piece_start + i));
    }
    Bytes::from(payload)
}
