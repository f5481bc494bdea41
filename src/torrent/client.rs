//! Capability boundary between the streaming engine and a torrent client.
//!
//! The streaming side never touches the peer-wire protocol directly. It
//! drives the swarm through this trait: piece priorities, per-file
//! selection, pause state, and byte-range reads out of the partial file.
//! Implementations are interchangeable; the crate ships a deterministic
//! simulated client, production deployments plug in a real engine.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::{InfoHash, TorrentError, TorrentInput, TorrentMetadata, types::SwarmStats};
use crate::storage::PieceStore;

/// Builds the memory-only piece store for a freshly resolved torrent.
///
/// Called by the client once metadata is known, so the store can be sized
/// to the torrent's piece geometry. All piece bytes land here; a client
/// must not spool to disk.
pub type StoreFactory = Arc<dyn Fn(&TorrentMetadata) -> Arc<PieceStore> + Send + Sync>;

/// An admitted torrent: resolved metadata plus its piece store.
#[derive(Clone)]
pub struct TorrentSession {
    /// Metadata resolved from the input
    pub metadata: TorrentMetadata,
    /// Store receiving every piece the swarm delivers
    pub store: Arc<PieceStore>,
}

/// Operations a torrent client must expose to the streaming engine.
#[async_trait]
pub trait TorrentClient: Send + Sync {
    /// Admits a torrent and resolves its metadata.
    ///
    /// Completes when metadata is known. Callers enforce their own
    /// deadline on top; the engine rejects with `ConnectionTimeout`
    /// after 60 seconds.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidInput` - Input the client cannot interpret
    async fn add(
        &self,
        input: &TorrentInput,
        make_store: StoreFactory,
    ) -> Result<TorrentSession, TorrentError>;

    /// Cancels all peer connections and optionally destroys the store.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - Unknown info hash
    async fn remove(&self, info_hash: InfoHash, destroy_store: bool) -> Result<(), TorrentError>;

    /// Marks a file as wanted for download.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - Unknown info hash
    /// - `TorrentError::FileOutOfRange` - File index out of range
    async fn select_file(&self, info_hash: InfoHash, file_index: usize)
    -> Result<(), TorrentError>;

    /// Marks a file as unwanted.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - Unknown info hash
    /// - `TorrentError::FileOutOfRange` - File index out of range
    async fn deselect_file(
        &self,
        info_hash: InfoHash,
        file_index: usize,
    ) -> Result<(), TorrentError>;

    /// Elevates a contiguous piece range to highest download priority.
    ///
    /// Implementations may clamp the range to the torrent's piece count.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - Unknown info hash
    async fn mark_critical(
        &self,
        info_hash: InfoHash,
        start_piece: u32,
        end_piece: u32,
    ) -> Result<(), TorrentError>;

    /// Stops issuing fresh block requests; peer connections are kept.
    ///
    /// Pausing an already-paused swarm is not an error.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - Unknown info hash
    async fn pause(&self, info_hash: InfoHash) -> Result<(), TorrentError>;

    /// Resumes issuing block requests.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - Unknown info hash
    async fn resume(&self, info_hash: InfoHash) -> Result<(), TorrentError>;

    /// Whether a piece is currently held locally.
    async fn has_piece(&self, info_hash: InfoHash, piece_index: u32) -> bool;

    /// Reads bytes from the torrent's global byte space.
    ///
    /// # Errors
    ///
    /// - `TorrentError::NotYetAvailable` - A needed piece has not arrived;
    ///   streaming callers retry after a short delay
    /// - `TorrentError::TorrentNotFound` - Unknown info hash
    /// - `TorrentError::Storage` - Range out of bounds or store destroyed
    async fn read_at(
        &self,
        info_hash: InfoHash,
        offset: u64,
        length: usize,
    ) -> Result<Bytes, TorrentError>;

    /// Current swarm telemetry.
    async fn stats(&self, info_hash: InfoHash) -> SwarmStats;
}
