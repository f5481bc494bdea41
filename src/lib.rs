//! Slipstream - stream a single video file out of a BitTorrent swarm
//!
//! The engine exposes a local HTTP URL whose body is a seekable video
//! stream backed by a still-downloading torrent. Playback proceeds as a
//! sliding window over the torrent's pieces: pieces ahead of the read
//! head are prioritized, pieces outside the window are evicted from
//! memory, and the swarm is paused and resumed in response to buffer
//! fullness.

#![warn(missing_docs)]
#![warn(clippy::too_many_lines)]

pub mod config;
pub mod engine;
pub mod storage;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::SlipstreamConfig;
pub use engine::{EngineHandle, StatusUpdate, spawn_engine};
pub use storage::{PieceStore, StorageError};
pub use streaming::StreamingError;
pub use torrent::{InfoHash, TorrentClient, TorrentError, TorrentInput};

/// Errors that can bubble up from any Slipstream subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SlipstreamError {
    /// Torrent-related errors (input parsing, metadata, client operations)
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    /// Piece store errors (absent pieces, out-of-bounds ranges)
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Streaming service errors (servers, remuxing)
    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    /// Standard I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SlipstreamError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            SlipstreamError::Torrent(e) => match e {
                TorrentError::InvalidInput { reason } => {
                    format!("Invalid torrent input: {reason}")
                }
                TorrentError::ConnectionTimeout { seconds } => {
                    format!("No torrent metadata after {seconds}s")
                }
                TorrentError::NoVideoFile => "Torrent contains no playable file".to_string(),
                _ => "Torrent error occurred".to_string(),
            },
            SlipstreamError::Storage(_) => "Storage error occurred".to_string(),
            SlipstreamError::Streaming(e) => format!("Streaming error: {e}"),
            SlipstreamError::Io(_) => "I/O error occurred".to_string(),
        }
    }
}

/// Convenience Result type using SlipstreamError as the error type
pub type Result<T> = std::result::Result<T, SlipstreamError>;
