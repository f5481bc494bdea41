//! Torrent session types and the client capability boundary

pub mod client;
pub mod input;
pub mod sim;
pub mod types;

use std::fmt;

pub use client::{StoreFactory, TorrentClient, TorrentSession};
pub use input::TorrentInput;
pub use types::{SwarmStats, TorrentFileEntry, TorrentMetadata};

use crate::storage::StorageError;

/// 20-byte digest naming the swarm a session belongs to.
///
/// Every operation on the client trait is keyed by this value, and the
/// single-session invariant is enforced against it: admitting a new
/// hash tears the previous session down first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Wraps a raw digest.
    pub fn new(digest: [u8; 20]) -> Self {
        Self(digest)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parses the 40-character hex form found in magnet exact topics.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 40 {
            return None;
        }
        let mut digest = [0u8; 20];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let high = (chunk[0] as char).to_digit(16)?;
            let low = (chunk[1] as char).to_digit(16)?;
            digest[i] = (high * 16 + low) as u8;
        }
        Some(Self(digest))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

impl serde::Serialize for InfoHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Errors that can occur during torrent operations.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    /// Empty or malformed magnet link, path, or data URI.
    #[error("invalid torrent input: {reason}")]
    InvalidInput {
        /// Human-readable description of the problem
        reason: String,
    },

    /// An operation was issued before a session existed.
    #[error("no active torrent session")]
    EngineNotReady,

    /// Torrent metadata did not arrive in time.
    #[error("no torrent metadata after {seconds}s")]
    ConnectionTimeout {
        /// Timeout that elapsed, in seconds
        seconds: u64,
    },

    /// The torrent contains no files, or none that can be streamed.
    #[error("torrent contains no playable video file")]
    NoVideoFile,

    /// The requested file index does not exist in the torrent.
    #[error("file index {index} out of range, torrent has {count} files")]
    FileOutOfRange {
        /// Requested file index
        index: usize,
        /// Number of files in the torrent
        count: usize,
    },

    /// The info hash is not known to the client.
    #[error("torrent {info_hash} not found")]
    TorrentNotFound {
        /// Info hash of the missing torrent
        info_hash: InfoHash,
    },

    /// The requested bytes have not arrived from the swarm yet.
    ///
    /// Transient; streaming callers retry after a short delay.
    #[error("requested bytes not yet available")]
    NotYetAvailable,

    /// The engine actor has shut down.
    #[error("engine shut down")]
    EngineShutdown,

    /// Piece store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O failure reading a metainfo file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
