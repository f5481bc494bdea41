//! In-memory piece storage with bounded residency

pub mod piece_store;

pub use piece_store::PieceStore;

/// Errors that can occur during piece store operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The piece has not arrived yet or was evicted.
    ///
    /// This is a transient condition: callers streaming out of a
    /// still-downloading file should retry after a short delay.
    #[error("piece {index} not present in store")]
    PieceNotPresent {
        /// Global piece index that was requested
        index: u32,
    },

    /// The piece index exceeds the torrent's piece count.
    #[error("piece {index} out of bounds, torrent has {count} pieces")]
    PieceOutOfBounds {
        /// Requested piece index
        index: u32,
        /// Number of pieces in the torrent
        count: u32,
    },

    /// The requested byte range exceeds the content size.
    #[error("byte range {start}..={end} exceeds content size {total_size}")]
    RangeOutOfBounds {
        /// First requested byte
        start: u64,
        /// Last requested byte, inclusive
        end: u64,
        /// Total content size in bytes
        total_size: u64,
    },

    /// The store was destroyed together with its session.
    #[error("piece store destroyed")]
    Destroyed,
}
