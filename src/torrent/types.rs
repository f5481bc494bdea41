//! Torrent metadata and telemetry types

use serde::Serialize;

use super::InfoHash;

/// Parsed metadata for an active torrent.
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    /// Info hash identifying the swarm
    pub info_hash: InfoHash,
    /// Display name of the torrent
    pub name: String,
    /// Piece length in bytes; the last piece may be shorter
    pub piece_length: u32,
    /// Number of pieces
    pub piece_count: u32,
    /// Total content size in bytes
    pub total_size: u64,
    /// Files in torrent order
    pub files: Vec<TorrentFileEntry>,
}

impl TorrentMetadata {
    /// Inclusive piece index range covering a file's bytes.
    pub fn piece_range_of(&self, file: &TorrentFileEntry) -> (u32, u32) {
        let piece_len = self.piece_length as u64;
        let start = (file.offset / piece_len) as u32;
        let end = ((file.offset + file.length.saturating_sub(1)) / piece_len) as u32;
        (start, end.min(self.piece_count.saturating_sub(1)))
    }
}

/// A single file within a torrent.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentFileEntry {
    /// File name, including any torrent-internal path
    pub name: String,
    /// Byte offset of the file within the torrent's content
    pub offset: u64,
    /// File length in bytes
    pub length: u64,
}

/// Per-tick swarm telemetry reported by the torrent client.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SwarmStats {
    /// Download speed in bytes per second
    pub download_speed: u64,
    /// Upload speed in bytes per second
    pub upload_speed: u64,
    /// Number of connected peers
    pub num_peers: u32,
    /// Total bytes downloaded this session
    pub downloaded: u64,
    /// Upload/download ratio
    pub ratio: f64,
}
