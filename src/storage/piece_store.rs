//! Bounded in-memory map from piece index to piece bytes.
//!
//! The store is the only place piece payloads live; nothing is spooled to
//! disk. Pieces are reference-counted `Bytes` slices, so an in-flight HTTP
//! read holding a piece keeps its payload alive even after eviction
//! removes the slot.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::{Bytes, BytesMut};

use super::StorageError;

/// Bounded memory of piece buffers keyed by global piece index.
///
/// Eviction and resident-bytes accounting are O(1). The have-bitfield is
/// cleared on eviction so the swarm re-fetches the region on seek.
pub struct PieceStore {
    piece_length: u32,
    piece_count: u32,
    total_size: u64,
    inner: RwLock<StoreInner>,
}

struct StoreInner {
    pieces: HashMap<u32, Bytes>,
    have: Vec<bool>,
    resident_bytes: u64,
    destroyed: bool,
}

impl PieceStore {
    /// Creates an empty store for a torrent with the given geometry.
    pub fn new(piece_length: u32, piece_count: u32, total_size: u64) -> Self {
        Self {
            piece_length,
            piece_count,
            total_size,
            inner: RwLock::new(StoreInner {
                pieces: HashMap::new(),
                have: vec![false; piece_count as usize],
                resident_bytes: 0,
                destroyed: false,
            }),
        }
    }

    /// Piece length in bytes; the last piece may be shorter.
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Total number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Total content size in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Expected length of a specific piece.
    pub fn length_of(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length as u64;
        (self.total_size - start).min(self.piece_length as u64)
    }

    /// Stores piece bytes and sets the have-bit.
    ///
    /// # Errors
    ///
    /// - `StorageError::Destroyed` - The owning session is gone
    /// - `StorageError::PieceOutOfBounds` - Index exceeds the piece count
    pub fn insert(&self, index: u32, bytes: Bytes) -> Result<(), StorageError> {
        let mut inner = self.write();
        if inner.destroyed {
            return Err(StorageError::Destroyed);
        }
        if index >= self.piece_count {
            return Err(StorageError::PieceOutOfBounds {
                index,
                count: self.piece_count,
            });
        }

        let len = bytes.len() as u64;
        if let Some(old) = inner.pieces.insert(index, bytes) {
            inner.resident_bytes -= old.len() as u64;
        }
        inner.resident_bytes += len;
        inner.have[index as usize] = true;
        Ok(())
    }

    /// Returns a zero-copy slice view into a present piece.
    ///
    /// # Errors
    ///
    /// - `StorageError::PieceNotPresent` - Piece absent or evicted
    /// - `StorageError::RangeOutOfBounds` - Slice exceeds the piece payload
    pub fn piece(&self, index: u32, offset: usize, length: usize) -> Result<Bytes, StorageError> {
        let inner = self.read();
        let bytes = inner
            .pieces
            .get(&index)
            .ok_or(StorageError::PieceNotPresent { index })?;
        if offset + length > bytes.len() {
            return Err(StorageError::RangeOutOfBounds {
                start: offset as u64,
                end: (offset + length) as u64 - 1,
                total_size: bytes.len() as u64,
            });
        }
        Ok(bytes.slice(offset..offset + length))
    }

    /// Drops a piece's bytes and clears its have-bit.
    ///
    /// Returns false if the piece was not resident. Outstanding readers
    /// holding a slice of the piece finish on their own reference.
    pub fn evict(&self, index: u32) -> bool {
        let mut inner = self.write();
        if index as usize >= inner.have.len() {
            return false;
        }
        inner.have[index as usize] = false;
        match inner.pieces.remove(&index) {
            Some(bytes) => {
                inner.resident_bytes -= bytes.len() as u64;
                true
            }
            None => false,
        }
    }

    /// Whether a piece is currently present.
    pub fn has_piece(&self, index: u32) -> bool {
        let inner = self.read();
        inner.have.get(index as usize).copied().unwrap_or(false)
    }

    /// Sum of lengths of present pieces.
    pub fn resident_bytes(&self) -> u64 {
        self.read().resident_bytes
    }

    /// Indices of all currently present pieces, unordered.
    pub fn resident_pieces(&self) -> Vec<u32> {
        self.read().pieces.keys().copied().collect()
    }

    /// Assembles a contiguous byte range across piece boundaries.
    ///
    /// `start..=end` are global torrent byte offsets. A single-piece read
    /// is returned as a zero-copy slice.
    ///
    /// # Errors
    ///
    /// - `StorageError::RangeOutOfBounds` - Range exceeds content size
    /// - `StorageError::PieceNotPresent` - Any needed piece is absent
    /// - `StorageError::Destroyed` - The owning session is gone
    pub fn read_range(&self, start: u64, end: u64) -> Result<Bytes, StorageError> {
        if start > end || end >= self.total_size {
            return Err(StorageError::RangeOutOfBounds {
                start,
                end,
                total_size: self.total_size,
            });
        }

        let inner = self.read();
        if inner.destroyed {
            return Err(StorageError::Destroyed);
        }

        let piece_len = self.piece_length as u64;
        let first_piece = (start / piece_len) as u32;
        let last_piece = (end / piece_len) as u32;

        if first_piece == last_piece {
            let bytes = inner
                .pieces
                .get(&first_piece)
                .ok_or(StorageError::PieceNotPresent { index: first_piece })?;
            let offset = (start - first_piece as u64 * piece_len) as usize;
            let length = (end - start + 1) as usize;
            if offset + length > bytes.len() {
                return Err(StorageError::PieceNotPresent { index: first_piece });
            }
            return Ok(bytes.slice(offset..offset + length));
        }

        let mut assembled = BytesMut::with_capacity((end - start + 1) as usize);
        for index in first_piece..=last_piece {
            let bytes = inner
                .pieces
                .get(&index)
                .ok_or(StorageError::PieceNotPresent { index })?;
            let piece_start = index as u64 * piece_len;
            let from = start.max(piece_start) - piece_start;
            let to = end.min(piece_start + bytes.len() as u64 - 1) - piece_start;
            if to < from {
                return Err(StorageError::PieceNotPresent { index });
            }
            assembled.extend_from_slice(&bytes[from as usize..=to as usize]);
        }
        Ok(assembled.freeze())
    }

    /// Drops all pieces and marks the store unusable.
    ///
    /// Subsequent inserts and range reads fail with `Destroyed`; resident
    /// bytes drop to zero.
    pub fn destroy(&self) {
        let mut inner = self.write();
        inner.pieces.clear();
        inner.have.iter_mut().for_each(|bit| *bit = false);
        inner.resident_bytes = 0;
        inner.destroyed = true;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
