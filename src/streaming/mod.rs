//! Streaming pipeline: buffer model, scheduler, HTTP surface, remuxing

pub mod bitrate;
pub mod buffer;
pub mod http_server;
pub mod mime;
pub mod playback;
pub mod probe;
pub mod remux;
pub mod scheduler;

use std::sync::{Arc, RwLock};

pub use bitrate::BitrateEstimator;
pub use buffer::{BufferConfig, BufferInfo, QualityTier};
pub use playback::PlaybackState;
pub use scheduler::StreamScheduler;

use crate::torrent::{InfoHash, TorrentClient, TorrentFileEntry};

/// Errors raised by the streaming services.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    /// No free port was found at or above the configured floor.
    #[error("no free port in {span} ports starting at {floor}: {reason}")]
    ServerStartFailed {
        /// Lowest port tried
        floor: u16,
        /// Number of ports scanned
        span: u16,
        /// Underlying bind error
        reason: String,
    },

    /// The remux child could not be spawned or failed unexpectedly.
    #[error("remuxing failed: {reason}")]
    RemuxFailed {
        /// Human-readable description of the failure
        reason: String,
    },
}

/// The file currently being streamed, shared with the HTTP listeners.
///
/// Cheap to clone; handlers clone it out of the slot and never hold the
/// slot lock across an await point.
#[derive(Clone)]
pub struct ActiveStream {
    /// Client used for byte-range reads
    pub client: Arc<dyn TorrentClient>,
    /// Session identity
    pub info_hash: InfoHash,
    /// The selected file
    pub file: TorrentFileEntry,
    /// MIME type served by the raw endpoint
    pub content_type: &'static str,
    /// Shared read-head and estimator state
    pub playback: Arc<PlaybackState>,
}

/// Atomically replaceable slot holding the active stream.
///
/// The engine installs a stream on selection and clears it on stop; both
/// HTTP listeners read through the same slot.
#[derive(Default)]
pub struct StreamSlot {
    inner: RwLock<Option<ActiveStream>>,
}

impl StreamSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new active stream, replacing any prior one.
    pub fn install(&self, stream: ActiveStream) {
        *self.write() = Some(stream);
    }

    /// Clears the slot; subsequent requests see no active stream.
    pub fn clear(&self) {
        *self.write() = None;
    }

    /// Clones out the current stream, if any.
    pub fn current(&self) -> Option<ActiveStream> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<ActiveStream>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
