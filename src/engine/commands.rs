//! Command and payload definitions for the engine actor.

use serde::Serialize;
use tokio::sync::{broadcast, oneshot};

use crate::SlipstreamError;
use crate::streaming::buffer::{BufferInfo, QualityTier};
use crate::torrent::{InfoHash, SwarmStats, TorrentInput};

/// Commands that can be sent to the engine actor.
///
/// Each command carries a response channel where the actor sends back
/// its result; playback updates are fire-and-forget.
pub enum EngineCommand {
    /// Admit a torrent and return its file catalogue.
    AddTorrent {
        /// Validated torrent input
        input: TorrentInput,
        /// Response channel
        responder: oneshot::Sender<Result<TorrentCatalog, SlipstreamError>>,
    },
    /// Select a file for streaming and start the scheduler.
    SelectFile {
        /// Index into the torrent's file list
        file_index: usize,
        /// Response channel
        responder: oneshot::Sender<Result<StreamTarget, SlipstreamError>>,
    },
    /// Admit a torrent and stream its largest video file.
    Start {
        /// Validated torrent input
        input: TorrentInput,
        /// Response channel
        responder: oneshot::Sender<Result<StreamTarget, SlipstreamError>>,
    },
    /// Tear down the active session.
    Stop {
        /// Response channel
        responder: oneshot::Sender<Result<(), SlipstreamError>>,
    },
    /// Snapshot the active session, if any.
    GetInfo {
        /// Response channel
        responder: oneshot::Sender<Option<SessionSnapshot>>,
    },
    /// Report the player's playback position.
    UpdatePlayback {
        /// Playback time in seconds
        seconds: f64,
    },
    /// Subscribe to periodic status events.
    SubscribeStatus {
        /// Response channel
        responder: oneshot::Sender<broadcast::Receiver<StatusUpdate>>,
    },
    /// Shut the engine actor down.
    Shutdown {
        /// Response channel
        responder: oneshot::Sender<()>,
    },
}

/// One file of an admitted torrent, with its original torrent index.
#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    /// Index in the torrent's file list, unfiltered
    pub index: usize,
    /// File name
    pub name: String,
    /// File length in bytes
    pub size: u64,
    /// Whether the name looks like a video container
    pub is_video: bool,
}

/// Catalogue returned by `torrent.add`.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentCatalog {
    /// Torrent display name
    pub name: String,
    /// Info hash identifying the session
    pub info_hash: InfoHash,
    /// All files with their original indices
    pub files: Vec<FileSummary>,
    /// Total content size in bytes
    pub total_size: u64,
}

/// Playback endpoint returned by `torrent.selectFile` and `torrent.start`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamTarget {
    /// Local URL the player should load
    pub url: String,
    /// Selected file name
    pub name: String,
    /// Selected file length in bytes
    pub size: u64,
    /// MIME type the raw endpoint serves
    pub content_type: String,
    /// Info hash of the session
    pub info_hash: InfoHash,
    /// Whether playback goes through the remux pipeline
    pub transcoded: bool,
    /// Duration estimate in effect at selection time, seconds
    pub estimated_duration: f64,
}

/// Full session snapshot returned by `torrent.getInfo`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Torrent display name
    pub name: String,
    /// Info hash of the session
    pub info_hash: InfoHash,
    /// All files with their original indices
    pub files: Vec<FileSummary>,
    /// Total content size in bytes
    pub total_size: u64,
    /// Current swarm telemetry
    pub stats: SwarmStats,
    /// Latest scheduler snapshot, if a file is selected
    pub buffer: Option<BufferInfo>,
    /// Playback endpoint, if a file is selected
    pub target: Option<StreamTarget>,
}

/// Periodic status event emitted while a session is active.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    /// Download speed in bytes per second
    pub download_speed: u64,
    /// Upload speed in bytes per second
    pub upload_speed: u64,
    /// Download progress of the selected file, 0 to 1
    pub progress: f64,
    /// Number of connected peers
    pub num_peers: u32,
    /// Total bytes downloaded this session
    pub downloaded: u64,
    /// Upload/download ratio
    pub ratio: f64,
    /// Contiguous seconds buffered ahead of the read head
    pub buffered_ahead_seconds: f64,
    /// Resident piece bytes, in MiB
    pub buffer_size_mb: f64,
    /// Quality tier of the selected file
    pub quality_tier: Option<QualityTier>,
    /// Whether playback goes through the remux pipeline
    pub transcoded: bool,
    /// Container-probed duration, once known
    pub actual_duration: Option<f64>,
}
