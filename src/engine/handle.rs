//! Handle for communicating with the engine actor.

use tokio::sync::{broadcast, mpsc, oneshot};

use super::commands::{
    EngineCommand, SessionSnapshot, StatusUpdate, StreamTarget, TorrentCatalog,
};
use crate::torrent::{TorrentError, TorrentInput};
use crate::{Result, SlipstreamError};

/// Handle for communicating with the engine actor.
///
/// Provides an ergonomic async API over the command channel. It can be
/// cloned and shared across tasks safely.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Creates a new handle with the given command sender.
    pub fn new(sender: mpsc::Sender<EngineCommand>) -> Self {
        Self { sender }
    }

    /// Admits a torrent and returns its file catalogue.
    ///
    /// Any prior session is torn down first; all files start
    /// deselected.
    ///
    /// # Errors
    /// - `TorrentError::InvalidInput` - Unusable magnet, path, or data URI
    /// - `TorrentError::ConnectionTimeout` - Metadata never arrived
    /// - `TorrentError::NoVideoFile` - The torrent carries no files
    pub async fn add_torrent(&self, input: TorrentInput) -> Result<TorrentCatalog> {
        let (responder, rx) = oneshot::channel();
        self.send(EngineCommand::AddTorrent { input, responder })
            .await?;
        rx.await.map_err(|_| shutdown_error())?
    }

    /// Selects a file for streaming; returns the playback endpoint.
    ///
    /// # Errors
    /// - `TorrentError::EngineNotReady` - No admitted torrent
    /// - `TorrentError::FileOutOfRange` - Bad file index
    pub async fn select_file(&self, file_index: usize) -> Result<StreamTarget> {
        let (responder, rx) = oneshot::channel();
        self.send(EngineCommand::SelectFile {
            file_index,
            responder,
        })
        .await?;
        rx.await.map_err(|_| shutdown_error())?
    }

    /// Admits a torrent and streams its largest video file.
    ///
    /// # Errors
    /// Same as `add_torrent` plus `select_file`.
    pub async fn start(&self, input: TorrentInput) -> Result<StreamTarget> {
        let (responder, rx) = oneshot::channel();
        self.send(EngineCommand::Start { input, responder }).await?;
        rx.await.map_err(|_| shutdown_error())?
    }

    /// Tears down the active session; safe to call repeatedly.
    ///
    /// # Errors
    /// Fails only when the engine actor is gone.
    pub async fn stop(&self) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.send(EngineCommand::Stop { responder }).await?;
        rx.await.map_err(|_| shutdown_error())?
    }

    /// Snapshot of the active session, if any.
    ///
    /// # Errors
    /// Fails only when the engine actor is gone.
    pub async fn session_info(&self) -> Result<Option<SessionSnapshot>> {
        let (responder, rx) = oneshot::channel();
        self.send(EngineCommand::GetInfo { responder }).await?;
        rx.await.map_err(|_| shutdown_error())
    }

    /// Reports the player's playback position; fire-and-forget.
    ///
    /// Jumps larger than the seek threshold reprioritize the swarm
    /// around the new position.
    pub async fn update_playback(&self, seconds: f64) {
        let _ = self
            .sender
            .send(EngineCommand::UpdatePlayback { seconds })
            .await;
    }

    /// Subscribes to the periodic status events.
    ///
    /// # Errors
    /// Fails only when the engine actor is gone.
    pub async fn subscribe_status(&self) -> Result<broadcast::Receiver<StatusUpdate>> {
        let (responder, rx) = oneshot::channel();
        self.send(EngineCommand::SubscribeStatus { responder })
            .await?;
        rx.await.map_err(|_| shutdown_error())
    }

    /// Shuts down the engine actor gracefully.
    ///
    /// # Errors
    /// Fails only when the engine actor is already gone.
    pub async fn shutdown(&self) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.send(EngineCommand::Shutdown { responder }).await?;
        rx.await.map_err(|_| shutdown_error())
    }

    /// Whether the engine actor is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| shutdown_error())
    }
}

fn shutdown_error() -> SlipstreamError {
    TorrentError::EngineShutdown.into()
}
