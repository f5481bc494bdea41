//! Engine state: session lifecycle, selection, and status emission.
//!
//! A single `StreamEngine` value owns the session, both HTTP listeners,
//! and the per-selection tasks. It is driven exclusively by the actor
//! loop, so nothing here needs a lock beyond the shared playback state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use super::commands::{FileSummary, SessionSnapshot, StatusUpdate, StreamTarget, TorrentCatalog};
use crate::config::SlipstreamConfig;
use crate::storage::PieceStore;
use crate::streaming::http_server::start_raw_server;
use crate::streaming::playback::PlaybackState;
use crate::streaming::probe::spawn_probe_task;
use crate::streaming::remux::{RemuxServer, start_remux_server};
use crate::streaming::scheduler::StreamScheduler;
use crate::streaming::{ActiveStream, StreamSlot, mime};
use crate::torrent::client::StoreFactory;
use crate::torrent::{InfoHash, TorrentClient, TorrentError, TorrentInput, TorrentMetadata};
use crate::Result;

/// Capacity of the status broadcast channel; slow subscribers lag
/// rather than blocking the emitter.
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// The streaming engine: one session, one selected file, two listeners.
pub struct StreamEngine {
    config: SlipstreamConfig,
    client: Arc<dyn TorrentClient>,
    slot: Arc<StreamSlot>,
    raw_port: u16,
    raw_task: tokio::task::JoinHandle<()>,
    remux: RemuxServer,
    status_tx: broadcast::Sender<StatusUpdate>,
    session: Option<ActiveSession>,
}

struct ActiveSession {
    metadata: TorrentMetadata,
    store: Arc<PieceStore>,
    selected: Option<SelectedStream>,
}

struct SelectedStream {
    file_index: usize,
    target: StreamTarget,
    playback: Arc<PlaybackState>,
    scheduler: Arc<StreamScheduler>,
    scheduler_task: tokio::task::JoinHandle<()>,
    status_task: tokio::task::JoinHandle<()>,
    probe_task: tokio::task::JoinHandle<()>,
}

impl SelectedStream {
    fn abort_tasks(&self) {
        self.scheduler_task.abort();
        self.status_task.abort();
        self.probe_task.abort();
    }
}

impl StreamEngine {
    /// Binds both HTTP listeners and returns a ready engine.
    ///
    /// # Errors
    ///
    /// - `SlipstreamError::Streaming` - No free port for either listener
    pub async fn new(
        config: SlipstreamConfig,
        client: Arc<dyn TorrentClient>,
    ) -> Result<Self> {
        let slot = Arc::new(StreamSlot::new());
        let (raw_port, raw_task) = start_raw_server(slot.clone(), &config.http).await?;
        let remux = start_remux_server(slot.clone(), &config.http, config.remux.clone()).await?;
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            client,
            slot,
            raw_port,
            raw_task,
            remux,
            status_tx,
            session: None,
        })
    }

    /// Port of the raw range endpoint.
    pub fn raw_port(&self) -> u16 {
        self.raw_port
    }

    /// Port of the remux endpoint.
    pub fn remux_port(&self) -> u16 {
        self.remux.port
    }

    /// Admits a torrent, tearing down any prior session first.
    ///
    /// All files start deselected; nothing downloads until a file is
    /// selected for streaming.
    ///
    /// # Errors
    ///
    /// - `TorrentError::ConnectionTimeout` - Metadata did not arrive
    /// - `TorrentError::NoVideoFile` - The torrent carries no files
    pub async fn add_torrent(&mut self, input: TorrentInput) -> Result<TorrentCatalog> {
        self.stop().await?;

        let factory: StoreFactory = Arc::new(|metadata: &TorrentMetadata| {
            Arc::new(PieceStore::new(
                metadata.piece_length,
                metadata.piece_count,
                metadata.total_size,
            ))
        });

        let timeout = self.config.torrent.metadata_timeout;
        let session = tokio::time::timeout(timeout, self.client.add(&input, factory))
            .await
            .map_err(|_| TorrentError::ConnectionTimeout {
                seconds: timeout.as_secs(),
            })??;

        let metadata = session.metadata.clone();
        if metadata.files.is_empty() {
            let _ = self.client.remove(metadata.info_hash, true).await;
            return Err(TorrentError::NoVideoFile.into());
        }

        for index in 0..metadata.files.len() {
            let _ = self.client.deselect_file(metadata.info_hash, index).await;
        }

        info!(
            "admitted torrent {} ({} files, {} bytes)",
            metadata.info_hash,
            metadata.files.len(),
            metadata.total_size
        );

        let catalog = catalog_of(&metadata);
        self.session = Some(ActiveSession {
            metadata,
            store: session.store,
            selected: None,
        });
        Ok(catalog)
    }

    /// Selects a file for streaming and starts the scheduler.
    ///
    /// Selecting the already-selected file is a no-op returning the
    /// existing target.
    ///
    /// # Errors
    ///
    /// - `TorrentError::EngineNotReady` - No admitted torrent
    /// - `TorrentError::FileOutOfRange` - Bad file index
    pub async fn select_file(&mut self, file_index: usize) -> Result<StreamTarget> {
        let Some(session) = &self.session else {
            return Err(TorrentError::EngineNotReady.into());
        };
        let metadata = session.metadata.clone();
        let store = session.store.clone();

        if file_index >= metadata.files.len() {
            return Err(TorrentError::FileOutOfRange {
                index: file_index,
                count: metadata.files.len(),
            }
            .into());
        }
        if let Some(selected) = self
            .session
            .as_ref()
            .and_then(|s| s.selected.as_ref())
        {
            if selected.file_index == file_index {
                return Ok(selected.target.clone());
            }
        }

        // Replace any prior selection
        self.remux.kill_active().await;
        if let Some(prior) = self
            .session
            .as_mut()
            .and_then(|s| s.selected.take())
        {
            prior.abort_tasks();
        }

        let info_hash = metadata.info_hash;
        for index in 0..metadata.files.len() {
            if index != file_index {
                let _ = self.client.deselect_file(info_hash, index).await;
            }
        }
        self.client.select_file(info_hash, file_index).await?;

        let file = metadata.files[file_index].clone();
        let transcoded = mime::needs_remux(&file.name);
        let content_type = mime::content_type_for(&file.name);

        let playback = Arc::new(PlaybackState::new(file.length));
        let scheduler = Arc::new(StreamScheduler::new(
            self.client.clone(),
            store,
            playback.clone(),
            metadata.clone(),
            file_index,
            self.config.buffer.clone(),
        ));
        let scheduler_task = scheduler.clone().spawn();

        self.slot.install(ActiveStream {
            client: self.client.clone(),
            info_hash,
            file: file.clone(),
            content_type,
            playback: playback.clone(),
        });

        let raw_url = format!("http://127.0.0.1:{}/", self.raw_port);
        let url = if transcoded {
            format!("http://127.0.0.1:{}/", self.remux.port)
        } else {
            raw_url.clone()
        };
        let target = StreamTarget {
            url,
            name: file.name.clone(),
            size: file.length,
            content_type: content_type.to_string(),
            info_hash,
            transcoded,
            estimated_duration: playback.estimated_duration(),
        };

        // The probe reads container headers through the raw endpoint
        let probe_task = spawn_probe_task(self.config.remux.clone(), raw_url, scheduler.clone());
        let status_task = spawn_status_emitter(StatusEmitterParams {
            client: self.client.clone(),
            info_hash,
            playback: playback.clone(),
            transcoded,
            file_length: file.length,
            status_tx: self.status_tx.clone(),
            interval: self.config.buffer.tick_interval,
        });

        info!(
            "streaming {} ({} bytes) at {}, transcoded={}",
            file.name, file.length, target.url, transcoded
        );

        if let Some(session) = &mut self.session {
            session.selected = Some(SelectedStream {
                file_index,
                target: target.clone(),
                playback,
                scheduler,
                scheduler_task,
                status_task,
                probe_task,
            });
        }
        Ok(target)
    }

    /// Admits a torrent and streams its largest video file, falling
    /// back to the largest file when nothing looks like a video.
    ///
    /// # Errors
    ///
    /// Same as `add_torrent` plus `select_file`.
    pub async fn start(&mut self, input: TorrentInput) -> Result<StreamTarget> {
        let catalog = self.add_torrent(input).await?;
        let pick = catalog
            .files
            .iter()
            .filter(|f| f.is_video)
            .max_by_key(|f| f.size)
            .or_else(|| catalog.files.iter().max_by_key(|f| f.size))
            .ok_or(TorrentError::NoVideoFile)?;
        self.select_file(pick.index).await
    }

    /// Tears down the active session; idempotent.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature leaves room for clients whose
    /// removal can fail.
    pub async fn stop(&mut self) -> Result<()> {
        self.remux.kill_active().await;
        self.slot.clear();

        if let Some(mut session) = self.session.take() {
            if let Some(selected) = session.selected.take() {
                selected.abort_tasks();
            }
            let info_hash = session.metadata.info_hash;
            if let Err(e) = self.client.remove(info_hash, true).await {
                debug!("client remove during stop: {e}");
            }
            // The client owns store destruction on remove; this covers
            // clients that skipped it
            session.store.destroy();
            info!("session {} stopped", info_hash);
        }
        Ok(())
    }

    /// Reports the player's playback time; large jumps trigger the
    /// seek path on the scheduler.
    pub async fn update_playback(&mut self, seconds: f64) {
        let Some(selected) = self
            .session
            .as_ref()
            .and_then(|s| s.selected.as_ref())
        else {
            return;
        };
        let previous = selected.playback.update_time(seconds);
        if (seconds - previous).abs() > self.config.buffer.seek_threshold_seconds {
            debug!(previous, seconds, "seek detected");
            selected.scheduler.handle_seek(seconds).await;
        }
    }

    /// Snapshot of the active session, if any.
    pub async fn session_info(&self) -> Option<SessionSnapshot> {
        let session = self.session.as_ref()?;
        let metadata = &session.metadata;
        let stats = self.client.stats(metadata.info_hash).await;
        Some(SessionSnapshot {
            name: metadata.name.clone(),
            info_hash: metadata.info_hash,
            files: catalog_of(metadata).files,
            total_size: metadata.total_size,
            stats,
            buffer: session
                .selected
                .as_ref()
                .map(|s| s.playback.buffer_info()),
            target: session.selected.as_ref().map(|s| s.target.clone()),
        })
    }

    /// New subscription to the periodic status events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status_tx.subscribe()
    }

    /// Stops the session and both listeners.
    pub async fn shutdown(&mut self) {
        let _ = self.stop().await;
        self.raw_task.abort();
        self.remux.task.abort();
        debug!("engine shut down");
    }
}

fn catalog_of(metadata: &TorrentMetadata) -> TorrentCatalog {
    TorrentCatalog {
        name: metadata.name.clone(),
        info_hash: metadata.info_hash,
        files: metadata
            .files
            .iter()
            .enumerate()
            .map(|(index, file)| FileSummary {
                index,
                name: file.name.clone(),
                size: file.length,
                is_video: mime::is_video(&file.name),
            })
            .collect(),
        total_size: metadata.total_size,
    }
}

struct StatusEmitterParams {
    client: Arc<dyn TorrentClient>,
    info_hash: InfoHash,
    playback: Arc<PlaybackState>,
    transcoded: bool,
    file_length: u64,
    status_tx: broadcast::Sender<StatusUpdate>,
    interval: Duration,
}

fn spawn_status_emitter(params: StatusEmitterParams) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(params.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let stats = params.client.stats(params.info_hash).await;
            let info = params.playback.buffer_info();
            let update = StatusUpdate {
                download_speed: stats.download_speed,
                upload_speed: stats.upload_speed,
                progress: (stats.downloaded as f64 / params.file_length.max(1) as f64).min(1.0),
                num_peers: stats.num_peers,
                downloaded: stats.downloaded,
                ratio: stats.ratio,
                buffered_ahead_seconds: info.buffered_ahead_seconds,
                buffer_size_mb: info.buffer_size_mb,
                quality_tier: info.quality_tier,
                transcoded: params.transcoded,
                actual_duration: params.playback.probed_duration(),
            };
            // Nobody listening is fine
            let _ = params.status_tx.send(update);
        }
    })
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.raw_task.abort();
        self.remux.task.abort();
        if let Some(selected) = self.session.as_ref().and_then(|s| s.selected.as_ref()) {
            selected.abort_tasks();
        }
    }
}
