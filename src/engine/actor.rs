//! Actor loop driving the engine.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::commands::EngineCommand;
use super::core::StreamEngine;
use super::handle::EngineHandle;
use crate::Result;
use crate::config::SlipstreamConfig;
use crate::torrent::TorrentClient;

/// Spawns the engine actor and returns its handle.
///
/// Binds both HTTP listeners, then processes commands sequentially in a
/// dedicated task. Sequential processing keeps every session mutation
/// on one logical loop, so no state here is ever mutated concurrently.
///
/// # Errors
///
/// - `SlipstreamError::Streaming` - No free port for a listener
pub async fn spawn_engine(
    config: SlipstreamConfig,
    client: Arc<dyn TorrentClient>,
) -> Result<EngineHandle> {
    let engine = StreamEngine::new(config, client).await?;
    let (sender, receiver) = mpsc::channel(64);

    tokio::spawn(async move {
        run_actor_loop(engine, receiver).await;
    });

    Ok(EngineHandle::new(sender))
}

/// Processes commands until shutdown or until every handle is dropped.
async fn run_actor_loop(mut engine: StreamEngine, mut receiver: mpsc::Receiver<EngineCommand>) {
    tracing::debug!("engine actor started");

    while let Some(command) = receiver.recv().await {
        if !handle_command(&mut engine, command).await {
            break;
        }
    }

    engine.shutdown().await;
    tracing::debug!("engine actor stopped");
}

/// Handles a single command. Returns false to shut down.
async fn handle_command(engine: &mut StreamEngine, command: EngineCommand) -> bool {
    match command {
        EngineCommand::AddTorrent { input, responder } => {
            let result = engine.add_torrent(input).await;
            let _ = responder.send(result);
        }

        EngineCommand::SelectFile {
            file_index,
            responder,
        } => {
            let result = engine.select_file(file_index).await;
            let _ = responder.send(result);
        }

        EngineCommand::Start { input, responder } => {
            let result = engine.start(input).await;
            let _ = responder.send(result);
        }

        EngineCommand::Stop { responder } => {
            let result = engine.stop().await;
            let _ = responder.send(result);
        }

        EngineCommand::GetInfo { responder } => {
            let snapshot = engine.session_info().await;
            let _ = responder.send(snapshot);
        }

        EngineCommand::UpdatePlayback { seconds } => {
            engine.update_playback(seconds).await;
        }

        EngineCommand::SubscribeStatus { responder } => {
            let _ = responder.send(engine.subscribe_status());
        }

        EngineCommand::Shutdown { responder } => {
            let _ = responder.send(());
            return false;
        }
    }
    true
}
