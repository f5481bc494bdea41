//! Real-time remux pipeline for non-browser-playable containers.
//!
//! Rewraps the raw byte stream into fragmented MP4 with AAC stereo
//! audio, video copied untouched. A second HTTP listener serves
//! `GET /?t=SECONDS`; each request seeks by byte offset, feeds an
//! ffmpeg child from the partial file, and pipes its stdout into the
//! chunked response. Only one remux consumer is active at a time.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use bytes::Bytes;
use futures::stream;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::http_server::bind_first_free;
use super::playback::RemuxConsumerGuard;
use super::{ActiveStream, StreamSlot, StreamingError};
use crate::config::{HttpConfig, RemuxConfig};
use crate::torrent::TorrentError;

/// Read size for pumping bytes into and out of the ffmpeg child.
const PUMP_CHUNK_SIZE: usize = 256 * 1024;

/// Read size for draining ffmpeg stdout into the response body.
const OUTPUT_CHUNK_SIZE: usize = 8192;

/// Shared state for the remux endpoint handlers.
#[derive(Clone)]
struct RemuxServerState {
    slot: Arc<StreamSlot>,
    config: RemuxConfig,
    retry_delay: Duration,
    /// Kill signal of the currently running remux child, if any
    active_kill: Arc<tokio::sync::Mutex<Option<Arc<Notify>>>>,
}

/// Handle the engine uses to tear the pipeline down.
pub struct RemuxServer {
    /// Bound port of the remux listener
    pub port: u16,
    /// The serve task, aborted at shutdown
    pub task: tokio::task::JoinHandle<()>,
    active_kill: Arc<tokio::sync::Mutex<Option<Arc<Notify>>>>,
}

impl RemuxServer {
    /// Terminates the active remux child, if one is running.
    pub async fn kill_active(&self) {
        if let Some(kill) = self.active_kill.lock().await.take() {
            kill.notify_one();
        }
    }
}

/// Starts the remux server.
///
/// # Errors
///
/// - `StreamingError::ServerStartFailed` - No free port in the scan span
pub async fn start_remux_server(
    slot: Arc<StreamSlot>,
    http_config: &HttpConfig,
    remux_config: RemuxConfig,
) -> Result<RemuxServer, StreamingError> {
    let (listener, port) =
        bind_first_free(http_config.remux_port_floor, http_config.port_scan_span).await?;
    let active_kill = Arc::new(tokio::sync::Mutex::new(None));
    let state = RemuxServerState {
        slot,
        config: remux_config,
        retry_delay: http_config.piece_retry_delay,
        active_kill: active_kill.clone(),
    };
    let router = Router::new()
        .route("/", any(serve_remux))
        .with_state(state);

    info!("remux server listening on 127.0.0.1:{port}");
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("remux server error: {e}");
        }
    });
    Ok(RemuxServer {
        port,
        task,
        active_kill,
    })
}

#[derive(Deserialize)]
struct SeekQuery {
    #[serde(default)]
    t: Option<f64>,
}

async fn serve_remux(
    State(state): State<RemuxServerState>,
    Query(query): Query<SeekQuery>,
    method: Method,
) -> Response {
    let Some(stream) = state.slot.current() else {
        return (StatusCode::NOT_FOUND, "no stream selected").into_response();
    };

    if method == Method::HEAD {
        mp4_response(Body::empty())
    } else if method == Method::GET {
        start_remux_stream(&state, stream, query.t.unwrap_or(0.0)).await
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

async fn start_remux_stream(
    state: &RemuxServerState,
    stream: ActiveStream,
    seek_seconds: f64,
) -> Response {
    // A new consumer displaces the previous one; signal its child first
    let kill = Arc::new(Notify::new());
    if let Some(prior) = state
        .active_kill
        .lock()
        .await
        .replace(kill.clone())
    {
        prior.notify_one();
        debug!("displaced prior remux consumer");
    }

    let bps = stream.playback.bytes_per_second().max(1.0);
    let seek_byte = ((seek_seconds.max(0.0) * bps) as u64)
        .min(stream.file.length.saturating_sub(1));

    let mut child = match spawn_ffmpeg(&state.config) {
        Ok(child) => child,
        Err(e) => {
            warn!("failed to spawn remuxer: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to start media conversion",
            )
                .into_response();
        }
    };

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        warn!("remuxer child is missing a pipe");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    info!(
        seek_seconds,
        seek_byte, "remuxing {} to fragmented MP4", stream.file.name
    );

    spawn_input_pump(stream.clone(), seek_byte, stdin, state.retry_delay);
    spawn_stderr_reader(stderr);

    // Supervisor owns the child: reap on natural exit, SIGKILL on signal
    let kill_for_child = kill.clone();
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => info!("remuxer finished"),
                Ok(status) => debug!("remuxer exited with {status}"),
                Err(e) => warn!("failed to wait for remuxer: {e}"),
            },
            _ = kill_for_child.notified() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                debug!("remuxer killed");
            }
        }
    });

    let ticket = ConsumerTicket {
        kill,
        _consumer: stream.playback.begin_remux(),
    };
    let body = Body::from_stream(stream::unfold(
        (stdout, ticket),
        |(mut stdout, ticket)| async move {
            let mut buffer = vec![0u8; OUTPUT_CHUNK_SIZE];
            match stdout.read(&mut buffer).await {
                Ok(0) => None,
                Ok(n) => {
                    buffer.truncate(n);
                    Some((Ok(Bytes::from(buffer)), (stdout, ticket)))
                }
                Err(e) => Some((Err(e), (stdout, ticket))),
            }
        },
    ));

    mp4_response(body)
}

/// Signals the remux child when the consumer goes away, whether the
/// response finished or the client hung up mid-stream.
struct ConsumerTicket {
    kill: Arc<Notify>,
    _consumer: RemuxConsumerGuard,
}

impl Drop for ConsumerTicket {
    fn drop(&mut self) {
        self.kill.notify_one();
    }
}

fn mp4_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(
            header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate",
        )
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Builds the ffmpeg invocation: copy video, AAC stereo audio,
/// fragmented MP4 on stdout.
fn build_ffmpeg_args(config: &RemuxConfig) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        // The input skips ahead in bursts as pieces arrive, so probing
        // needs far more slack than a local file would
        "-probesize".into(),
        config.probesize.into(),
        "-analyzeduration".into(),
        config.analyzeduration.into(),
        "-i".into(),
        "pipe:0".into(),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        config.audio_bitrate.into(),
        "-ac".into(),
        "2".into(),
        "-movflags".into(),
        "frag_keyframe+empty_moov+default_base_moof+faststart".into(),
        "-max_muxing_queue_size".into(),
        "9999".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        "-f".into(),
        "mp4".into(),
        "pipe:1".into(),
    ]
}

fn spawn_ffmpeg(config: &RemuxConfig) -> std::io::Result<tokio::process::Child> {
    Command::new(&config.ffmpeg_path)
        .args(build_ffmpeg_args(config))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Feeds bytes from the partial file into ffmpeg stdin, starting at the
/// seek offset and retrying while pieces are still in flight.
fn spawn_input_pump(
    stream: ActiveStream,
    seek_byte: u64,
    mut stdin: tokio::process::ChildStdin,
    retry_delay: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut position = seek_byte;
        let file_length = stream.file.length;
        debug!("input pump starting at byte {position} of {file_length}");

        while position < file_length {
            let want = PUMP_CHUNK_SIZE.min((file_length - position) as usize);
            let offset = stream.file.offset + position;
            match stream.client.read_at(stream.info_hash, offset, want).await {
                Ok(bytes) => {
                    if let Err(e) = stdin.write_all(&bytes).await {
                        // The child exited or was displaced
                        log_pump_end(&e.to_string());
                        break;
                    }
                    position += bytes.len() as u64;
                }
                Err(TorrentError::NotYetAvailable) => {
                    tokio::time::sleep(retry_delay).await;
                }
                Err(e) => {
                    log_pump_end(&e.to_string());
                    break;
                }
            }
        }

        // Close stdin to signal EOF
        drop(stdin);
        debug!("input pump finished, fed up to byte {position}");
    })
}

/// Drains ffmpeg stderr so the child never blocks on it.
fn spawn_stderr_reader(stderr: tokio::process::ChildStderr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        while reader.read_line(&mut line).await.unwrap_or(0) > 0 {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                if is_expected_disconnect(trimmed) {
                    debug!("remuxer: {trimmed}");
                } else {
                    warn!("remuxer: {trimmed}");
                }
            }
            line.clear();
        }
    })
}

fn log_pump_end(message: &str) {
    if is_expected_disconnect(message) {
        debug!("input pump stopped: {message}");
    } else {
        warn!("input pump stopped: {message}");
    }
}

/// Error texts that mean the consumer went away, not that remuxing broke.
fn is_expected_disconnect(message: &str) -> bool {
    const NORMAL: &[&str] = &[
        "EPIPE",
        "Broken pipe",
        "broken pipe",
        "Readable stream closed",
        "Output stream closed",
        "signal: 9",
        "SIGKILL",
    ];
    NORMAL.iter().any(|marker| message.contains(marker))
}
