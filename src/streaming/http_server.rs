//! HTTP range server for the raw byte stream.
//!
//! Serves the selected file straight out of the partial torrent with
//! full HTTP/1.1 range semantics. Range-request starts drive the read
//! head, which in turn drives the scheduler's window; response bodies
//! simply wait for pieces the swarm has not delivered yet.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use futures::stream;
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::{ActiveStream, StreamSlot, StreamingError};
use crate::config::HttpConfig;
use crate::torrent::TorrentError;

/// Shared state for the raw endpoint handlers.
#[derive(Clone)]
struct RawServerState {
    slot: Arc<StreamSlot>,
    chunk_size: usize,
    retry_delay: Duration,
}

/// Binds the first free loopback port at or above the floor.
pub(crate) async fn bind_first_free(
    floor: u16,
    span: u16,
) -> Result<(TcpListener, u16), StreamingError> {
    let mut last_error = String::new();
    for port in floor..floor.saturating_add(span) {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(StreamingError::ServerStartFailed {
        floor,
        span,
        reason: last_error,
    })
}

/// Starts the raw range server.
///
/// Returns the bound port and the serve task; the engine aborts the task
/// at shutdown. The server answers 404 until a stream is installed in
/// the slot.
///
/// # Errors
///
/// - `StreamingError::ServerStartFailed` - No free port in the scan span
pub async fn start_raw_server(
    slot: Arc<StreamSlot>,
    config: &HttpConfig,
) -> Result<(u16, tokio::task::JoinHandle<()>), StreamingError> {
    let (listener, port) = bind_first_free(config.raw_port_floor, config.port_scan_span).await?;
    let state = RawServerState {
        slot,
        chunk_size: config.chunk_size,
        retry_delay: config.piece_retry_delay,
    };
    let router = Router::new()
        .route("/", any(serve_video))
        .with_state(state);

    info!("raw stream server listening on 127.0.0.1:{port}");
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("raw stream server error: {e}");
        }
    });
    Ok((port, task))
}

async fn serve_video(
    State(state): State<RawServerState>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let Some(stream) = state.slot.current() else {
        return (StatusCode::NOT_FOUND, "no stream selected").into_response();
    };

    if method == Method::OPTIONS {
        preflight_response()
    } else if method == Method::GET || method == Method::HEAD {
        serve_range(&state, stream, method == Method::HEAD, &headers)
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

fn serve_range(
    state: &RawServerState,
    stream: ActiveStream,
    head_only: bool,
    headers: &HeaderMap,
) -> Response {
    let file_length = stream.file.length;
    let range = parse_range_header(headers, file_length);

    let (start, end, status) = match range {
        Some(Ok((start, end))) => (start, end, StatusCode::PARTIAL_CONTENT),
        Some(Err(())) => {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{file_length}"))
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
        None => (0, file_length.saturating_sub(1), StatusCode::OK),
    };

    // Range starts are the authoritative read-head signal
    if !head_only && status == StatusCode::PARTIAL_CONTENT {
        stream.playback.record_range_request(start);
    }

    let length = end - start + 1;
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, stream.content_type)
        .header(header::CONTENT_LENGTH, length.to_string())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate",
        )
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff");
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{file_length}"),
        );
    }

    // HEAD answers from metadata alone, no bytes are materialized
    let body = if head_only {
        Body::empty()
    } else {
        debug!(start, end, "streaming range");
        range_body(stream, start, length, state.chunk_size, state.retry_delay)
    };

    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn preflight_response() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, HEAD, OPTIONS")
        .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "Range, Content-Type")
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Parses a `Range: bytes=s-[e]` header against the file length.
///
/// Returns `None` without a usable header, `Some(Err(()))` for a range
/// that cannot be satisfied, and the clamped inclusive range otherwise.
fn parse_range_header(
    headers: &HeaderMap,
    file_length: u64,
) -> Option<Result<(u64, u64), ()>> {
    let raw = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = raw.strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;

    if file_length == 0 {
        return Some(Err(()));
    }

    if start_str.is_empty() {
        // Suffix range: last N bytes
        let suffix: u64 = end_str.parse().ok()?;
        if suffix == 0 {
            return Some(Err(()));
        }
        let start = file_length.saturating_sub(suffix);
        return Some(Ok((start, file_length - 1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        file_length - 1
    } else {
        match end_str.parse::<u64>() {
            Ok(end) => end.min(file_length - 1),
            Err(_) => return None,
        }
    };

    if start >= file_length || start > end {
        return Some(Err(()));
    }
    Some(Ok((start, end)))
}

/// Chunked body that reads out of the partial file, waiting for pieces
/// the swarm has not delivered yet.
fn range_body(
    stream: ActiveStream,
    start: u64,
    length: u64,
    chunk_size: usize,
    retry_delay: Duration,
) -> Body {
    let initial = (stream, start, length, 0u64);
    Body::from_stream(stream::unfold(initial, move |(s, start, length, sent)| {
        async move {
            if sent >= length {
                return None;
            }
            let offset = s.file.offset + start + sent;
            let want = chunk_size.min((length - sent) as usize);
            loop {
                match s.client.read_at(s.info_hash, offset, want).await {
                    Ok(bytes) => {
                        let n = bytes.len() as u64;
                        return Some((Ok(bytes), (s, start, length, sent + n)));
                    }
                    Err(TorrentError::NotYetAvailable) => {
                        tokio::time::sleep(retry_delay).await;
                    }
                    Err(e) => {
                        debug!("range stream ended: {e}");
                        // Terminate after surfacing the error once
                        let done = length;
                        return Some((Err(std::io::Error::other(e.to_string())), (s, start, length, done)));
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use bytes::Bytes;

    use super::*;
    use crate::config::HttpConfig;
    use crate::storage::PieceStore;
    use crate::streaming::playback::PlaybackState;
    use crate::torrent::client::StoreFactory;
    use crate::torrent::sim::{SimClientConfig, SimTorrentClient, expected_byte};
    use crate::torrent::{TorrentClient, TorrentInput};

    const MAGNET: &str =
        "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=movie.mp4";

    fn store_factory() -> StoreFactory {
        Arc::new(|metadata: &crate::torrent::TorrentMetadata| {
            Arc::new(PieceStore::new(
                metadata.piece_length,
                metadata.piece_count,
                metadata.total_size,
            ))
        })
    }

    /// Client with a fully prefilled 1 MiB store, swarm inert.
    async fn prefilled_state() -> (RawServerState, Arc<PlaybackState>, u64) {
        let client = Arc::new(SimTorrentClient::new(SimClientConfig {
            swarm_speed: 0,
            file_size: 1024 * 1024,
            piece_length: 64 * 1024,
            ..Default::default()
        }));
        let input = TorrentInput::parse(MAGNET).unwrap();
        let session = client.add(&input, store_factory()).await.unwrap();

        for index in 0..session.metadata.piece_count {
            let piece_start = index as u64 * 64 * 1024;
            let len = session.store.length_of(index) as usize;
            let payload: Vec<u8> = (0..len as u64)
                .map(|i| expected_byte(piece_start + i))
                .collect();
            session.store.insert(index, Bytes::from(payload)).unwrap();
        }

        let playback = Arc::new(PlaybackState::new(session.metadata.files[0].length));
        let slot = Arc::new(StreamSlot::new());
        slot.install(ActiveStream {
            client: client.clone(),
            info_hash: session.metadata.info_hash,
            file: session.metadata.files[0].clone(),
            content_type: "video/mp4",
            playback: playback.clone(),
        });

        let config = HttpConfig::default();
        let state = RawServerState {
            slot,
            chunk_size: config.chunk_size,
            retry_delay: Duration::from_millis(5),
        };
        (state, playback, session.metadata.files[0].length)
    }

    fn range_headers(spec: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_str(spec).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_get_without_range_is_full_200() {
        let (state, _, file_length) = prefilled_state().await;
        let response = serve_video(State(state), Method::GET, HeaderMap::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            &file_length.to_string()
        );
        assert_eq!(
            response.headers().get(header::ACCEPT_RANGES).unwrap(),
            "bytes"
        );
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache, no-store, must-revalidate"
        );
    }

    #[tokio::test]
    async fn test_range_request_returns_exact_bytes() {
        let (state, playback, file_length) = prefilled_state().await;
        let response = serve_video(
            State(state),
            Method::GET,
            range_headers("bytes=1000-2023"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            &format!("bytes 1000-2023/{file_length}")
        );
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            "1024"
        );

        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        assert_eq!(body.len(), 1024);
        for (i, &b) in body.iter().enumerate() {
            assert_eq!(b, expected_byte(1000 + i as u64));
        }

        // The range start moved the read head
        assert_eq!(playback.read_head_byte(), 1000);
    }

    #[tokio::test]
    async fn test_range_spanning_pieces() {
        let (state, _, _) = prefilled_state().await;
        // 64 KiB pieces; this range crosses the 1→2 boundary
        let response = serve_video(
            State(state),
            Method::GET,
            range_headers("bytes=130000-140000"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        assert_eq!(body.len(), 10001);
        for (i, &b) in body.iter().enumerate() {
            assert_eq!(b, expected_byte(130_000 + i as u64));
        }
    }

    #[tokio::test]
    async fn test_open_ended_range() {
        let (state, _, file_length) = prefilled_state().await;
        let start = file_length - 512;
        let response = serve_video(
            State(state),
            Method::GET,
            range_headers(&format!("bytes={start}-")),
        )
        .await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            "512"
        );
    }

    #[tokio::test]
    async fn test_unsatisfiable_range_is_416() {
        let (state, _, file_length) = prefilled_state().await;
        let response = serve_video(
            State(state),
            Method::GET,
            range_headers("bytes=999999999-"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            &format!("bytes */{file_length}")
        );
    }

    #[tokio::test]
    async fn test_head_carries_headers_and_no_body() {
        let (state, playback, file_length) = prefilled_state().await;
        let response = serve_video(State(state), Method::HEAD, HeaderMap::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            &file_length.to_string()
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "video/mp4"
        );
        let body = axum::body::to_bytes(response.into_body(), 16).await.unwrap();
        assert!(body.is_empty());
        // HEAD probes must not move the read head
        assert_eq!(playback.read_head_byte(), 0);
    }

    #[tokio::test]
    async fn test_options_preflight() {
        let (state, _, _) = prefilled_state().await;
        let response = serve_video(State(state), Method::OPTIONS, HeaderMap::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_METHODS)
                .unwrap(),
            "GET, HEAD, OPTIONS"
        );
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_HEADERS)
                .unwrap(),
            "Range, Content-Type"
        );
    }

    #[tokio::test]
    async fn test_no_active_stream_is_404() {
        let state = RawServerState {
            slot: Arc::new(StreamSlot::new()),
            chunk_size: 64 * 1024,
            retry_delay: Duration::from_millis(5),
        };
        let response = serve_video(State(state), Method::GET, HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_body_waits_for_missing_pieces() {
        let client = Arc::new(SimTorrentClient::new(SimClientConfig {
            swarm_speed: 0,
            file_size: 256 * 1024,
            piece_length: 64 * 1024,
            ..Default::default()
        }));
        let input = TorrentInput::parse(MAGNET).unwrap();
        let session = client.add(&input, store_factory()).await.unwrap();
        let playback = Arc::new(PlaybackState::new(session.metadata.files[0].length));
        let slot = Arc::new(StreamSlot::new());
        slot.install(ActiveStream {
            client: client.clone(),
            info_hash: session.metadata.info_hash,
            file: session.metadata.files[0].clone(),
            content_type: "video/mp4",
            playback,
        });
        let state = RawServerState {
            slot,
            chunk_size: 64 * 1024,
            retry_delay: Duration::from_millis(5),
        };

        let response = serve_video(State(state), Method::GET, range_headers("bytes=0-99")).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);

        // Deliver the piece after the response started
        let store = session.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let payload: Vec<u8> = (0..64 * 1024).map(expected_byte).collect();
            store.insert(0, Bytes::from(payload)).unwrap();
        });

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body.len(), 100);
        assert_eq!(body[0], expected_byte(0));
    }

    #[tokio::test]
    async fn test_bind_first_free_skips_taken_ports() {
        let (first, port_a) = bind_first_free(29090, 16).await.unwrap();
        let (_second, port_b) = bind_first_free(29090, 16).await.unwrap();
        assert_eq!(port_a, 29090);
        assert_eq!(port_b, 29091);
        drop(first);
    }

    #[test]
    fn test_parse_range_header_variants() {
        let ok = |spec: &str, len: u64| parse_range_header(&range_headers(spec), len);
        assert_eq!(ok("bytes=0-1023", 2048), Some(Ok((0, 1023))));
        assert_eq!(ok("bytes=1024-", 2048), Some(Ok((1024, 2047))));
        assert_eq!(ok("bytes=-512", 2048), Some(Ok((1536, 2047))));
        // End past the file clamps
        assert_eq!(ok("bytes=0-99999", 2048), Some(Ok((0, 2047))));
        // Start past the file is unsatisfiable
        assert_eq!(ok("bytes=4096-", 2048), Some(Err(())));
        assert_eq!(ok("bytes=10-5", 2048), Some(Err(())));
        assert_eq!(
            parse_range_header(&HeaderMap::new(), 2048),
            None
        );
        let mut junk = HeaderMap::new();
        junk.insert(header::RANGE, HeaderValue::from_static("pieces=0-1"));
        assert_eq!(parse_range_header(&junk, 2048), None);
    }
}
