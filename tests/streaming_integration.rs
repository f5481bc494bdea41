//! End-to-end scenarios against the simulated torrent client.
//!
//! Each test spawns a full engine (actor, scheduler, both HTTP
//! listeners) and exercises it through the handle, with real HTTP
//! requests against the bound loopback ports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use slipstream::config::SlipstreamConfig;
use slipstream::engine::spawn_engine;
use slipstream::torrent::sim::{SimClientConfig, SimTorrentClient, expected_byte};
use slipstream::torrent::{InfoHash, TorrentError, TorrentFileEntry, TorrentInput, TorrentMetadata};
use slipstream::SlipstreamError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const MAGNET: &str =
    "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=movie.mp4";

const PIECE_LENGTH: u32 = 64 * 1024;

/// Multi-file torrent: a small text file followed by an MKV.
fn two_file_metadata() -> TorrentMetadata {
    let text_len = 1024 * 1024u64;
    let video_len = 6 * 1024 * 1024u64;
    let total_size = text_len + video_len;
    TorrentMetadata {
        info_hash: InfoHash::new([3u8; 20]),
        name: "movie-pack".to_string(),
        piece_length: PIECE_LENGTH,
        piece_count: total_size.div_ceil(PIECE_LENGTH as u64) as u32,
        total_size,
        files: vec![
            TorrentFileEntry {
                name: "sample.txt".to_string(),
                offset: 0,
                length: text_len,
            },
            TorrentFileEntry {
                name: "movie.mkv".to_string(),
                offset: text_len,
                length: video_len,
            },
        ],
    }
}

fn sim_client(metadata: Option<TorrentMetadata>) -> Arc<SimTorrentClient> {
    Arc::new(SimTorrentClient::new(SimClientConfig {
        swarm_speed: 32 * 1024 * 1024,
        delivery_interval: Duration::from_millis(5),
        file_size: 16 * 1024 * 1024,
        piece_length: PIECE_LENGTH,
        metadata,
        ..Default::default()
    }))
}

fn test_config(raw_floor: u16) -> SlipstreamConfig {
    let mut config = SlipstreamConfig::for_testing();
    config.http.raw_port_floor = raw_floor;
    config.http.remux_port_floor = raw_floor + 1000;
    config
}

fn port_of(url: &str) -> u16 {
    url.trim_start_matches("http://127.0.0.1:")
        .trim_end_matches('/')
        .parse()
        .expect("url carries a port")
}

/// Minimal HTTP/1.1 client for the loopback endpoints.
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    range: Option<&str>,
) -> (u16, HashMap<String, String>, Vec<u8>) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n");
    if let Some(range) = range {
        request.push_str(&format!("Range: {range}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has a header block");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let body = raw[split + 4..].to_vec();

    let mut lines = head.lines();
    let status: u16 = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("status line");
    let headers = lines
        .filter_map(|line| line.split_once(": "))
        .map(|(k, v)| (k.to_lowercase(), v.to_string()))
        .collect();
    (status, headers, body)
}

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn cold_start_direct_play_mp4() {
    let client = sim_client(None);
    let handle = spawn_engine(test_config(21100), client.clone()).await.unwrap();

    let input = TorrentInput::parse(MAGNET).unwrap();
    let target = handle.start(input).await.unwrap();

    assert!(!target.transcoded);
    assert_eq!(target.name, "movie.mp4");
    assert_eq!(target.content_type, "video/mp4");
    assert!(target.estimated_duration > 0.0);
    let port = port_of(&target.url);

    // First kilobyte over real HTTP; the body waits for piece arrival
    let (status, headers, body) =
        http_request(port, "GET", "/", Some("bytes=0-1023")).await;
    assert_eq!(status, 206);
    assert_eq!(
        headers.get("content-range").unwrap(),
        &format!("bytes 0-1023/{}", target.size)
    );
    assert_eq!(headers.get("content-length").unwrap(), "1024");
    assert_eq!(headers.get("accept-ranges").unwrap(), "bytes");
    assert_eq!(body.len(), 1024);
    for (i, &b) in body.iter().enumerate() {
        assert_eq!(b, expected_byte(i as u64));
    }

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn add_lists_files_with_original_indices() {
    let client = sim_client(Some(two_file_metadata()));
    let handle = spawn_engine(test_config(21200), client.clone()).await.unwrap();

    let catalog = handle
        .add_torrent(TorrentInput::parse(MAGNET).unwrap())
        .await
        .unwrap();

    assert_eq!(catalog.name, "movie-pack");
    assert_eq!(catalog.files.len(), 2);
    assert_eq!(catalog.files[0].index, 0);
    assert!(!catalog.files[0].is_video);
    assert_eq!(catalog.files[1].index, 1);
    assert!(catalog.files[1].is_video);

    // Nothing is selected after add
    assert_eq!(client.selected_files(), vec![false, false]);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn remux_container_streams_on_second_port() {
    let client = sim_client(Some(two_file_metadata()));
    let handle = spawn_engine(test_config(21300), client.clone()).await.unwrap();

    handle
        .add_torrent(TorrentInput::parse(MAGNET).unwrap())
        .await
        .unwrap();
    let target = handle.select_file(1).await.unwrap();

    assert!(target.transcoded);
    assert_eq!(target.name, "movie.mkv");
    let port = port_of(&target.url);

    // HEAD answers from metadata without spawning a remuxer
    let (status, headers, body) = http_request(port, "HEAD", "/?t=0", None).await;
    assert_eq!(status, 200);
    assert_eq!(headers.get("content-type").unwrap(), "video/mp4");
    assert!(body.is_empty());

    // Only the MKV is selected, reasserted by the scheduler
    assert!(
        wait_until(|| client.selected_files() == vec![false, true], Duration::from_secs(2)).await
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn select_file_is_idempotent() {
    let client = sim_client(Some(two_file_metadata()));
    let handle = spawn_engine(test_config(21400), client.clone()).await.unwrap();

    handle
        .add_torrent(TorrentInput::parse(MAGNET).unwrap())
        .await
        .unwrap();
    let first = handle.select_file(1).await.unwrap();
    let second = handle.select_file(1).await.unwrap();

    assert_eq!(first.url, second.url);
    assert_eq!(first.name, second.name);

    let info = handle.session_info().await.unwrap().unwrap();
    assert_eq!(info.target.unwrap().url, first.url);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn select_file_rejects_bad_index() {
    let client = sim_client(Some(two_file_metadata()));
    let handle = spawn_engine(test_config(21500), client).await.unwrap();

    handle
        .add_torrent(TorrentInput::parse(MAGNET).unwrap())
        .await
        .unwrap();
    let result = handle.select_file(7).await;
    assert!(matches!(
        result,
        Err(SlipstreamError::Torrent(TorrentError::FileOutOfRange { index: 7, count: 2 }))
    ));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn select_before_add_is_engine_not_ready() {
    let client = sim_client(None);
    let handle = spawn_engine(test_config(21600), client).await.unwrap();

    let result = handle.select_file(0).await;
    assert!(matches!(
        result,
        Err(SlipstreamError::Torrent(TorrentError::EngineNotReady))
    ));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent_and_frees_the_session() {
    let client = sim_client(None);
    let handle = spawn_engine(test_config(21700), client.clone()).await.unwrap();

    let target = handle.start(TorrentInput::parse(MAGNET).unwrap()).await.unwrap();
    assert!(client.has_active());

    handle.stop().await.unwrap();
    assert!(!client.has_active());
    assert!(handle.session_info().await.unwrap().is_none());

    // A second stop succeeds with nothing to do
    handle.stop().await.unwrap();

    // The raw endpoint answers 404 once the stream is gone
    let (status, _, _) = http_request(port_of(&target.url), "GET", "/", None).await;
    assert_eq!(status, 404);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn starting_a_new_session_replaces_the_old_one() {
    let client = sim_client(None);
    let handle = spawn_engine(test_config(21800), client.clone()).await.unwrap();

    let first = handle.start(TorrentInput::parse(MAGNET).unwrap()).await.unwrap();

    let other_magnet =
        "magnet:?xt=urn:btih:fedcba9876543210fedcba9876543210fedcba98&dn=other.mp4";
    let second = handle.start(TorrentInput::parse(other_magnet).unwrap()).await.unwrap();

    assert_ne!(first.info_hash, second.info_hash);
    let info = handle.session_info().await.unwrap().unwrap();
    assert_eq!(info.info_hash, second.info_hash);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn bad_range_yields_416_with_full_length() {
    let client = sim_client(None);
    let handle = spawn_engine(test_config(21900), client).await.unwrap();

    let target = handle.start(TorrentInput::parse(MAGNET).unwrap()).await.unwrap();
    let port = port_of(&target.url);

    let (status, headers, _) =
        http_request(port, "GET", "/", Some("bytes=999999999-")).await;
    assert_eq!(status, 416);
    assert_eq!(
        headers.get("content-range").unwrap(),
        &format!("bytes */{}", target.size)
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn playback_jump_moves_the_critical_range() {
    let client = sim_client(None);
    let handle = spawn_engine(test_config(22000), client.clone()).await.unwrap();

    let target = handle.start(TorrentInput::parse(MAGNET).unwrap()).await.unwrap();

    // Establish a position, then jump ten minutes in
    handle.update_playback(10.0).await;
    handle.update_playback(600.0).await;

    let bps = target.size as f64 / target.estimated_duration;
    let expected_piece = ((600.0 * bps) as u64 / PIECE_LENGTH as u64) as u32;

    assert!(
        wait_until(
            || {
                client
                    .critical_range()
                    .is_some_and(|(start, _)| start.abs_diff(expected_piece) <= 1)
            },
            Duration::from_millis(500),
        )
        .await,
        "critical range never moved near piece {expected_piece}"
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn status_events_flow_while_session_is_active() {
    let client = sim_client(None);
    let handle = spawn_engine(test_config(22100), client).await.unwrap();

    handle.start(TorrentInput::parse(MAGNET).unwrap()).await.unwrap();
    let mut status = handle.subscribe_status().await.unwrap();

    let update = tokio::time::timeout(Duration::from_secs(2), status.recv())
        .await
        .expect("status event within two seconds")
        .unwrap();

    assert!(!update.transcoded);
    assert!(update.quality_tier.is_some());
    assert!(update.num_peers > 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn metadata_timeout_surfaces_connection_timeout() {
    let client = Arc::new(SimTorrentClient::new(SimClientConfig {
        metadata_delay: Duration::from_secs(2),
        ..SimClientConfig::default()
    }));
    let handle = spawn_engine(test_config(22200), client).await.unwrap();

    let result = handle.add_torrent(TorrentInput::parse(MAGNET).unwrap()).await;
    assert!(matches!(
        result,
        Err(SlipstreamError::Torrent(TorrentError::ConnectionTimeout { .. }))
    ));
    assert!(handle.session_info().await.unwrap().is_none());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn resident_memory_stays_bounded_with_idle_read_head() {
    let mut config = test_config(22300);
    // Shrink the budget so the window is a handful of pieces
    config.buffer.max_buffer_bytes = 2 * 1024 * 1024;
    config.buffer.hard_cap_bytes = 3 * 1024 * 1024;

    let client = sim_client(None);
    let handle = spawn_engine(config.clone(), client.clone()).await.unwrap();
    handle.start(TorrentInput::parse(MAGNET).unwrap()).await.unwrap();

    // Let the fast swarm run against the pinned read head
    tokio::time::sleep(Duration::from_millis(600)).await;

    let info = handle.session_info().await.unwrap().unwrap();
    let buffer = info.buffer.unwrap();
    let resident = (buffer.buffer_size_mb * 1024.0 * 1024.0) as u64;
    assert!(
        resident <= config.buffer.hard_cap_bytes,
        "resident {resident} exceeded the hard cap"
    );
    // The full buffer must have toggled the soft pause
    assert!(buffer.soft_paused || buffer.buffered_ahead_seconds > 0.0);

    handle.shutdown().await.unwrap();
}
