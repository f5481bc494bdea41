//! Slipstream CLI
//!
//! Admits a torrent, exposes the local playback URL, and prints status
//! lines until interrupted. The bundled torrent client is the
//! deterministic simulator; production deployments supply an engine
//! implementing the `TorrentClient` capability trait.

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use slipstream::torrent::sim::SimTorrentClient;
use slipstream::tracing_setup::init_tracing;
use slipstream::{SlipstreamConfig, StatusUpdate, TorrentInput, spawn_engine};
use tracing::Level;

#[derive(Parser)]
#[command(name = "slipstream")]
#[command(about = "Stream a video file out of a BitTorrent swarm")]
struct Cli {
    /// Magnet link, path to a .torrent file, or metainfo data URI
    input: String,

    /// Stream a specific file index instead of the largest video file
    #[arg(long)]
    file_index: Option<usize>,

    /// Lowest port tried for the raw range endpoint
    #[arg(long)]
    raw_port: Option<u16>,

    /// Lowest port tried for the remux endpoint
    #[arg(long)]
    remux_port: Option<u16>,

    /// Console log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_level, None)?;

    let mut config = SlipstreamConfig::from_env();
    if let Some(port) = cli.raw_port {
        config.http.raw_port_floor = port;
    }
    if let Some(port) = cli.remux_port {
        config.http.remux_port_floor = port;
    }

    let input = TorrentInput::parse(&cli.input)?;
    let client = Arc::new(SimTorrentClient::new_default());
    let handle = spawn_engine(config, client).await?;

    let target = match cli.file_index {
        Some(index) => {
            handle.add_torrent(input).await?;
            handle.select_file(index).await?
        }
        None => handle.start(input).await?,
    };

    println!("Playing {} ({})", target.name, format_bytes(target.size));
    println!("Stream URL: {}", target.url);
    if target.transcoded {
        println!("Container needs remuxing, serving fragmented MP4");
    }

    let mut status = handle.subscribe_status().await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            update = status.recv() => match update {
                Ok(update) => print_status_line(&update),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    handle.stop().await?;
    handle.shutdown().await?;
    Ok(())
}

fn print_status_line(update: &StatusUpdate) {
    print!(
        "\r{:>5.1}% | {} | {} peers | {:.0}s buffered | {:.1} MB resident   ",
        update.progress * 100.0,
        format_speed(update.download_speed),
        update.num_peers,
        update.buffered_ahead_seconds,
        update.buffer_size_mb,
    );
    let _ = std::io::stdout().flush();
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if value >= 10.0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}
