//! Container duration probe.
//!
//! The file-size duration guess is wrong more often than not, which
//! throws off the bytes-per-second estimate and with it every window
//! computation. Shortly after a stream starts, ffprobe is pointed at
//! the raw endpoint; if the container headers have arrived it answers
//! with the real duration, which replaces the guess.

use std::sync::Arc;

use tokio::process::Command;
use tracing::debug;

use super::scheduler::StreamScheduler;
use crate::config::RemuxConfig;

/// Asks ffprobe for the container duration of the given URL.
///
/// Returns `None` when ffprobe is unavailable, the container headers
/// have not been downloaded yet, or the output carries no duration.
pub async fn probe_duration(ffprobe_path: &str, url: &str) -> Option<f64> {
    let output = Command::new(ffprobe_path)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            url,
        ])
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        debug!("ffprobe exited with {}", output.status);
        return None;
    }
    parse_ffprobe_output(&output.stdout)
}

/// Extracts `format.duration` from ffprobe JSON output.
fn parse_ffprobe_output(stdout: &[u8]) -> Option<f64> {
    let value: serde_json::Value = serde_json::from_slice(stdout).ok()?;
    let duration: f64 = value
        .get("format")?
        .get("duration")?
        .as_str()?
        .parse()
        .ok()?;
    (duration > 0.0).then_some(duration)
}

/// Probes the stream on the configured schedule and installs the first
/// successful answer into the scheduler.
///
/// The schedule entries are delays from stream start; the task retries
/// with the remaining entries if an attempt comes back empty.
pub fn spawn_probe_task(
    config: RemuxConfig,
    url: String,
    scheduler: Arc<StreamScheduler>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut elapsed = std::time::Duration::ZERO;
        for deadline in config.probe_schedule {
            if deadline > elapsed {
                tokio::time::sleep(deadline - elapsed).await;
                elapsed = deadline;
            }
            if let Some(duration) = probe_duration(&config.ffprobe_path, &url).await {
                debug!(duration, "container duration probed");
                scheduler.apply_probed_duration(duration);
                return;
            }
        }
        debug!("duration probe gave up after {} attempts", config.probe_schedule.len());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ffprobe_output() {
        let json = br#"{"format":{"filename":"pipe:0","duration":"5400.133000","size":"123"}}"#;
        let duration = parse_ffprobe_output(json).unwrap();
        assert!((duration - 5400.133).abs() < 1e-6);
    }

    #[test]
    fn test_parse_ffprobe_output_without_duration() {
        assert_eq!(parse_ffprobe_output(br#"{"format":{"size":"1"}}"#), None);
        assert_eq!(parse_ffprobe_output(br#"{"format":{"duration":"0"}}"#), None);
        assert_eq!(parse_ffprobe_output(b"not json"), None);
        assert_eq!(parse_ffprobe_output(b"{}"), None);
    }

    #[tokio::test]
    async fn test_probe_duration_with_missing_binary() {
        let result = probe_duration("/nonexistent/ffprobe", "http://127.0.0.1:1/").await;
        assert_eq!(result, None);
    }
}
