//! Container recognition: MIME types, remux set, video detection

use std::path::Path;

/// Containers browsers cannot play natively; these go through the remux
/// pipeline instead of the raw endpoint.
const NEEDS_REMUX: &[&str] = &[
    "mkv", "avi", "wmv", "flv", "ts", "m2ts", "vob", "rm", "rmvb",
];

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

/// MIME type for a video file, by extension.
pub fn content_type_for(filename: &str) -> &'static str {
    match extension_of(filename).as_deref() {
        Some("mp4" | "m4v" | "mov") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("wmv") => "video/x-ms-wmv",
        Some("flv") => "video/x-flv",
        Some("ts" | "m2ts" | "mts") => "video/mp2t",
        Some("mpg" | "mpeg" | "mpe" | "m2v") => "video/mpeg",
        Some("3gp") => "video/3gpp",
        Some("3g2") => "video/3gpp2",
        Some("ogv" | "ogg") => "video/ogg",
        _ => "application/octet-stream",
    }
}

/// Whether the container must be rewrapped into fragmented MP4 before a
/// browser will play it.
pub fn needs_remux(filename: &str) -> bool {
    extension_of(filename)
        .map(|ext| NEEDS_REMUX.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Whether a file looks like a video by extension.
pub fn is_video(filename: &str) -> bool {
    content_type_for(filename) != "application/octet-stream"
}
