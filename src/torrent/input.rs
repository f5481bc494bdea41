//! Torrent input classification and validation.
//!
//! A torrent may be supplied as a magnet URI, a filesystem path to a
//! `.torrent` file, or a base64 data URI carrying the metainfo blob.

use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::{InfoHash, TorrentError};

/// Expected media type prefix for metainfo data URIs.
const DATA_URI_PREFIX: &str = "data:application/x-bittorrent;base64,";

/// A validated torrent input specification.
#[derive(Debug, Clone)]
pub enum TorrentInput {
    /// A `magnet:?xt=urn:btih:...` URI
    Magnet(String),
    /// A filesystem path to a `.torrent` metainfo file
    MetainfoFile(PathBuf),
    /// A raw metainfo blob, decoded from a data URI
    MetainfoBlob(Vec<u8>),
}

impl TorrentInput {
    /// Classifies and validates a raw input string.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidInput` - Empty input, malformed magnet URI,
    ///   undecodable data URI, or a path that does not exist
    pub fn parse(raw: &str) -> Result<Self, TorrentError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TorrentError::InvalidInput {
                reason: "empty torrent input".to_string(),
            });
        }

        if raw.starts_with("magnet:") {
            return Self::parse_magnet(raw);
        }

        if raw.starts_with("data:") {
            return Self::parse_data_uri(raw);
        }

        let path = PathBuf::from(raw);
        if !path.exists() {
            return Err(TorrentError::InvalidInput {
                reason: format!("no such torrent file: {raw}"),
            });
        }
        Ok(TorrentInput::MetainfoFile(path))
    }

    fn parse_magnet(raw: &str) -> Result<Self, TorrentError> {
        let parsed = url::Url::parse(raw).map_err(|e| TorrentError::InvalidInput {
            reason: format!("malformed magnet link: {e}"),
        })?;

        let has_btih = parsed
            .query_pairs()
            .any(|(key, value)| key == "xt" && value.starts_with("urn:btih:"));
        if !has_btih {
            return Err(TorrentError::InvalidInput {
                reason: "magnet link carries no urn:btih exact topic".to_string(),
            });
        }
        Ok(TorrentInput::Magnet(raw.to_string()))
    }

    fn parse_data_uri(raw: &str) -> Result<Self, TorrentError> {
        let encoded = raw
            .strip_prefix(DATA_URI_PREFIX)
            .ok_or_else(|| TorrentError::InvalidInput {
                reason: "data URI is not application/x-bittorrent;base64".to_string(),
            })?;
        let blob = BASE64
            .decode(encoded)
            .map_err(|e| TorrentError::InvalidInput {
                reason: format!("undecodable metainfo data URI: {e}"),
            })?;
        if blob.is_empty() {
            return Err(TorrentError::InvalidInput {
                reason: "empty metainfo blob".to_string(),
            });
        }
        Ok(TorrentInput::MetainfoBlob(blob))
    }

    /// Info hash extracted from a magnet link's exact topic, if hex-encoded.
    pub fn info_hash_hint(&self) -> Option<InfoHash> {
        let TorrentInput::Magnet(raw) = self else {
            return None;
        };
        let parsed = url::Url::parse(raw).ok()?;
        let topic = parsed
            .query_pairs()
            .find(|(key, _)| key == "xt")
            .map(|(_, value)| value.into_owned())?;
        InfoHash::from_hex(topic.strip_prefix("urn:btih:")?)
    }

    /// Display name hint from a magnet link's `dn` parameter.
    pub fn display_name_hint(&self) -> Option<String> {
        let TorrentInput::Magnet(raw) = self else {
            return None;
        };
        let parsed = url::Url::parse(raw).ok()?;
        parsed
            .query_pairs()
            .find(|(key, _)| key == "dn")
            .map(|(_, value)| value.into_owned())
    }
}
