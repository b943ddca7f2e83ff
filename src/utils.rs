//! Utility functions

use sha2::{Digest, Sha256};
use std::path::Path;

use crate::types::DownloadedFile;

/// Compute the stable dedup hash for a candidate URL.
///
/// SHA-256 over the raw URL text, hex-encoded. The hash is what the
/// `download_items.url_hash` UNIQUE constraint is enforced on, so it must be
/// deterministic across processes and versions.
pub fn url_hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compute the natural-key form of a series (name, season) pair.
///
/// Lowercased, with runs of whitespace collapsed to single spaces, joined with
/// a separator that cannot occur in the collapsed parts. Series identity is
/// always resolved through this key, never through ids supplied by rule
/// scripts.
pub fn series_key(name: &str, season: &str) -> String {
    format!("{}\u{1f}{}", normalize(name), normalize(season))
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Best-effort file name for a download URL (last path segment, falling back
/// to the item hash prefix when the URL has no usable path).
pub fn filename_from_url(url: &str) -> String {
    let parsed = url::Url::parse(url).ok();
    let segment = parsed
        .as_ref()
        .and_then(|u| u.path_segments())
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    segment.unwrap_or_else(|| format!("download-{}", &url_hash(url)[..12]))
}

impl DownloadedFile {
    /// Build the sandbox-facing view of a produced file
    pub fn from_path(path: &Path, size_bytes: u64) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            name,
            ext,
            size_bytes,
        }
    }
}
