#![forbid(unsafe_code)]

//! Startup pass that rebuilds each channel's seen-set from the archive on
//! disk, so a restart never downloads a video twice.

use std::io;
use std::path::Path;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::channel::CachedChannel;

/// Marks every video already present under `<root>/<channel id>` as seen.
///
/// A channel without a directory keeps an unknown history. Unreadable entries
/// are logged and skipped.
pub fn reconcile_channel(root: &Path, channel: &mut CachedChannel) {
    let dir = root.join(&channel.id);
    if !dir.is_dir() {
        debug!(channel = %channel.id, path = %dir.display(), "no archive directory yet");
        return;
    }

    let mut found = 0usize;
    for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.io_error().map(io::Error::kind) != Some(io::ErrorKind::NotFound) {
                    warn!(channel = %channel.id, "skipping unreadable archive entry: {err}");
                }
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if let Some(video_id) = video_id_from_file_name(name) {
            channel.mark_seen(video_id);
            found += 1;
        }
    }

    info!(channel = %channel.id, videos = found, "reconciled archive directory");
}

/// `abc123.mp4` and `abc123.f137.webm` both belong to `abc123`; sidecars and
/// unfinished downloads belong to nothing.
pub fn video_id_from_file_name(name: &str) -> Option<&str> {
    if [".json", ".part", ".ytdl"]
        .iter()
        .any(|suffix| name.ends_with(suffix))
    {
        return None;
    }
    let id = name.split('.').next().unwrap_or_default();
    (!id.is_empty()).then_some(id)
}
