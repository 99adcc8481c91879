//! Snapshot-diff change detection for mounts without reliable native
//! watchers.
//!
//! A snapshot records the mtime and size of every visible file below a
//! root. Diffing two snapshots yields created, modified, and removed paths.
//! Collection is best-effort: entries that vanish or error mid-walk are
//! skipped rather than failing the whole pass, so a flaky network share
//! degrades to a partial view instead of no view.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::trace;

use crate::config::WatchConfig;

use super::{WatchEvent, WatchEventKind};

/// Change fingerprint for a single file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FileStamp {
    pub(crate) mtime_ms: i64,
    pub(crate) len: u64,
}

/// All visible files below a root, keyed by absolute path.
pub(crate) type FileSnapshot = BTreeMap<PathBuf, FileStamp>;

fn stamp_of(metadata: &std::fs::Metadata) -> FileStamp {
    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map(|since_epoch| since_epoch.as_millis() as i64)
        .unwrap_or(0);
    FileStamp {
        mtime_ms,
        len: metadata.len(),
    }
}

/// Walk `root` and fingerprint every file not excluded by the ignore rules.
///
/// Blocking; run on a blocking-capable thread. Unreadable entries are
/// skipped silently.
pub(crate) fn collect_snapshot(root: &Path, config: &WatchConfig) -> FileSnapshot {
    let mut snapshot = FileSnapshot::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            trace!(dir = %dir.display(), "snapshot skipping unreadable directory");
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if config.is_ignored_within(root, &path) {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                if let Ok(metadata) = entry.metadata() {
                    snapshot.insert(path, stamp_of(&metadata));
                }
            }
            // Symlinks and special files are deliberately not followed.
        }
    }
    snapshot
}

/// Events that transform `old` into `new`, in path order.
pub(crate) fn diff_snapshots(old: &FileSnapshot, new: &FileSnapshot) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    for (path, stamp) in new {
        match old.get(path) {
            None => events.push(WatchEvent::now(WatchEventKind::Created, path.clone())),
            Some(previous) if previous != stamp => {
                events.push(WatchEvent::now(WatchEventKind::Modified, path.clone()));
            }
            Some(_) => {}
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            events.push(WatchEvent::now(WatchEventKind::Removed, path.clone()));
        }
    }
    events
}
