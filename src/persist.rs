//! Atomic JSON persistence
//!
//! State files are written to a uniquely named sibling temp file, flushed, and
//! renamed over the canonical file. A reader therefore only ever observes the
//! previous complete document or the new complete document.

use crate::error::{CacheError, CacheResult};
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of loading a state file
#[derive(Debug)]
pub enum LoadOutcome<T> {
    /// No file on disk
    Missing,
    /// File parsed successfully
    Loaded(T),
    /// File existed but could not be read or parsed; moved aside when possible
    Corrupted { backup: Option<PathBuf> },
}

/// Current time in epoch milliseconds, the unit of every persisted timestamp
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
///
/// Returns the number of bytes written.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> CacheResult<usize> {
    let json = serde_json::to_string_pretty(value)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| CacheError::directory(parent, e))?;
    }

    let temp_path = unique_temp_path(path);
    if let Err(e) = write_and_sync(&temp_path, json.as_bytes()).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(CacheError::io(path, e));
    }

    Ok(json.len())
}

async fn write_and_sync(path: &Path, bytes: &[u8]) -> CacheResult<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| CacheError::io(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| CacheError::io(path, e))?;
    file.sync_all().await.map_err(|e| CacheError::io(path, e))?;
    Ok(())
}

/// Sibling temp path: `<name>.tmp.<epoch-ms>.<random>`
fn unique_temp_path(path: &Path) -> PathBuf {
    let suffix = Uuid::new_v4().simple().to_string();
    path.with_file_name(format!(
        "{}.tmp.{}.{}",
        file_name(path),
        now_millis(),
        &suffix[..8]
    ))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string())
}

/// Load a JSON state file, moving an unparseable file aside as
/// `<name>.corrupted.<epoch-ms>` so the next save does not destroy it.
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> LoadOutcome<T> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LoadOutcome::Missing,
        Err(e) => {
            warn!("Cannot read state file {}: {}", path.display(), e);
            return LoadOutcome::Corrupted { backup: None };
        }
    };

    match serde_json::from_str(&content) {
        Ok(value) => LoadOutcome::Loaded(value),
        Err(e) => {
            let backup = path.with_file_name(format!(
                "{}.corrupted.{}",
                file_name(path),
                now_millis()
            ));
            warn!("State file {} is corrupted: {}", path.display(), e);
            match fs::rename(path, &backup).await {
                Ok(()) => {
                    warn!("Backed up corrupted state to {}", backup.display());
                    LoadOutcome::Corrupted {
                        backup: Some(backup),
                    }
                }
                Err(rename_err) => {
                    warn!("Could not back up corrupted state: {}", rename_err);
                    LoadOutcome::Corrupted { backup: None }
                }
            }
        }
    }
}

/// Temp files younger than this may belong to a save still in flight
pub const STALE_TEMP_AGE_MS: i64 = 60_000;

/// Remove temp files left behind by saves that died before their rename.
///
/// Only files whose embedded timestamp is at least [`STALE_TEMP_AGE_MS`] old
/// are removed. Returns how many were removed.
pub async fn remove_stale_temp_files(path: &Path) -> usize {
    let Some(dir) = path.parent() else {
        return 0;
    };
    let prefix = format!("{}.tmp.", file_name(path));
    let cutoff = now_millis() - STALE_TEMP_AGE_MS;

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        let written_at = rest
            .split('.')
            .next()
            .and_then(|ms| ms.parse::<i64>().ok())
            .unwrap_or(i64::MAX);
        if written_at > cutoff {
            continue;
        }
        if fs::remove_file(entry.path()).await.is_ok() {
            debug!("Removed stale temp file {}", entry.path().display());
            removed += 1;
        }
    }
    removed
}
