//! File lifecycle tracker
//!
//! Every artifact a stage produces is registered here first, under a
//! per-type temp directory, and later moved to its final location. The
//! tracker keeps its own durable index, separate from the cache store; the
//! two are linked only by file ids. Attached to a cache event bus, it deletes
//! the files of invalidated blocks.

use super::types::{
    CleanupReport, FileStatistics, FileStatus, FileTrackerState, FileType, ManagedFile,
};
use crate::config::StorageConfig;
use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEvent, EventBus, EventKind, EventListener, ListenerHandle};
use crate::persist::{load_json, now_millis, write_json_atomic, LoadOutcome};
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

struct TrackerInner {
    files: BTreeMap<String, ManagedFile>,
    initialized: bool,
}

/// Durable registry of artifact files
pub struct FileTracker {
    temp_dir: PathBuf,
    state_path: PathBuf,
    inner: Mutex<TrackerInner>,
    subscriptions: std::sync::Mutex<Vec<(Arc<EventBus>, ListenerHandle)>>,
}

impl FileTracker {
    /// Tracker using the configured temp directory and state file
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_state_path(config.temp_dir(), config.file_state_path())
    }

    /// Tracker rooted at `temp_dir`, keeping its index in `file-state.json` there
    pub fn in_dir(temp_dir: impl Into<PathBuf>) -> Self {
        let temp_dir = temp_dir.into();
        let state_path = temp_dir.join("file-state.json");
        Self::with_state_path(temp_dir, state_path)
    }

    pub fn with_state_path(temp_dir: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            state_path: state_path.into(),
            inner: Mutex::new(TrackerInner {
                files: BTreeMap::new(),
                initialized: false,
            }),
            subscriptions: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Create directories and load the persisted index. Safe to call repeatedly.
    pub async fn initialize(&self) -> CacheResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.initialized {
            return Ok(());
        }
        self.load_into(&mut inner).await;
        info!("FileTracker initialized: {} files found", inner.files.len());
        Ok(())
    }

    async fn load_into(&self, inner: &mut TrackerInner) {
        inner.initialized = true;
        inner.files = BTreeMap::new();

        if let Err(e) = self.create_type_directories().await {
            warn!("{}; file index will not survive a restart", e);
            return;
        }

        inner.files = match load_json::<FileTrackerState>(&self.state_path).await {
            LoadOutcome::Loaded(state) => {
                debug!("Loaded file tracker state with {} files", state.files.len());
                state.files
            }
            LoadOutcome::Missing | LoadOutcome::Corrupted { .. } => {
                debug!("No existing file tracker state found, starting fresh");
                BTreeMap::new()
            }
        };
    }

    async fn create_type_directories(&self) -> CacheResult<()> {
        for file_type in FileType::ALL {
            ensure_directory(&self.temp_dir.join(file_type.as_str())).await?;
        }
        Ok(())
    }

    async fn lock_loaded(&self) -> MutexGuard<'_, TrackerInner> {
        let mut inner = self.inner.lock().await;
        if !inner.initialized {
            self.load_into(&mut inner).await;
        }
        inner
    }

    async fn save(&self, inner: &TrackerInner) {
        let state = FileTrackerState {
            files: inner.files.clone(),
            last_updated: now_millis(),
        };
        if let Err(e) = write_json_atomic(&self.state_path, &state).await {
            error!("Failed to save file tracker state: {}", e);
        }
    }

    /// Subscribe to invalidation and clear events on `bus`.
    ///
    /// The listener holds only a weak reference, so a dropped tracker simply
    /// stops reacting.
    pub fn attach(self: &Arc<Self>, bus: &Arc<EventBus>) {
        let listener: Arc<dyn EventListener> = Arc::new(CleanupListener {
            tracker: Arc::downgrade(self),
        });
        let mut subscriptions = self.subscriptions_lock();
        for kind in [EventKind::BlockInvalidated, EventKind::CacheCleared] {
            let handle = bus.on(kind, Arc::clone(&listener));
            subscriptions.push((Arc::clone(bus), handle));
        }
    }

    /// Remove every subscription made by [`attach`](Self::attach)
    pub fn detach(&self) -> usize {
        let subscriptions = std::mem::take(&mut *self.subscriptions_lock());
        let removed = subscriptions
            .iter()
            .filter(|(bus, handle)| bus.off(handle))
            .count();
        if removed > 0 {
            debug!("Removed {} file tracker event listeners", removed);
        }
        removed
    }

    fn subscriptions_lock(&self) -> std::sync::MutexGuard<'_, Vec<(Arc<EventBus>, ListenerHandle)>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new artifact in the temp directory of its type
    pub async fn create_temp_file(
        &self,
        file_type: FileType,
        filename: &str,
        metadata: Map<String, Value>,
    ) -> CacheResult<ManagedFile> {
        let mut inner = self.lock_loaded().await;

        let id = generate_file_id(file_type, filename);
        let temp_path = self.temp_path(file_type, filename);
        if let Some(parent) = temp_path.parent() {
            ensure_directory(parent).await?;
        }

        let now = now_millis();
        let file = ManagedFile {
            id: id.clone(),
            file_type,
            status: FileStatus::Creating,
            temp_path: Some(temp_path),
            final_path: None,
            created_at: now,
            updated_at: now,
            metadata,
        };
        inner.files.insert(id.clone(), file.clone());
        self.save(&inner).await;

        debug!("Created temp file record: {}", id);
        Ok(file)
    }

    /// Set a file's status; unknown ids are ignored with a warning
    pub async fn update_file_status(&self, file_id: &str, status: FileStatus) {
        let mut inner = self.lock_loaded().await;
        let Some(file) = inner.files.get_mut(file_id) else {
            warn!("File not found for status update: {}", file_id);
            return;
        };
        file.status = status;
        file.updated_at = now_millis();
        self.save(&inner).await;
    }

    /// Move a file from its temp path to `final_path`.
    ///
    /// A temp file that is already gone is fine as long as the final file
    /// exists, which makes a repeated move after a resumed run succeed.
    pub async fn move_to_final(&self, file_id: &str, final_path: impl AsRef<Path>) -> CacheResult<()> {
        let final_path = final_path.as_ref().to_path_buf();
        let mut inner = self.lock_loaded().await;

        let temp_path = match inner.files.get(file_id) {
            Some(file) => file.temp_path.clone(),
            None => return Err(CacheError::NoTempPath(file_id.to_string())),
        };

        let moved = match temp_path {
            Some(temp_path) => relocate(&temp_path, &final_path).await,
            None => {
                if !path_exists(&final_path).await {
                    return Err(CacheError::NoTempPath(file_id.to_string()));
                }
                Ok(())
            }
        };

        let Some(file) = inner.files.get_mut(file_id) else {
            return Err(CacheError::FileNotFound(file_id.to_string()));
        };
        file.updated_at = now_millis();

        match moved {
            Ok(()) => {
                file.final_path = Some(final_path.clone());
                file.temp_path = None;
                file.status = FileStatus::Completed;
                self.save(&inner).await;
                info!(
                    "Moved file {} to final location: {}",
                    file_id,
                    final_path.display()
                );
                Ok(())
            }
            Err(reason) => {
                file.status = FileStatus::Failed;
                self.save(&inner).await;
                Err(CacheError::move_failed(file_id, reason))
            }
        }
    }

    /// Delete tracked files and forget them.
    ///
    /// `None` targets every tracked file. Missing files on disk are not an
    /// error; unknown ids are reported as failed.
    pub async fn cleanup(&self, file_ids: Option<&[String]>) -> CleanupReport {
        let mut inner = self.lock_loaded().await;
        let targets: Vec<String> = match file_ids {
            Some(ids) => ids.to_vec(),
            None => inner.files.keys().cloned().collect(),
        };

        let mut report = CleanupReport::default();
        for id in targets {
            let paths = match inner.files.get_mut(&id) {
                Some(file) => {
                    file.status = FileStatus::Cleaning;
                    file.updated_at = now_millis();
                    [file.temp_path.clone(), file.final_path.clone()]
                }
                None => {
                    warn!("File not found for cleanup: {}", id);
                    report.failed.push(id);
                    continue;
                }
            };

            let mut removed_all = true;
            for path in paths.into_iter().flatten() {
                match fs::remove_file(&path).await {
                    Ok(()) => debug!("Deleted {}", path.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!("Already deleted: {}", path.display())
                    }
                    Err(e) => {
                        warn!("Failed to delete {}: {}", path.display(), e);
                        removed_all = false;
                    }
                }
            }

            if removed_all {
                inner.files.remove(&id);
                report.cleaned.push(id);
            } else {
                if let Some(file) = inner.files.get_mut(&id) {
                    file.status = FileStatus::Failed;
                }
                report.failed.push(id);
            }
        }

        self.save(&inner).await;
        info!(
            "Cleanup completed: {} cleaned, {} failed",
            report.cleaned.len(),
            report.failed.len()
        );
        report
    }

    /// Counts by type and status
    pub async fn statistics(&self) -> FileStatistics {
        let inner = self.lock_loaded().await;
        FileStatistics::of(inner.files.values())
    }

    pub async fn file(&self, file_id: &str) -> Option<ManagedFile> {
        self.lock_loaded().await.files.get(file_id).cloned()
    }

    /// Working path for a file of the given type
    pub fn temp_path(&self, file_type: FileType, filename: &str) -> PathBuf {
        self.temp_dir.join(file_type.as_str()).join(filename)
    }

    /// Destination path inside an output directory
    pub fn final_path(output_dir: impl AsRef<Path>, filename: &str) -> PathBuf {
        output_dir.as_ref().join(filename)
    }

    /// Delete every tracked file, empty the scratch directory and start over
    pub async fn clear_all_files(&self) -> CleanupReport {
        let report = self.cleanup(None).await;

        let scratch = self.temp_dir.join(FileType::Temp.as_str());
        if let Err(e) = fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", scratch.display(), e);
            }
        }

        let mut inner = self.lock_loaded().await;
        inner.files.clear();
        self.save(&inner).await;
        if let Err(e) = self.create_type_directories().await {
            warn!("Failed to recreate file directories: {}", e);
        }
        info!("All files cleared");
        report
    }

    /// Unsubscribe from events and flush the index
    pub async fn destroy(&self) {
        self.detach();
        let inner = self.lock_loaded().await;
        self.save(&inner).await;
        debug!("File tracker destroyed");
    }
}

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// `{type}_{stem}_{epoch-ms}_{6 random chars}`
fn generate_file_id(file_type: FileType, filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| char::from(ID_CHARSET[rng.random_range(0..ID_CHARSET.len())]))
        .collect();
    format!("{}_{}_{}_{}", file_type, stem, now_millis(), suffix)
}

async fn ensure_directory(dir: &Path) -> CacheResult<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| CacheError::directory(dir, e))
}

async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Move `from` to `to`, falling back to copy and delete across filesystems
async fn relocate(from: &Path, to: &Path) -> std::result::Result<(), String> {
    if let Some(parent) = to.parent() {
        ensure_directory(parent).await.map_err(|e| e.to_string())?;
    }

    if !path_exists(from).await {
        return if path_exists(to).await {
            Ok(())
        } else {
            Err(format!(
                "neither {} nor {} exists",
                from.display(),
                to.display()
            ))
        };
    }

    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    fs::copy(from, to).await.map_err(|e| e.to_string())?;
    fs::remove_file(from).await.map_err(|e| e.to_string())?;
    Ok(())
}

struct CleanupListener {
    tracker: Weak<FileTracker>,
}

#[async_trait]
impl EventListener for CleanupListener {
    async fn on_event(&self, event: &CacheEvent) -> Result<()> {
        let Some(tracker) = self.tracker.upgrade() else {
            return Ok(());
        };

        match event {
            CacheEvent::BlockInvalidated { block_id, file_ids } => info!(
                "Handling file cleanup for invalidated block {}: {} files",
                block_id,
                file_ids.len()
            ),
            CacheEvent::CacheCleared { file_ids } => {
                info!("Handling file cleanup for cache clear: {} files", file_ids.len())
            }
        }

        let report = tracker.cleanup(Some(event.file_ids())).await;
        if !report.failed.is_empty() {
            debug!("Could not clean up: {:?}", report.failed);
        }
        Ok(())
    }
}
