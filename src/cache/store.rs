//! Durable block and step state
//!
//! [`CacheStore`] is the single source of truth for which blocks and steps
//! have finished. Every mutation rewrites the whole state file atomically
//! before returning. Write failures are logged and swallowed: the in-memory
//! state stays authoritative for the running process.

use super::types::{
    BlockRecord, CacheState, CacheStatus, SkipDecision, StepLookup, StepRecord, StepStatus,
    WorkflowSummary,
};
use crate::config::StorageConfig;
use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEvent, EventBus};
use crate::hash::input_hash;
use crate::persist::{self, load_json, now_millis, write_json_atomic, LoadOutcome};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

struct StoreInner {
    state: CacheState,
    initialized: bool,
}

/// Persistent record of block and step execution
pub struct CacheStore {
    state_path: PathBuf,
    inner: Mutex<StoreInner>,
    events: Arc<EventBus>,
}

impl CacheStore {
    /// Store using the configured state file location
    pub fn new(config: &StorageConfig) -> Self {
        Self::at_path(config.state_path())
    }

    /// Store backed by an explicit state file
    pub fn at_path(state_path: impl Into<PathBuf>) -> Self {
        Self::with_events(state_path, Arc::new(EventBus::new()))
    }

    /// Store publishing on an existing event bus
    pub fn with_events(state_path: impl Into<PathBuf>, events: Arc<EventBus>) -> Self {
        Self {
            state_path: state_path.into(),
            inner: Mutex::new(StoreInner {
                state: CacheState::default(),
                initialized: false,
            }),
            events,
        }
    }

    /// Bus on which invalidation and clear events are published
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Load persisted state. Calling this more than once is a no-op.
    ///
    /// An unreachable state location is logged and the store runs from
    /// memory for the rest of the process.
    pub async fn initialize(&self) -> CacheResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.initialized {
            return Ok(());
        }
        self.load_into(&mut inner).await;
        info!(
            "Cache initialized: {} blocks found",
            inner.state.blocks.len()
        );
        Ok(())
    }

    async fn load_into(&self, inner: &mut StoreInner) {
        inner.initialized = true;
        inner.state = CacheState::default();

        if let Some(dir) = self.state_path.parent() {
            if let Err(e) = fs::create_dir_all(dir).await {
                warn!(
                    "{}; cache state will not survive a restart",
                    CacheError::directory(dir, e)
                );
                return;
            }
        }

        let stale = persist::remove_stale_temp_files(&self.state_path).await;
        if stale > 0 {
            debug!("Removed {} interrupted state writes", stale);
        }

        inner.state = match load_json::<CacheState>(&self.state_path).await {
            LoadOutcome::Loaded(state) => {
                debug!("Loaded cache state with {} blocks", state.blocks.len());
                state
            }
            LoadOutcome::Missing => {
                debug!("No existing cache found, starting fresh");
                CacheState::default()
            }
            LoadOutcome::Corrupted { .. } => {
                warn!("Unreadable cache state, starting fresh");
                CacheState::default()
            }
        };
    }

    /// Lock the state, loading it first if nobody has initialized the store
    async fn lock_loaded(&self) -> MutexGuard<'_, StoreInner> {
        let mut inner = self.inner.lock().await;
        if !inner.initialized {
            self.load_into(&mut inner).await;
        }
        inner
    }

    async fn save(&self, inner: &mut StoreInner) {
        inner.state.last_updated = now_millis();
        match write_json_atomic(&self.state_path, &inner.state).await {
            Ok(bytes) => debug!("Cache state saved ({} bytes)", bytes),
            Err(e) => error!(
                "Failed to save cache state to {}: {}",
                self.state_path.display(),
                e
            ),
        }
    }

    /// Decide whether a block can be skipped, resumed, or must start fresh.
    ///
    /// A changed input hash invalidates the block before anything else.
    pub async fn can_skip_block<T: Serialize + ?Sized>(
        &self,
        block_id: &str,
        inputs: &T,
    ) -> CacheResult<SkipDecision> {
        let hash = input_hash(inputs)?;
        debug!("Checking cache for block: {}", block_id);

        let decision = {
            let inner = self.lock_loaded().await;
            let Some(block) = inner.state.blocks.get(block_id) else {
                info!("No cache found for block: {}", block_id);
                return Ok(SkipDecision::fresh());
            };

            if block.input_hash.is_empty() {
                info!("No cache found for block: {}", block_id);
                return Ok(SkipDecision::fresh());
            }

            if block.input_hash != hash {
                None
            } else {
                Some(Self::decide(block))
            }
        };

        match decision {
            Some(decision) => Ok(decision),
            None => {
                info!("Input changed for block: {}, invalidating cache", block_id);
                self.invalidate_block(block_id).await;
                Ok(SkipDecision::fresh())
            }
        }
    }

    fn decide(block: &BlockRecord) -> SkipDecision {
        match (block.status, &block.outputs) {
            (CacheStatus::Completed, Some(outputs)) => {
                info!("Block {} found in cache, skipping", block.block_id);
                SkipDecision::skip(outputs.clone())
            }
            (CacheStatus::InProgress | CacheStatus::Failed, _) => {
                let completed = block.completed_step_ids();
                if completed.is_empty() && block.progress <= 0.0 {
                    return SkipDecision::fresh();
                }
                info!(
                    "Block {} can be resumed from {}% ({} steps completed)",
                    block.block_id,
                    block.progress,
                    completed.len()
                );
                SkipDecision::resume(block.resume_data.clone(), completed, block.progress)
            }
            _ => SkipDecision::fresh(),
        }
    }

    /// Mark a block in progress.
    ///
    /// A record with the same input hash keeps its steps, files and progress
    /// but drops the error, end time and outputs of its previous run;
    /// otherwise a fresh record replaces it.
    pub async fn start_block<T: Serialize + ?Sized>(
        &self,
        block_id: &str,
        inputs: &T,
        resume_data: Option<Value>,
    ) -> CacheResult<()> {
        let hash = input_hash(inputs)?;
        let mut inner = self.lock_loaded().await;

        match inner.state.blocks.get_mut(block_id) {
            Some(block) if block.input_hash == hash => {
                block.status = CacheStatus::InProgress;
                block.error = None;
                block.end_time = None;
                block.outputs = None;
                if resume_data.is_some() {
                    block.resume_data = resume_data;
                }
            }
            _ => {
                let record = BlockRecord::started(block_id, hash, now_millis(), resume_data);
                inner.state.blocks.insert(block_id.to_string(), record);
            }
        }

        self.save(&mut inner).await;
        info!("Started block {}", block_id);
        Ok(())
    }

    /// Look up a step's recorded result
    pub async fn is_step_completed(&self, block_id: &str, step_id: &str) -> StepLookup {
        let inner = self.lock_loaded().await;
        match inner
            .state
            .blocks
            .get(block_id)
            .and_then(|block| block.steps.get(step_id))
        {
            Some(step) if step.is_completed() => {
                debug!("Step {} found in cache, skipping", step_id);
                StepLookup::hit(step.data.clone())
            }
            _ => StepLookup::miss(),
        }
    }

    /// Look up a fingerprinted step.
    ///
    /// Completed steps of the live record always hit. Otherwise a step kept
    /// from an invalidated generation of the block hits when its fingerprint
    /// matches, and is moved back into the live record.
    pub async fn lookup_keyed_step(
        &self,
        block_id: &str,
        step_id: &str,
        step_hash: &str,
    ) -> StepLookup {
        let mut inner = self.lock_loaded().await;
        let StoreInner { state, .. } = &mut *inner;

        let Some(block) = state.blocks.get_mut(block_id) else {
            return StepLookup::miss();
        };

        if let Some(step) = block.steps.get(step_id) {
            if step.is_completed() {
                debug!("Step {} found in cache, skipping", step_id);
                return StepLookup::hit(step.data.clone());
            }
        }

        let matches = state
            .retained_steps
            .get(block_id)
            .and_then(|pool| pool.get(step_id))
            .is_some_and(|step| step.input_hash.as_deref() == Some(step_hash));
        if !matches {
            return StepLookup::miss();
        }

        let Some(step) = state
            .retained_steps
            .get_mut(block_id)
            .and_then(|pool| pool.remove(step_id))
        else {
            return StepLookup::miss();
        };
        if state
            .retained_steps
            .get(block_id)
            .is_some_and(|pool| pool.is_empty())
        {
            state.retained_steps.remove(block_id);
        }

        let data = step.data.clone();
        block.steps.insert(step_id.to_string(), step);
        info!("Step {} reused from a previous run of block {}", step_id, block_id);
        self.save(&mut inner).await;
        StepLookup::hit(data)
    }

    /// Record a successful step and merge its files into the block
    pub async fn complete_step(
        &self,
        block_id: &str,
        step_id: &str,
        data: Value,
        file_ids: Vec<String>,
    ) {
        self.complete_step_inner(block_id, step_id, data, file_ids, None)
            .await
    }

    /// Record a successful step together with the digest of its inputs
    pub async fn complete_keyed_step(
        &self,
        block_id: &str,
        step_id: &str,
        step_hash: &str,
        data: Value,
        file_ids: Vec<String>,
    ) {
        self.complete_step_inner(block_id, step_id, data, file_ids, Some(step_hash.to_string()))
            .await
    }

    async fn complete_step_inner(
        &self,
        block_id: &str,
        step_id: &str,
        data: Value,
        file_ids: Vec<String>,
        step_hash: Option<String>,
    ) {
        let mut inner = self.lock_loaded().await;
        let Some(block) = inner.state.blocks.get_mut(block_id) else {
            warn!("Cannot complete step {}: block {} not started", step_id, block_id);
            return;
        };

        for id in &file_ids {
            if !block.file_ids.contains(id) {
                block.file_ids.push(id.clone());
            }
        }
        let file_count = file_ids.len();
        block.steps.insert(
            step_id.to_string(),
            StepRecord {
                step_id: step_id.to_string(),
                status: StepStatus::Completed,
                data,
                timestamp: now_millis(),
                file_ids,
                input_hash: step_hash,
            },
        );

        self.save(&mut inner).await;
        info!("Step {} completed with {} files", step_id, file_count);
    }

    /// Record a failed step
    pub async fn fail_step(&self, block_id: &str, step_id: &str, error: &str) {
        let mut inner = self.lock_loaded().await;
        let Some(block) = inner.state.blocks.get_mut(block_id) else {
            warn!("Cannot fail step {}: block {} not started", step_id, block_id);
            return;
        };

        block.steps.insert(
            step_id.to_string(),
            StepRecord {
                step_id: step_id.to_string(),
                status: StepStatus::Failed,
                data: json!({ "error": error }),
                timestamp: now_millis(),
                file_ids: Vec::new(),
                input_hash: None,
            },
        );

        self.save(&mut inner).await;
        warn!("Step {} failed: {}", step_id, error);
    }

    /// Update progress (clamped to 0-100) and optionally the resume snapshot.
    ///
    /// A not-started or failed block moves to in-progress; a completed block
    /// keeps its status.
    pub async fn update_block_progress(
        &self,
        block_id: &str,
        progress: f64,
        resume_data: Option<Value>,
    ) {
        let mut inner = self.lock_loaded().await;
        let Some(block) = inner.state.blocks.get_mut(block_id) else {
            warn!("Cannot update progress: block {} not started", block_id);
            return;
        };

        block.progress = clamp_progress(progress);
        if matches!(block.status, CacheStatus::NotStarted | CacheStatus::Failed) {
            block.status = CacheStatus::InProgress;
            block.error = None;
            block.end_time = None;
        }
        if resume_data.is_some() {
            block.resume_data = resume_data;
        }

        self.save(&mut inner).await;
    }

    /// Mark a block completed with its outputs
    pub async fn complete_block(&self, block_id: &str, outputs: Value) {
        let mut inner = self.lock_loaded().await;
        let Some(block) = inner.state.blocks.get_mut(block_id) else {
            warn!("Cannot complete block {}: not started", block_id);
            return;
        };

        block.status = CacheStatus::Completed;
        block.progress = 100.0;
        block.end_time = Some(now_millis());
        block.outputs = Some(outputs);
        block.error = None;
        block.resume_data = None;
        block.file_ids = block.all_file_ids();
        let file_count = block.file_ids.len();

        inner.state.retained_steps.remove(block_id);
        self.save(&mut inner).await;
        info!("Block {} completed with {} total files", block_id, file_count);
    }

    /// Mark a block failed, keeping its steps and resume snapshot
    pub async fn fail_block(&self, block_id: &str, error: &str) {
        let mut inner = self.lock_loaded().await;
        let Some(block) = inner.state.blocks.get_mut(block_id) else {
            warn!("Cannot fail block {}: not started", block_id);
            return;
        };

        block.status = CacheStatus::Failed;
        block.error = Some(error.to_string());
        block.end_time = Some(now_millis());

        self.save(&mut inner).await;
        warn!("Block {} failed: {}", block_id, error);
    }

    /// Discard a block's record and announce its files for cleanup.
    ///
    /// Completed, fingerprinted steps that own no files are kept aside so a
    /// later run with matching step inputs can reuse them. Returns the file
    /// ids carried by the event.
    pub async fn invalidate_block(&self, block_id: &str) -> Vec<String> {
        let file_ids = {
            let inner = self.lock_loaded().await;
            match inner.state.blocks.get(block_id) {
                Some(block) => block.all_file_ids(),
                None => return Vec::new(),
            }
        };

        info!(
            "Cleaning up {} files for block {}",
            file_ids.len(),
            block_id
        );
        self.events
            .emit(&CacheEvent::BlockInvalidated {
                block_id: block_id.to_string(),
                file_ids: file_ids.clone(),
            })
            .await;

        let mut inner = self.lock_loaded().await;
        if let Some(block) = inner.state.blocks.remove(block_id) {
            let reusable: Vec<(String, StepRecord)> = block
                .steps
                .into_iter()
                .filter(|(_, step)| {
                    step.is_completed() && step.input_hash.is_some() && step.file_ids.is_empty()
                })
                .collect();
            if !reusable.is_empty() {
                debug!(
                    "Keeping {} fingerprinted steps of block {}",
                    reusable.len(),
                    block_id
                );
                inner
                    .state
                    .retained_steps
                    .entry(block_id.to_string())
                    .or_default()
                    .extend(reusable);
            }
            self.save(&mut inner).await;
            info!("Invalidated cache for block {}", block_id);
        }
        file_ids
    }

    /// Wipe every record and announce every known file for cleanup.
    ///
    /// Returns the file ids carried by the event.
    pub async fn clear_cache(&self) -> Vec<String> {
        let file_ids: Vec<String> = {
            let inner = self.lock_loaded().await;
            let mut block_ids: Vec<&String> = inner.state.blocks.keys().collect();
            block_ids.sort();
            let mut ids = Vec::new();
            for block_id in block_ids {
                for id in inner.state.blocks[block_id].all_file_ids() {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
            ids
        };

        info!("Publishing cache clear event: {} files", file_ids.len());
        self.events
            .emit(&CacheEvent::CacheCleared {
                file_ids: file_ids.clone(),
            })
            .await;

        let mut inner = self.lock_loaded().await;
        inner.state.blocks.clear();
        inner.state.retained_steps.clear();
        self.save(&mut inner).await;
        info!("Cache cleared");
        file_ids
    }

    /// Snapshot of one block record
    pub async fn block(&self, block_id: &str) -> Option<BlockRecord> {
        self.lock_loaded().await.state.blocks.get(block_id).cloned()
    }

    /// Ids of every recorded block, sorted
    pub async fn block_ids(&self) -> Vec<String> {
        let inner = self.lock_loaded().await;
        let mut ids: Vec<String> = inner.state.blocks.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Counts by status and mean progress across all blocks
    pub async fn workflow_summary(&self) -> WorkflowSummary {
        let inner = self.lock_loaded().await;
        let blocks: Vec<&BlockRecord> = inner.state.blocks.values().collect();
        let count = |status: CacheStatus| blocks.iter().filter(|b| b.status == status).count();

        let overall_progress = if blocks.is_empty() {
            0
        } else {
            let total: f64 = blocks.iter().map(|b| b.progress).sum();
            (total / blocks.len() as f64).round() as u32
        };

        WorkflowSummary {
            total_blocks: blocks.len(),
            completed_blocks: count(CacheStatus::Completed),
            failed_blocks: count(CacheStatus::Failed),
            in_progress_blocks: count(CacheStatus::InProgress),
            overall_progress,
        }
    }
}

fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 100.0)
    }
}
