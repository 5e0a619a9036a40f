//! Per-run pipeline context
//!
//! One [`Pipeline`] owns the cache store and the file tracker of a run and is
//! passed explicitly to whatever executes the stages. Several pipelines with
//! different storage roots can coexist in one process.

use crate::cache::{run_block, with_cache, Block, BlockContext, CacheStore, WorkflowSummary};
use crate::config::StorageConfig;
use crate::error::CacheResult;
use crate::files::FileTracker;
use crate::report::{default_reporter, Reporter};
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Cache store, file tracker and reporter shared by every stage of a run
pub struct Pipeline {
    config: StorageConfig,
    store: Arc<CacheStore>,
    files: Arc<FileTracker>,
    reporter: Arc<dyn Reporter>,
}

impl Pipeline {
    /// Open storage under `config`, reporting through `tracing`
    pub async fn open(config: StorageConfig) -> CacheResult<Self> {
        Self::with_reporter(config, default_reporter()).await
    }

    /// Open storage under `config` with a host-supplied reporter
    pub async fn with_reporter(
        config: StorageConfig,
        reporter: Arc<dyn Reporter>,
    ) -> CacheResult<Self> {
        let store = Arc::new(CacheStore::new(&config));
        store.initialize().await?;

        let files = Arc::new(FileTracker::new(&config));
        files.initialize().await?;
        files.attach(store.events());

        info!("Pipeline storage opened at {}", config.root.display());
        Ok(Self {
            config,
            store,
            files,
            reporter,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn files(&self) -> &Arc<FileTracker> {
        &self.files
    }

    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    /// Run a typed block
    pub async fn run<B>(&self, block: &B, inputs: &B::Inputs) -> Result<B::Outputs>
    where
        B: Block + ?Sized,
    {
        run_block(block, &self.store, Arc::clone(&self.reporter), inputs).await
    }

    /// Run a closure as block `block_id`
    pub async fn run_with<I, O, F, Fut>(&self, block_id: &str, inputs: &I, body: F) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: Serialize + DeserializeOwned,
        F: FnOnce(BlockContext) -> Fut,
        Fut: Future<Output = Result<O>>,
    {
        with_cache(&self.store, Arc::clone(&self.reporter), block_id, inputs, body).await
    }

    /// Drop every cached record; the tracker deletes the files they held
    pub async fn clear_cache(&self) -> Vec<String> {
        self.store.clear_cache().await
    }

    pub async fn summary(&self) -> WorkflowSummary {
        self.store.workflow_summary().await
    }

    /// Detach the tracker from the store and flush its index
    pub async fn shutdown(&self) {
        self.files.destroy().await;
        info!("Pipeline shut down");
    }
}
