//! Block-level skip, resume and failure handling
//!
//! [`with_cache`] wraps a stage body: it returns cached outputs when the
//! block's inputs are unchanged and it already completed, otherwise it runs the
//! body with a [`BlockContext`] and records the outcome.

use super::step::StepCache;
use super::store::CacheStore;
use super::types::SkipDecision;
use crate::report::{LogStream, Reporter};
use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Everything a running stage body needs from the cache layer
#[derive(Clone)]
pub struct BlockContext {
    store: Arc<CacheStore>,
    block_id: String,
    reporter: Arc<dyn Reporter>,
    decision: SkipDecision,
}

impl BlockContext {
    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    /// Step executor for this block
    pub fn step_cache(&self) -> StepCache {
        StepCache::new(Arc::clone(&self.store), self.block_id.clone())
    }

    /// Whether the block is continuing an earlier attempt
    pub fn is_resuming(&self) -> bool {
        self.decision.should_resume
    }

    /// Step ids completed by earlier attempts
    pub fn completed_steps(&self) -> &[String] {
        &self.decision.completed_steps
    }

    /// Progress reached by earlier attempts
    pub fn starting_progress(&self) -> f64 {
        self.decision.progress.unwrap_or(0.0)
    }

    /// Resume snapshot decoded into the stage's own type.
    ///
    /// A snapshot that does not decode is ignored; the stage then relies on
    /// its step records alone.
    pub fn resume_data<R: DeserializeOwned>(&self) -> Option<R> {
        let raw = self.decision.resume_data.clone()?;
        match serde_json::from_value(raw) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(
                    "Ignoring unreadable resume data for block {}: {}",
                    self.block_id, e
                );
                None
            }
        }
    }

    /// Record progress and optionally a new resume snapshot, and notify the host
    pub async fn update_progress(&self, progress: f64, resume_data: Option<Value>) {
        self.store
            .update_block_progress(&self.block_id, progress, resume_data)
            .await;
        self.reporter.progress(progress);
    }

    /// Record progress together with a typed resume snapshot
    pub async fn save_resume<R: Serialize>(&self, progress: f64, resume: &R) {
        let snapshot = match serde_json::to_value(resume) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Resume data for block {} cannot be saved: {}", self.block_id, e);
                None
            }
        };
        self.update_progress(progress, snapshot).await;
    }

    pub fn log(&self, message: &str) {
        self.reporter.log(message, LogStream::Stdout);
    }
}

/// Run a stage body under the block cache.
///
/// Errors from the body are recorded on the block and returned unchanged.
pub async fn with_cache<I, O, F, Fut>(
    store: &Arc<CacheStore>,
    reporter: Arc<dyn Reporter>,
    block_id: &str,
    inputs: &I,
    body: F,
) -> Result<O>
where
    I: Serialize + ?Sized,
    O: Serialize + DeserializeOwned,
    F: FnOnce(BlockContext) -> Fut,
    Fut: Future<Output = Result<O>>,
{
    store.initialize().await?;

    let decision = store.can_skip_block(block_id, inputs).await?;
    if decision.can_skip {
        if let Some(outputs) = decision.outputs.clone() {
            match serde_json::from_value::<O>(outputs) {
                Ok(outputs) => {
                    reporter.log(
                        &format!("Block {} loaded from cache", block_id),
                        LogStream::Stdout,
                    );
                    reporter.progress(100.0);
                    return Ok(outputs);
                }
                Err(e) => warn!(
                    "Cached outputs of block {} no longer match their type, re-running: {}",
                    block_id, e
                ),
            }
        }
    }

    if decision.should_resume {
        reporter.log(
            &format!(
                "Resuming block {} from {}% ({} steps done)",
                block_id,
                decision.progress.unwrap_or(0.0),
                decision.completed_steps.len()
            ),
            LogStream::Stdout,
        );
    }

    store
        .start_block(block_id, inputs, decision.resume_data.clone())
        .await?;

    let context = BlockContext {
        store: Arc::clone(store),
        block_id: block_id.to_string(),
        reporter: Arc::clone(&reporter),
        decision,
    };

    match body(context).await {
        Ok(outputs) => {
            let recorded = serde_json::to_value(&outputs).unwrap_or_else(|e| {
                warn!("Outputs of block {} cannot be cached: {}", block_id, e);
                Value::Null
            });
            store.complete_block(block_id, recorded).await;
            reporter.progress(100.0);
            Ok(outputs)
        }
        Err(e) => {
            let message = format!("{e:#}");
            store.fail_block(block_id, &message).await;
            reporter.log(
                &format!("Block {} failed: {}", block_id, message),
                LogStream::Stderr,
            );
            Err(e)
        }
    }
}

/// A pipeline stage with typed inputs, outputs and resume snapshot
#[async_trait]
pub trait Block: Send + Sync {
    type Inputs: Serialize + Send + Sync;
    type Outputs: Serialize + DeserializeOwned + Send;
    type Resume: DeserializeOwned + Send;

    /// Stable block id used as the cache key
    fn id(&self) -> &str;

    async fn execute(
        &self,
        inputs: &Self::Inputs,
        resume: Option<Self::Resume>,
        context: BlockContext,
    ) -> Result<Self::Outputs>;
}

/// Run a [`Block`] under the block cache
pub async fn run_block<B>(
    block: &B,
    store: &Arc<CacheStore>,
    reporter: Arc<dyn Reporter>,
    inputs: &B::Inputs,
) -> Result<B::Outputs>
where
    B: Block + ?Sized,
{
    with_cache(store, reporter, block.id(), inputs, |context| async move {
        let resume = context.resume_data::<B::Resume>();
        block.execute(inputs, resume, context).await
    })
    .await
}
