//! Cache-aware execution of individual steps
//!
//! A step runs at most once per block record: a completed step's stored
//! result is returned on every later call without invoking the body.

use super::store::CacheStore;
use super::types::StepLookup;
use crate::hash::input_hash;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a step body that produced managed files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput<T> {
    pub result: T,
    #[serde(default)]
    pub file_ids: Vec<String>,
}

impl<T> StepOutput<T> {
    pub fn new(result: T, file_ids: Vec<String>) -> Self {
        Self { result, file_ids }
    }

    /// Output that owns no files
    pub fn plain(result: T) -> Self {
        Self::new(result, Vec::new())
    }
}

/// Step executor bound to one block
#[derive(Clone)]
pub struct StepCache {
    store: Arc<CacheStore>,
    block_id: String,
}

impl StepCache {
    pub fn new(store: Arc<CacheStore>, block_id: impl Into<String>) -> Self {
        Self {
            store,
            block_id: block_id.into(),
        }
    }

    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    /// Run `step` unless `step_id` already completed in this block
    pub async fn execute_step<T, F, Fut>(&self, step_id: &str, step: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lookup = self.store.is_step_completed(&self.block_id, step_id).await;
        if let Some(cached) = decode_hit::<T>(step_id, lookup) {
            return Ok(cached);
        }

        debug!("Executing step {} of block {}", step_id, self.block_id);
        match step().await {
            Ok(result) => {
                if let Some(data) = encode_result(step_id, &result) {
                    self.store
                        .complete_step(&self.block_id, step_id, data, Vec::new())
                        .await;
                }
                Ok(result)
            }
            Err(e) => {
                self.store
                    .fail_step(&self.block_id, step_id, &format!("{e:#}"))
                    .await;
                Err(e)
            }
        }
    }

    /// Run a step that produces managed files.
    ///
    /// The result and file ids are stored together as `{result, fileIds}`; a
    /// cached hit returns only the result.
    pub async fn execute_step_with_files<T, F, Fut>(&self, step_id: &str, step: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StepOutput<T>>>,
    {
        let lookup = self.store.is_step_completed(&self.block_id, step_id).await;
        if let Some(cached) = decode_hit::<StepOutput<T>>(step_id, lookup) {
            return Ok(cached.result);
        }

        debug!("Executing step {} of block {}", step_id, self.block_id);
        match step().await {
            Ok(output) => {
                if let Some(data) = encode_result(step_id, &output) {
                    self.store
                        .complete_step(&self.block_id, step_id, data, output.file_ids.clone())
                        .await;
                }
                Ok(output.result)
            }
            Err(e) => {
                self.store
                    .fail_step(&self.block_id, step_id, &format!("{e:#}"))
                    .await;
                Err(e)
            }
        }
    }

    /// Run a step fingerprinted by its own inputs.
    ///
    /// Besides the usual per-record skip, a step whose id and input digest
    /// match one kept from an invalidated run of this block is reused.
    pub async fn execute_keyed_step<I, T, F, Fut>(
        &self,
        step_id: &str,
        step_inputs: &I,
        step: F,
    ) -> Result<T>
    where
        I: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StepOutput<T>>>,
    {
        let step_hash = input_hash(step_inputs)?;
        let lookup = self
            .store
            .lookup_keyed_step(&self.block_id, step_id, &step_hash)
            .await;
        if let Some(cached) = decode_hit::<StepOutput<T>>(step_id, lookup) {
            return Ok(cached.result);
        }

        debug!("Executing step {} of block {}", step_id, self.block_id);
        match step().await {
            Ok(output) => {
                if let Some(data) = encode_result(step_id, &output) {
                    self.store
                        .complete_keyed_step(
                            &self.block_id,
                            step_id,
                            &step_hash,
                            data,
                            output.file_ids.clone(),
                        )
                        .await;
                }
                Ok(output.result)
            }
            Err(e) => {
                self.store
                    .fail_step(&self.block_id, step_id, &format!("{e:#}"))
                    .await;
                Err(e)
            }
        }
    }
}

fn decode_hit<T: DeserializeOwned>(step_id: &str, lookup: StepLookup) -> Option<T> {
    if !lookup.completed {
        return None;
    }
    let data = lookup.data.unwrap_or(Value::Null);
    match serde_json::from_value(data) {
        Ok(value) => {
            debug!("Step {} loaded from cache", step_id);
            Some(value)
        }
        Err(e) => {
            warn!(
                "Cached result of step {} no longer matches its type, re-running: {}",
                step_id, e
            );
            None
        }
    }
}

fn encode_result<T: Serialize>(step_id: &str, result: &T) -> Option<Value> {
    match serde_json::to_value(result) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Result of step {} cannot be cached: {}", step_id, e);
            None
        }
    }
}
