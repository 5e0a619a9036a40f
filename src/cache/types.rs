//! Persisted cache records and query results

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Execution status of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

/// Status of a finished step. Steps are only recorded once they finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// One idempotent unit of work inside a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_id: String,
    pub status: StepStatus,
    /// Step result on success, `{"error": message}` on failure
    #[serde(default)]
    pub data: Value,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
    /// Digest of the step's own inputs, when the step was keyed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,
}

impl StepRecord {
    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// One named pipeline stage for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    pub block_id: String,
    #[serde(default)]
    pub input_hash: String,
    pub status: CacheStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub steps: HashMap<String, StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
}

impl BlockRecord {
    /// Fresh in-progress record with no step history
    pub fn started(block_id: &str, input_hash: String, now: i64, resume_data: Option<Value>) -> Self {
        Self {
            block_id: block_id.to_string(),
            input_hash,
            status: CacheStatus::InProgress,
            progress: 0.0,
            start_time: Some(now),
            end_time: None,
            outputs: None,
            error: None,
            steps: HashMap::new(),
            resume_data,
            file_ids: Vec::new(),
        }
    }

    /// Ids of completed steps, sorted for stable output
    pub fn completed_step_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .steps
            .values()
            .filter(|step| step.is_completed())
            .map(|step| step.step_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Deduplicated union of block-level and step-level file ids.
    ///
    /// Block-level ids keep their order; step ids not already present follow
    /// in step-id order.
    pub fn all_file_ids(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut ids = Vec::new();
        for id in &self.file_ids {
            if seen.insert(id.clone()) {
                ids.push(id.clone());
            }
        }

        let mut step_ids: Vec<&String> = self.steps.keys().collect();
        step_ids.sort();
        for step_id in step_ids {
            for id in &self.steps[step_id].file_ids {
                if seen.insert(id.clone()) {
                    ids.push(id.clone());
                }
            }
        }
        ids
    }
}

/// Whole persisted document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheState {
    #[serde(default)]
    pub blocks: HashMap<String, BlockRecord>,
    /// Fingerprinted steps salvaged from invalidated blocks, keyed by block id
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub retained_steps: HashMap<String, HashMap<String, StepRecord>>,
    #[serde(default)]
    pub last_updated: i64,
}

/// Result of the skip/resume decision for a block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkipDecision {
    pub can_skip: bool,
    pub outputs: Option<Value>,
    pub should_resume: bool,
    pub resume_data: Option<Value>,
    pub completed_steps: Vec<String>,
    pub progress: Option<f64>,
}

impl SkipDecision {
    /// Run the block from scratch
    pub fn fresh() -> Self {
        Self::default()
    }

    /// Reuse cached outputs
    pub fn skip(outputs: Value) -> Self {
        Self {
            can_skip: true,
            outputs: Some(outputs),
            progress: Some(100.0),
            ..Self::default()
        }
    }

    /// Re-run, fast-forwarding over recorded work
    pub fn resume(resume_data: Option<Value>, completed_steps: Vec<String>, progress: f64) -> Self {
        Self {
            can_skip: false,
            outputs: None,
            should_resume: true,
            resume_data,
            completed_steps,
            progress: Some(progress),
        }
    }
}

/// Result of a step lookup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepLookup {
    pub completed: bool,
    pub data: Option<Value>,
}

impl StepLookup {
    pub fn miss() -> Self {
        Self::default()
    }

    pub fn hit(data: Value) -> Self {
        Self {
            completed: true,
            data: Some(data),
        }
    }
}

/// Overview of every block in the store
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub total_blocks: usize,
    pub completed_blocks: usize,
    pub failed_blocks: usize,
    pub in_progress_blocks: usize,
    /// Mean block progress, rounded to the nearest integer
    pub overall_progress: u32,
}
