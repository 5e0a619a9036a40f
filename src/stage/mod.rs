//! Resumable per-item stage loop
//!
//! Generator stages all share one shape: walk a list of items in order,
//! produce one output per item, and save progress after each. [`run_items`]
//! implements that loop on top of the step cache so an interrupted stage
//! picks up after the last finished item.

use crate::cache::{BlockContext, StepOutput};
use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Produces the output for one item of a stage
#[async_trait]
pub trait ItemWorker: Send + Sync {
    type Item: Serialize + Send + Sync;
    type Output: Serialize + DeserializeOwned + Send + Sync;

    /// Stable business id of the item; part of its step id
    fn item_id(&self, item: &Self::Item) -> String;

    /// Process one item. `previous` holds the outputs of every earlier item.
    async fn process(
        &self,
        item: &Self::Item,
        index: usize,
        previous: &[Self::Output],
    ) -> Result<StepOutput<Self::Output>>;
}

/// Resume snapshot saved after every item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemProgress<T> {
    pub completed_count: usize,
    pub items: Vec<T>,
}

impl<T> Default for ItemProgress<T> {
    fn default() -> Self {
        Self {
            completed_count: 0,
            items: Vec::new(),
        }
    }
}

impl<T> ItemProgress<T> {
    /// Whether this snapshot can fast-forward a list of `total` items
    pub fn is_consistent(&self, total: usize) -> bool {
        self.completed_count <= total && self.items.len() == self.completed_count
    }
}

fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}

/// Whether every item a snapshot claims is done has a completed step record
fn steps_recorded<W>(context: &BlockContext, prefix: &str, worker: &W, done: &[W::Item]) -> bool
where
    W: ItemWorker + ?Sized,
{
    let completed = context.completed_steps();
    done.iter().all(|item| {
        let step_id = format!("{}-{}", prefix, worker.item_id(item));
        completed.contains(&step_id)
    })
}

/// Run `worker` over `items`, one keyed step `"{prefix}-{item_id}"` per item.
///
/// Items covered by a consistent resume snapshot are not revisited. On
/// failure the snapshot of finished items is saved and the worker's error is
/// returned unchanged.
pub async fn run_items<W>(
    context: &BlockContext,
    prefix: &str,
    worker: &W,
    items: &[W::Item],
) -> Result<Vec<W::Output>>
where
    W: ItemWorker + ?Sized,
{
    let total = items.len();
    let mut progress = match context.resume_data::<ItemProgress<W::Output>>() {
        Some(snapshot)
            if snapshot.is_consistent(total)
                && steps_recorded(context, prefix, worker, &items[..snapshot.completed_count]) =>
        {
            snapshot
        }
        Some(_) => {
            debug!(
                "Resume snapshot of block {} does not fit {} items, using step records",
                context.block_id(),
                total
            );
            ItemProgress::default()
        }
        None => ItemProgress::default(),
    };

    if progress.completed_count > 0 {
        context.log(&format!(
            "Resumed with {} of {} items already done",
            progress.completed_count, total
        ));
    }

    let steps = context.step_cache();
    for (index, item) in items.iter().enumerate().skip(progress.completed_count) {
        let step_id = format!("{}-{}", prefix, worker.item_id(item));
        let outcome = steps
            .execute_keyed_step(&step_id, item, || {
                worker.process(item, index, &progress.items)
            })
            .await;

        match outcome {
            Ok(output) => {
                progress.items.push(output);
                progress.completed_count = index + 1;
                context
                    .save_resume(percent(progress.completed_count, total), &progress)
                    .await;
            }
            Err(e) => {
                context
                    .save_resume(percent(progress.completed_count, total), &progress)
                    .await;
                return Err(e);
            }
        }
    }

    Ok(progress.items)
}
