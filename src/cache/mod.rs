//! Resumable block and step cache
//!
//! Blocks are pipeline stages keyed by id and by a digest of their inputs.
//! Steps are idempotent units of work inside a block. The store records both
//! durably so an interrupted pipeline can be re-run without repeating
//! finished work.

pub mod block;
pub mod step;
pub mod store;
#[cfg(test)]
mod store_tests;
pub mod types;

pub use block::{run_block, with_cache, Block, BlockContext};
pub use step::{StepCache, StepOutput};
pub use store::CacheStore;
pub use types::{
    BlockRecord, CacheState, CacheStatus, SkipDecision, StepLookup, StepRecord, StepStatus,
    WorkflowSummary,
};
