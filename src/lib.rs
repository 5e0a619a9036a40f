//! # Mediaflow
//!
//! Resumable step cache and artifact lifecycle tracking for multi-stage media
//! generation pipelines.
//!
//! Each pipeline stage runs as a *block* keyed by its id and a digest of its
//! inputs. Work inside a block is split into *steps* whose results are stored
//! durably, so a pipeline that failed halfway can be re-run without paying
//! again for finished work. Files produced along the way are tracked from
//! their temp location to their final one, and deleted when the block that
//! produced them is invalidated.
//!
//! ## Modules
//!
//! - `cache` - Block and step records, the skip/resume decision, step execution
//! - `files` - Artifact registry with temp/final paths and cleanup
//! - `events` - Publish/subscribe bus linking cache invalidation to file cleanup
//! - `hash` - Canonical input hashing
//! - `stage` - Resumable per-item loop shared by generator stages
//! - `pipeline` - Per-run context wiring store, tracker and reporter together
//! - `config` - Storage layout
//! - `persist` - Atomic JSON state files
//! - `report` - Host log and progress sinks
//! - `logging` - `tracing` subscriber setup
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod files;
pub mod hash;
pub mod logging;
pub mod persist;
pub mod pipeline;
pub mod report;
pub mod stage;

pub use cache::{
    run_block, with_cache, Block, BlockContext, CacheStore, SkipDecision, StepCache, StepOutput,
};
pub use config::StorageConfig;
pub use error::{CacheError, CacheResult};
pub use events::{CacheEvent, EventBus, EventKind, EventListener};
pub use files::{ArtifactName, FileStatus, FileTracker, FileType, ManagedFile};
pub use pipeline::Pipeline;
pub use report::{LogStream, Reporter};
pub use stage::{run_items, ItemProgress, ItemWorker};
