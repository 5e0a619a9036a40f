//! Artifact file lifecycle tracking

pub mod artifact;
pub mod tracker;
pub mod types;

pub use artifact::{ArtifactKind, ArtifactName};
pub use tracker::FileTracker;
pub use types::{CleanupReport, FileStatistics, FileStatus, FileType, ManagedFile};
