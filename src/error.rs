//! Error types for the cache and file lifecycle layers

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for cache and file operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised by the cache core itself.
///
/// Failures of step or stage bodies never pass through this type: they are
/// host errors and are forwarded unchanged as `anyhow::Error`.
#[derive(Error, Debug)]
pub enum CacheError {
    /// I/O operation on a specific path failed
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A directory could not be created
    #[error("Failed to create directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// File id is not tracked
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// File has neither a temp path nor a usable final path
    #[error("File not found or no temp path: {0}")]
    NoTempPath(String),

    /// Moving a file to its final location failed
    #[error("Failed to move file {file_id}: {reason}")]
    Move { file_id: String, reason: String },
}

impl CacheError {
    /// Create an I/O error bound to a path
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a directory creation error
    pub fn directory(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Directory {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization<E: fmt::Display>(err: E) -> Self {
        Self::Serialization(err.to_string())
    }

    /// Create a move error
    pub fn move_failed<E: fmt::Display>(file_id: impl Into<String>, reason: E) -> Self {
        Self::Move {
            file_id: file_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this is a missing-file error
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::FileNotFound(_) | Self::NoTempPath(_) => true,
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
