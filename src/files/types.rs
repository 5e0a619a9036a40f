//! Managed file records and statistics

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Kind of artifact; each kind gets its own temp subdirectory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Audio,
    Image,
    Video,
    Subtitle,
    Temp,
}

impl FileType {
    pub const ALL: [FileType; 5] = [
        FileType::Audio,
        FileType::Image,
        FileType::Video,
        FileType::Subtitle,
        FileType::Temp,
    ];

    /// Directory and id prefix for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Audio => "audio",
            FileType::Image => "image",
            FileType::Video => "video",
            FileType::Subtitle => "subtitle",
            FileType::Temp => "temp",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a managed file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Creating,
    Processing,
    Completed,
    Failed,
    Cleaning,
}

impl FileStatus {
    pub const ALL: [FileStatus; 5] = [
        FileStatus::Creating,
        FileStatus::Processing,
        FileStatus::Completed,
        FileStatus::Failed,
        FileStatus::Cleaning,
    ];
}

/// One tracked artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedFile {
    pub id: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub status: FileStatus,
    /// Working location, cleared once the file is finalized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_path: Option<PathBuf>,
    /// Epoch milliseconds
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ManagedFile {
    /// Still in its working location and not yet durable output
    pub fn is_in_flight(&self) -> bool {
        self.temp_path.is_some() && self.final_path.is_none()
    }
}

/// Persisted tracker document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTrackerState {
    #[serde(default)]
    pub files: BTreeMap<String, ManagedFile>,
    #[serde(default)]
    pub last_updated: i64,
}

/// Counts of tracked files
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatistics {
    pub total_files: usize,
    pub by_type: BTreeMap<FileType, usize>,
    pub by_status: BTreeMap<FileStatus, usize>,
    /// Files that still have a temp path
    pub temp_files: usize,
    pub completed_files: usize,
}

impl FileStatistics {
    /// Statistics with every type and status present at zero
    pub fn empty() -> Self {
        Self {
            total_files: 0,
            by_type: FileType::ALL.iter().map(|t| (*t, 0)).collect(),
            by_status: FileStatus::ALL.iter().map(|s| (*s, 0)).collect(),
            temp_files: 0,
            completed_files: 0,
        }
    }

    pub fn of<'a>(files: impl IntoIterator<Item = &'a ManagedFile>) -> Self {
        let mut stats = Self::empty();
        for file in files {
            stats.total_files += 1;
            *stats.by_type.entry(file.file_type).or_default() += 1;
            *stats.by_status.entry(file.status).or_default() += 1;
            if file.temp_path.is_some() {
                stats.temp_files += 1;
            }
            if file.status == FileStatus::Completed {
                stats.completed_files += 1;
            }
        }
        stats
    }
}

/// Outcome of a cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub cleaned: Vec<String>,
    pub failed: Vec<String>,
}
