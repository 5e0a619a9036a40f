//! Naming conventions for pipeline artifacts

use super::tracker::FileTracker;
use super::types::{FileType, ManagedFile};
use crate::error::CacheResult;
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};

/// What an artifact is, which decides its prefix and id metadata key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Audio,
    Image,
    Subtitle,
    /// Intermediate video segment
    TempVideo,
    Video,
}

impl ArtifactKind {
    fn prefix(&self) -> &'static str {
        match self {
            ArtifactKind::Audio => "audio",
            ArtifactKind::Image => "image",
            ArtifactKind::Subtitle => "subtitle",
            ArtifactKind::TempVideo => "temp_video",
            ArtifactKind::Video => "video",
        }
    }

    fn id_key(&self) -> &'static str {
        match self {
            ArtifactKind::Audio | ArtifactKind::Subtitle => "textId",
            ArtifactKind::Image => "promptId",
            ArtifactKind::TempVideo | ArtifactKind::Video => "segmentId",
        }
    }

    pub fn file_type(&self) -> FileType {
        match self {
            ArtifactKind::Audio => FileType::Audio,
            ArtifactKind::Image => FileType::Image,
            ArtifactKind::Subtitle => FileType::Subtitle,
            ArtifactKind::TempVideo | ArtifactKind::Video => FileType::Video,
        }
    }
}

/// Filename of an artifact derived from the business id it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    kind: ArtifactKind,
    id: String,
    format: String,
}

impl ArtifactName {
    pub fn new(kind: ArtifactKind, id: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            format: format.into(),
        }
    }

    pub fn audio(text_id: impl Into<String>, format: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Audio, text_id, format)
    }

    pub fn image(prompt_id: impl Into<String>, format: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Image, prompt_id, format)
    }

    pub fn subtitle(text_id: impl Into<String>, format: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Subtitle, text_id, format)
    }

    pub fn temp_video(segment_id: impl Into<String>, format: impl Into<String>) -> Self {
        Self::new(ArtifactKind::TempVideo, segment_id, format)
    }

    pub fn video(segment_id: impl Into<String>, format: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Video, segment_id, format)
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn file_type(&self) -> FileType {
        self.kind.file_type()
    }

    /// `{prefix}_{id}.{format}`
    pub fn filename(&self) -> String {
        format!("{}_{}.{}", self.kind.prefix(), self.id, self.format)
    }

    /// Metadata recorded with the file: the business id, plus the video stage
    pub fn metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert(self.kind.id_key().to_string(), Value::String(self.id.clone()));
        match self.kind {
            ArtifactKind::TempVideo => {
                metadata.insert("stage".to_string(), Value::from("temp"));
            }
            ArtifactKind::Video => {
                metadata.insert("stage".to_string(), Value::from("final"));
            }
            _ => {}
        }
        metadata
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filename())
    }
}

impl FileTracker {
    /// Register an artifact; `extra` is merged over the naming metadata
    pub async fn create_artifact(
        &self,
        name: &ArtifactName,
        extra: Map<String, Value>,
    ) -> CacheResult<ManagedFile> {
        let mut metadata = name.metadata();
        metadata.extend(extra);
        self.create_temp_file(name.file_type(), &name.filename(), metadata)
            .await
    }

    /// Move an artifact into `output_dir` under its conventional name
    pub async fn finalize_artifact(
        &self,
        file_id: &str,
        output_dir: impl AsRef<Path>,
        name: &ArtifactName,
    ) -> CacheResult<PathBuf> {
        let final_path = FileTracker::final_path(output_dir, &name.filename());
        self.move_to_final(file_id, &final_path).await?;
        Ok(final_path)
    }
}
