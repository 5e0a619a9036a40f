//! Shared fixtures: a fake text-to-speech stage built on the public API

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use mediaflow::cache::{BlockContext, StepOutput};
use mediaflow::files::{ArtifactName, FileTracker};
use mediaflow::stage::{run_items, ItemWorker};
use mediaflow::Block;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextItem {
    pub id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInputs {
    pub texts: Vec<TextItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

impl AudioInputs {
    pub fn new(texts: &[(&str, &str)], output_dir: Option<PathBuf>) -> Self {
        Self {
            texts: texts
                .iter()
                .map(|(id, content)| TextItem {
                    id: id.to_string(),
                    content: content.to_string(),
                })
                .collect(),
            output_dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioAsset {
    pub text_id: String,
    pub path: PathBuf,
    pub start_time: f64,
    pub end_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioOutputs {
    pub audio_assets: Vec<AudioAsset>,
}

/// Fake synthesizer recording which texts it was asked to render
#[derive(Default)]
pub struct Synthesizer {
    pub calls: Mutex<Vec<String>>,
    pub fail_on: Mutex<Option<String>>,
}

impl Synthesizer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_on(&self, text_id: Option<&str>) {
        *self.fail_on.lock().unwrap() = text_id.map(str::to_string);
    }

    async fn render(&self, text: &TextItem, path: &Path) -> Result<f64> {
        if self.fail_on.lock().unwrap().as_deref() == Some(text.id.as_str()) {
            return Err(anyhow!("synthesis failed for {}", text.id));
        }
        self.calls.lock().unwrap().push(text.id.clone());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, text.content.as_bytes()).await?;
        Ok(text.content.len() as f64 / 10.0)
    }
}

struct AudioWorker<'a> {
    synth: &'a Synthesizer,
    files: Option<&'a FileTracker>,
    output_dir: Option<PathBuf>,
}

#[async_trait]
impl<'a> ItemWorker for AudioWorker<'a> {
    type Item = TextItem;
    type Output = AudioAsset;

    fn item_id(&self, item: &TextItem) -> String {
        item.id.clone()
    }

    async fn process(
        &self,
        item: &TextItem,
        _index: usize,
        previous: &[AudioAsset],
    ) -> Result<StepOutput<AudioAsset>> {
        let start_time = previous.last().map(|a| a.end_time).unwrap_or(0.0);

        match (&self.output_dir, self.files) {
            (Some(dir), _) => {
                let path = dir.join("audio").join(format!("{}.mp3", item.id));
                let duration = self.synth.render(item, &path).await?;
                Ok(StepOutput::plain(AudioAsset {
                    text_id: item.id.clone(),
                    path,
                    start_time,
                    end_time: start_time + duration,
                }))
            }
            (None, Some(files)) => {
                let name = ArtifactName::audio(&item.id, "mp3");
                let mut metadata = Map::new();
                metadata.insert("content".to_string(), Value::from(item.content.clone()));
                let file = files.create_artifact(&name, metadata).await?;
                let path = file.temp_path.clone().unwrap_or_default();
                let duration = self.synth.render(item, &path).await?;
                Ok(StepOutput::new(
                    AudioAsset {
                        text_id: item.id.clone(),
                        path,
                        start_time,
                        end_time: start_time + duration,
                    },
                    vec![file.id],
                ))
            }
            (None, None) => Err(anyhow!("no output location")),
        }
    }
}

/// The "generate-audio" stage
pub struct GenerateAudio {
    pub synth: Arc<Synthesizer>,
    pub files: Option<Arc<FileTracker>>,
}

#[async_trait]
impl Block for GenerateAudio {
    type Inputs = AudioInputs;
    type Outputs = AudioOutputs;
    type Resume = Value;

    fn id(&self) -> &str {
        "generate-audio"
    }

    async fn execute(
        &self,
        inputs: &AudioInputs,
        _resume: Option<Value>,
        context: BlockContext,
    ) -> Result<AudioOutputs> {
        let worker = AudioWorker {
            synth: &self.synth,
            files: self.files.as_deref(),
            output_dir: inputs.output_dir.clone(),
        };
        let audio_assets = run_items(&context, "audio", &worker, inputs.texts.as_slice()).await?;
        Ok(AudioOutputs { audio_assets })
    }
}
