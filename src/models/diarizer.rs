// Pyannote-style diarization runtime

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::command::read_json_output;
use super::{DiarizationMapper, DiarizationSegment, DiarizerTrait, ModelCommand, Placeholders, seconds_to_ms};
use crate::error::{DubError, Result};

/// Pyannote-style JSON: either a bare list of turns or `{"segments": [...]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PyannoteOutput {
    Wrapped { segments: Vec<PyannoteTurn> },
    Bare(Vec<PyannoteTurn>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyannoteTurn {
    pub start: f64,
    pub end: f64,
    #[serde(alias = "label")]
    pub speaker: String,
}

/// Mapper for pyannote output. `SPEAKER_nn` labels keep their number; any
/// other labelling is numbered by first appearance.
pub struct PyannoteMapper;

impl DiarizationMapper<PyannoteOutput> for PyannoteMapper {
    fn to_segments(output: PyannoteOutput) -> Result<Vec<DiarizationSegment>> {
        let mut turns = match output {
            PyannoteOutput::Wrapped { segments } => segments,
            PyannoteOutput::Bare(segments) => segments,
        };
        turns.sort_by(|a, b| a.start.total_cmp(&b.start));

        let numbered: Option<Vec<u32>> = turns.iter().map(|t| parse_speaker_label(&t.speaker)).collect();
        let ids = match numbered {
            Some(ids) => ids,
            None => {
                let mut order: HashMap<&str, u32> = HashMap::new();
                turns
                    .iter()
                    .map(|t| {
                        let next = order.len() as u32;
                        *order.entry(t.speaker.as_str()).or_insert(next)
                    })
                    .collect()
            }
        };

        Ok(turns
            .iter()
            .zip(ids)
            .map(|(t, id)| DiarizationSegment::new(seconds_to_ms(t.start), seconds_to_ms(t.end), id))
            .filter(|s| s.end_ms > s.start_ms)
            .collect())
    }
}

fn parse_speaker_label(label: &str) -> Option<u32> {
    label.strip_prefix("SPEAKER_")?.parse().ok()
}

pub struct CommandDiarizer {
    command: ModelCommand,
}

impl CommandDiarizer {
    pub fn new(command: ModelCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl DiarizerTrait for CommandDiarizer {
    async fn diarize(&self, vocals: &Path, cancel: &CancellationToken) -> Result<Vec<DiarizationSegment>> {
        if !vocals.exists() {
            return Err(DubError::FileNotFound(vocals.display().to_string()));
        }

        let temp_dir = tempfile::tempdir()
            .map_err(|e| DubError::Resource(format!("Failed to create temp directory: {}", e)))?;
        let output_path = temp_dir.path().join("diarization.json");

        let placeholders = Placeholders::new()
            .with_path("input", vocals)
            .with_path("output", &output_path)
            .with_path("output_dir", temp_dir.path());
        let output = self.command.run(&placeholders, cancel).await?;

        let parsed: PyannoteOutput = read_json_output(self.command.name(), &output_path, &output).await?;
        let segments = PyannoteMapper::to_segments(parsed)?;

        let clusters: std::collections::BTreeSet<u32> = segments.iter().map(|s| s.cluster_id).collect();
        info!("Diarization found {} segments across {} clusters", segments.len(), clusters.len());
        debug!("Clusters: {:?}", clusters);
        Ok(segments)
    }
}
