// Whisper transcription used as a timing corroboration signal.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::command::read_json_output;
use super::{ModelCommand, Placeholders, TranscriberTrait, TranscriptMapper, TranscriptSegment, seconds_to_ms};
use crate::error::{DubError, Result};

/// Confidence of a segment that reports no log probability
const UNKNOWN_CONFIDENCE: f64 = 0.5;

/// OpenAI Whisper specific JSON output format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperOutput {
    #[serde(default)]
    pub text: String,
    pub segments: Vec<WhisperSegment>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub avg_logprob: Option<f64>,
    pub no_speech_prob: Option<f64>,
}

/// Mapper for Whisper format
pub struct WhisperMapper;

impl TranscriptMapper<WhisperOutput> for WhisperMapper {
    fn to_segments(output: WhisperOutput) -> Result<Vec<TranscriptSegment>> {
        let mut segments: Vec<TranscriptSegment> = output
            .segments
            .into_iter()
            .map(|seg| TranscriptSegment {
                start_ms: seconds_to_ms(seg.start),
                end_ms: seconds_to_ms(seg.end),
                text: seg.text.trim().to_string(),
                // Convert log probability to confidence score (0.0 to 1.0)
                confidence: seg
                    .avg_logprob
                    .map(|logprob| logprob.exp().clamp(0.0, 1.0))
                    .unwrap_or(UNKNOWN_CONFIDENCE),
            })
            .filter(|seg| seg.end_ms > seg.start_ms)
            .collect();

        segments.sort_by_key(|s| s.start_ms);
        Ok(segments)
    }
}

pub struct WhisperTranscriber {
    command: ModelCommand,
}

impl WhisperTranscriber {
    pub fn new(command: ModelCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl TranscriberTrait for WhisperTranscriber {
    async fn transcribe(&self, vocals: &Path, language: &str, cancel: &CancellationToken) -> Result<Vec<TranscriptSegment>> {
        if !vocals.exists() {
            return Err(DubError::FileNotFound(vocals.display().to_string()));
        }

        let temp_dir = tempfile::tempdir()
            .map_err(|e| DubError::Resource(format!("Failed to create temp directory: {}", e)))?;
        let stem = vocals
            .file_stem()
            .ok_or_else(|| DubError::Input("Invalid audio filename".to_string()))?;
        let json_file = temp_dir.path().join(format!("{}.json", stem.to_string_lossy()));

        let placeholders = Placeholders::new()
            .with_path("input", vocals)
            .with("language", language)
            .with_path("output_dir", temp_dir.path())
            .with_path("output", &json_file);
        let output = self.command.run(&placeholders, cancel).await?;

        let parsed: WhisperOutput = read_json_output(self.command.name(), &json_file, &output).await?;
        let segments = WhisperMapper::to_segments(parsed)?;
        info!("Transcription produced {} segments", segments.len());
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logprob_becomes_confidence() {
        let json = r#"{
            "text": " konnichiwa",
            "language": "ja",
            "segments": [
                {"id": 0, "start": 1.0, "end": 2.5, "text": " konnichiwa ", "avg_logprob": -0.105},
                {"id": 1, "start": 3.0, "end": 4.0, "text": "hai"}
            ]
        }"#;
        let output: WhisperOutput = serde_json::from_str(json).unwrap();
        let segments = WhisperMapper::to_segments(output).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].start_ms, 1000);
        assert_eq!(segments[0].end_ms, 2500);
        assert_eq!(segments[0].text, "konnichiwa");
        assert!((segments[0].confidence - 0.9).abs() < 0.01);
        assert_eq!(segments[1].confidence, UNKNOWN_CONFIDENCE);
    }
}
