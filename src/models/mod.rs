// Model adapters
//
// Every model runtime is an external collaborator reached through one of the
// traits below. The shipped implementations run a configured command and map
// its JSON output into our types:
// - separator: demucs-style two-stem source separation
// - diarizer: pyannote-style speaker segments
// - transcriber: whisper-style transcript segments
// - cloner: reference embedding + zero-shot voice cloning TTS
//
// To support a runtime with a different output shape:
// 1. Add service-specific structs for its JSON
// 2. Implement the matching mapper trait (DiarizationMapper / TranscriptMapper)
// 3. Wire it up in ModelAdapterFactory

pub mod cloner;
pub mod command;
pub mod diarizer;
pub mod separator;
pub mod transcriber;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use command::{ModelCommand, Placeholders};
use crate::config::ModelsConfig;
use crate::error::Result;

/// Speaker turn from one episode's diarization run. `cluster_id` is only
/// meaningful within that run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiarizationSegment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub cluster_id: u32,
}

impl DiarizationSegment {
    pub fn new(start_ms: u64, end_ms: u64, cluster_id: u32) -> Self {
        Self { start_ms, end_ms, cluster_id }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    /// In [0, 1]
    pub confidence: f64,
}

/// Output stems of source separation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeparatedStems {
    pub vocals: PathBuf,
    pub accompaniment: PathBuf,
}

pub type Embedding = Vec<f32>;

#[async_trait]
pub trait SeparatorTrait: Send + Sync {
    /// Split mixed audio into vocals and accompaniment, writing into `output_dir`
    async fn separate(&self, audio: &Path, output_dir: &Path, cancel: &CancellationToken) -> Result<SeparatedStems>;
}

#[async_trait]
pub trait DiarizerTrait: Send + Sync {
    /// Ordered speaker segments of a vocals-only track
    async fn diarize(&self, vocals: &Path, cancel: &CancellationToken) -> Result<Vec<DiarizationSegment>>;
}

#[async_trait]
pub trait TranscriberTrait: Send + Sync {
    /// Ordered source-language transcript segments
    async fn transcribe(&self, vocals: &Path, language: &str, cancel: &CancellationToken) -> Result<Vec<TranscriptSegment>>;
}

#[async_trait]
pub trait VoiceClonerTrait: Send + Sync {
    /// Reference embedding of a voice clip
    async fn embed(&self, clip: &Path, cancel: &CancellationToken) -> Result<Embedding>;

    /// Speak `text` in `language` with the voice of `reference`, writing a WAV to `output`.
    /// `prompt_text` is what is said in the reference clip, in the source language,
    /// for zero-shot runtimes that condition on it. Without a reference the
    /// runtime's default voice is used.
    async fn synthesize(
        &self,
        text: &str,
        reference: Option<&Path>,
        prompt_text: Option<&str>,
        language: &str,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Similarity of two reference embeddings
    fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        cosine_similarity(a, b)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Trait for converting a diarization runtime's JSON into segments
pub trait DiarizationMapper<T> {
    fn to_segments(output: T) -> Result<Vec<DiarizationSegment>>;
}

/// Trait for converting a transcription runtime's JSON into segments
pub trait TranscriptMapper<T> {
    fn to_segments(output: T) -> Result<Vec<TranscriptSegment>>;
}

/// The full set of adapters one pipeline needs
#[derive(Clone)]
pub struct ModelAdapters {
    pub separator: Arc<dyn SeparatorTrait>,
    pub diarizer: Arc<dyn DiarizerTrait>,
    pub transcriber: Arc<dyn TranscriberTrait>,
    pub cloner: Arc<dyn VoiceClonerTrait>,
}

/// Factory for creating model adapters
pub struct ModelAdapterFactory;

impl ModelAdapterFactory {
    /// Command-backed adapters for every model
    pub fn create_from_config(config: &ModelsConfig) -> ModelAdapters {
        ModelAdapters {
            separator: Arc::new(separator::DemucsSeparator::new(ModelCommand::from_config(
                "separator",
                &config.separator,
                config,
            ))),
            diarizer: Arc::new(diarizer::CommandDiarizer::new(ModelCommand::from_config(
                "diarizer",
                &config.diarizer,
                config,
            ))),
            transcriber: Arc::new(transcriber::WhisperTranscriber::new(ModelCommand::from_config(
                "transcriber",
                &config.transcriber,
                config,
            ))),
            cloner: Arc::new(cloner::CommandVoiceCloner::new(
                ModelCommand::from_config("embedder", &config.embedder, config),
                ModelCommand::from_config("synthesizer", &config.synthesizer, config),
            )),
        }
    }
}

pub(crate) fn seconds_to_ms(seconds: f64) -> u64 {
    if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1000.0).round() as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_seconds_to_ms() {
        assert_eq!(seconds_to_ms(1.5), 1500);
        assert_eq!(seconds_to_ms(-2.0), 0);
        assert_eq!(seconds_to_ms(f64::NAN), 0);
    }
}
