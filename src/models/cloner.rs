// Voice cloning runtime: one command computes reference embeddings,
// another synthesizes a line from text and a reference clip.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::command::read_json_output;
use super::{Embedding, ModelCommand, Placeholders, VoiceClonerTrait};
use crate::error::{DubError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingOutput {
    pub embedding: Vec<f32>,
}

pub struct CommandVoiceCloner {
    embedder: ModelCommand,
    synthesizer: ModelCommand,
}

impl CommandVoiceCloner {
    pub fn new(embedder: ModelCommand, synthesizer: ModelCommand) -> Self {
        Self { embedder, synthesizer }
    }
}

#[async_trait]
impl VoiceClonerTrait for CommandVoiceCloner {
    async fn embed(&self, clip: &Path, cancel: &CancellationToken) -> Result<Embedding> {
        if !clip.exists() {
            return Err(DubError::FileNotFound(clip.display().to_string()));
        }

        let temp_dir = tempfile::tempdir()
            .map_err(|e| DubError::Resource(format!("Failed to create temp directory: {}", e)))?;
        let output_path = temp_dir.path().join("embedding.json");

        let placeholders = Placeholders::new()
            .with_path("input", clip)
            .with_path("output", &output_path)
            .with_path("output_dir", temp_dir.path());
        let output = self.embedder.run(&placeholders, cancel).await?;

        let parsed: EmbeddingOutput = read_json_output(self.embedder.name(), &output_path, &output).await?;
        validate_embedding(parsed.embedding)
    }

    async fn synthesize(
        &self,
        text: &str,
        reference: Option<&Path>,
        prompt_text: Option<&str>,
        language: &str,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_dir = tempfile::tempdir()
            .map_err(|e| DubError::Resource(format!("Failed to create temp directory: {}", e)))?;
        let text_file = temp_dir.path().join("line.txt");
        tokio::fs::write(&text_file, text).await?;

        let mut placeholders = Placeholders::new()
            .with_path("text_file", &text_file)
            .with_opt_path("reference", reference)
            .with("language", language)
            .with_path("output", output)
            .with_path("output_dir", temp_dir.path());
        // Unset when there is no reference to describe
        if let Some(prompt) = prompt_text.map(str::trim).filter(|p| !p.is_empty() && reference.is_some()) {
            placeholders = placeholders.with("prompt_text", prompt);
        }
        self.synthesizer.run(&placeholders, cancel).await?;

        let produced = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
        if produced == 0 {
            return Err(DubError::Model(format!(
                "Synthesizer produced no audio at {}",
                output.display()
            )));
        }

        debug!("Synthesized {} bytes to {}", produced, output.display());
        Ok(())
    }
}

fn validate_embedding(embedding: Vec<f32>) -> Result<Embedding> {
    if embedding.is_empty() {
        return Err(DubError::Model("Embedder returned an empty embedding".to_string()));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(DubError::Model("Embedder returned non-finite values".to_string()));
    }
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelCommandConfig, ModelsConfig};

    fn sh(script: &str) -> ModelCommand {
        let config = ModelCommandConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            interruptible: false,
            timeout_secs: 30,
        };
        ModelCommand::from_config("test", &config, &ModelsConfig::default())
    }

    #[test]
    fn test_validate_embedding() {
        assert!(validate_embedding(vec![]).is_err());
        assert!(validate_embedding(vec![f32::NAN]).is_err());
        assert_eq!(validate_embedding(vec![0.5, 0.5]).unwrap(), vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn test_embed_reads_stdout_json() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("ref.wav");
        std::fs::write(&clip, b"RIFF").unwrap();

        let cloner = CommandVoiceCloner::new(sh(r#"echo '{"embedding": [0.1, 0.2, 0.3]}'"#), sh("true"));
        let embedding = cloner.embed(&clip, &CancellationToken::new()).await.unwrap();
        assert_eq!(embedding.len(), 3);
    }

    #[tokio::test]
    async fn test_synthesize_without_output_is_model_error() {
        let dir = tempfile::tempdir().unwrap();
        let cloner = CommandVoiceCloner::new(sh("true"), sh("true"));
        let err = cloner
            .synthesize("Hello", None, None, "en", &dir.path().join("line.wav"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DubError::Model(_)));
    }

    #[tokio::test]
    async fn test_synthesize_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("clips/line.wav");
        let script = format!("printf audio > '{}'", out.display());
        let cloner = CommandVoiceCloner::new(sh("true"), sh(&script));
        cloner
            .synthesize("Hello", None, None, "en", &out, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.exists());
    }

    #[tokio::test]
    async fn test_synthesize_passes_prompt_text_with_reference() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("ref.wav");
        std::fs::write(&reference, b"RIFF").unwrap();
        let out = dir.path().join("line.wav");
        let seen = dir.path().join("prompt.txt");

        // $0 receives the rendered prompt argument
        let config = ModelCommandConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                format!("printf '%s' \"$0\" > '{}'; printf audio > '{}'", seen.display(), out.display()),
                "{prompt_text}".to_string(),
            ],
            interruptible: false,
            timeout_secs: 30,
        };
        let synthesizer = ModelCommand::from_config("synthesizer", &config, &ModelsConfig::default());
        let cloner = CommandVoiceCloner::new(sh("true"), synthesizer);

        cloner
            .synthesize("Hello", Some(&reference), Some(" こんにちは "), "en", &out, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&seen).unwrap(), "こんにちは");
    }
}
