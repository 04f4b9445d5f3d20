// Demucs-style two-stem separation.
// Demucs nests its stems as <output_dir>/<model>/<track>/{vocals,no_vocals}.wav,
// so the stems are located by walking the output directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;
use walkdir::WalkDir;

use super::{ModelCommand, Placeholders, SeparatedStems, SeparatorTrait};
use crate::error::{DubError, Result};

const VOCALS_STEM: &str = "vocals.wav";
const ACCOMPANIMENT_STEM: &str = "no_vocals.wav";

pub struct DemucsSeparator {
    command: ModelCommand,
}

impl DemucsSeparator {
    pub fn new(command: ModelCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl SeparatorTrait for DemucsSeparator {
    async fn separate(&self, audio: &Path, output_dir: &Path, cancel: &CancellationToken) -> Result<SeparatedStems> {
        if !audio.exists() {
            return Err(DubError::FileNotFound(audio.display().to_string()));
        }
        tokio::fs::create_dir_all(output_dir).await?;

        info!("Separating vocals from {}", audio.display());
        let placeholders = Placeholders::new()
            .with_path("input", audio)
            .with_path("output_dir", output_dir);
        self.command.run(&placeholders, cancel).await?;

        let stems = find_stems(output_dir)?;
        info!("Separation complete: vocals={}", stems.vocals.display());
        Ok(stems)
    }
}

/// Locate the vocals/accompaniment pair under a separation output directory
pub fn find_stems(output_dir: &Path) -> Result<SeparatedStems> {
    let find = |name: &str| -> Option<PathBuf> {
        WalkDir::new(output_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.file_name() == name)
            .map(|e| e.into_path())
            .min()
    };

    let vocals = find(VOCALS_STEM)
        .ok_or_else(|| DubError::Model(format!("Separation produced no {} in {}", VOCALS_STEM, output_dir.display())))?;
    let accompaniment = find(ACCOMPANIMENT_STEM).ok_or_else(|| {
        DubError::Model(format!("Separation produced no {} in {}", ACCOMPANIMENT_STEM, output_dir.display()))
    })?;

    Ok(SeparatedStems { vocals, accompaniment })
}
