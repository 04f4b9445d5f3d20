use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::probe::{MediaProbe, iso639_2, language_name};
use super::{MediaCommandBuilder, MediaProcessorTrait, MuxTrack};
use crate::config::MediaConfig;
use crate::error::{DubError, Result};

/// Concrete implementation of media processor (FFmpeg-based)
pub struct MediaProcessorImpl {
    config: MediaConfig,
    command_builder: MediaCommandBuilder,
}

impl MediaProcessorImpl {
    /// Create a new media processor implementation
    pub fn new(config: MediaConfig) -> Self {
        let command_builder = MediaCommandBuilder::new(&config.binary_path, &config.probe_path);

        Self {
            config,
            command_builder,
        }
    }
}

#[async_trait]
impl MediaProcessorTrait for MediaProcessorImpl {
    async fn probe(&self, media_path: &Path) -> Result<MediaProbe> {
        if !media_path.exists() {
            return Err(DubError::FileNotFound(media_path.display().to_string()));
        }
        let stdout = self.command_builder.probe(media_path).execute().await?;
        serde_json::from_str(&stdout)
            .map_err(|e| DubError::Media(format!("Failed to parse ffprobe output: {}", e)))
    }

    async fn extract_audio_track(&self, video_path: &Path, language: &str, audio_path: &Path) -> Result<()> {
        let probe = self.probe(video_path).await?;
        let stream = probe.find_audio_stream(language).ok_or_else(|| {
            DubError::Input(format!(
                "No audio track with language '{}' found in {}",
                language,
                video_path.display()
            ))
        })?;

        if let Some(parent) = audio_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Extracting {} audio ({}) from {}", language, stream, video_path.display());
        self.command_builder
            .extract_audio_track(video_path, &stream, audio_path, self.config.extract_sample_rate)
            .execute()
            .await?;

        info!("Audio extraction completed");
        Ok(())
    }

    async fn extract_subtitles(&self, video_path: &Path, language: &str, output_dir: &Path) -> Result<Option<PathBuf>> {
        let probe = self.probe(video_path).await?;

        let Some((stream, ext)) = probe.find_subtitle_stream(language) else {
            warn!("No embedded {} subtitles in {}", language, video_path.display());
            return Ok(find_external_subtitles(video_path, language));
        };

        tokio::fs::create_dir_all(output_dir).await?;
        let stem = video_path.file_stem().unwrap_or_default().to_string_lossy();
        let subtitle_path = output_dir.join(format!("{}_subs_{}.{}", stem, language, ext));

        info!("Extracting {} subtitles ({}) as .{}", language, stream, ext);
        self.command_builder
            .extract_subtitle_track(video_path, &stream, &subtitle_path)
            .execute()
            .await?;

        Ok(Some(subtitle_path))
    }

    async fn mux_dubbed_audio(
        &self,
        source_path: &Path,
        dubbed_audio: &Path,
        output_path: &Path,
        language: &str,
    ) -> Result<()> {
        let existing_audio = self
            .probe(source_path)
            .await
            .map_err(|e| DubError::Mux(format!("Failed to probe source: {}", e)))?
            .audio_count();

        let track = MuxTrack {
            language: iso639_2(language),
            title: format!("{} ({})", language_name(language), self.config.dubbed_track_label),
            codec: self.config.audio_codec.clone(),
            bitrate: self.config.audio_bitrate.clone(),
            default_track: self.config.default_track,
        };

        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(
            "Muxing dubbed audio into {} as audio track {} ({})",
            output_path.display(),
            existing_audio,
            track.title
        );
        self.command_builder
            .mux_dubbed_audio(source_path, dubbed_audio, output_path, existing_audio, &track)
            .execute()
            .await
            .map_err(|e| DubError::Mux(e.to_string()))?;

        if !output_path.exists() {
            return Err(DubError::Mux(format!("Expected output not created: {}", output_path.display())));
        }

        info!("Mux complete: {}", output_path.display());
        Ok(())
    }

    async fn check_availability(&self) -> Result<()> {
        let version = self.command_builder.version_check().execute().await?;
        debug!("{}", version.lines().next().unwrap_or("Unknown version"));
        Ok(())
    }
}

/// Subtitle files shipped next to the video
pub fn find_external_subtitles(video_path: &Path, language: &str) -> Option<PathBuf> {
    let stem = video_path.file_stem()?.to_string_lossy().into_owned();
    let parent = video_path.parent().unwrap_or_else(|| Path::new("."));

    let candidates = [
        format!("{}.{}.srt", stem, language),
        format!("{}.{}.ass", stem, language),
        format!("{}.{}.ssa", stem, language),
        format!("{}.ass", stem),
        format!("{}.srt", stem),
    ];

    candidates
        .iter()
        .map(|name| parent.join(name))
        .find(|candidate| candidate.exists())
        .inspect(|found| info!("Found external subtitles: {}", found.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_external_subtitles_prefer_language_tagged() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("ep01.srt").touch().unwrap();
        temp.child("ep01.en.ass").touch().unwrap();

        let found = find_external_subtitles(&temp.path().join("ep01.mkv"), "en").unwrap();
        assert!(found.ends_with("ep01.en.ass"));
    }

    #[test]
    fn test_external_subtitles_missing() {
        let temp = assert_fs::TempDir::new().unwrap();
        assert!(find_external_subtitles(&temp.path().join("ep02.mkv"), "en").is_none());
    }

    #[tokio::test]
    async fn test_probe_missing_file_is_input_error() {
        let processor = MediaProcessorImpl::new(MediaConfig::default());
        let err = processor.probe(Path::new("/nonexistent/ep.mkv")).await.unwrap_err();
        assert!(matches!(err, DubError::FileNotFound(_)));
    }
}
