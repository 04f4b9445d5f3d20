// Container I/O for the dubbing pipeline
//
// - Probe: ffprobe stream listing and language lookup
// - Processor: ffmpeg-backed track extraction and dub muxing
// - Commands: ffmpeg/ffprobe argument builders

pub mod commands;
pub mod probe;
pub mod processor;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use commands::*;
pub use probe::MediaProbe;
pub use processor::*;

use crate::config::MediaConfig;
use crate::error::Result;

/// Main trait for media processing operations
#[async_trait]
pub trait MediaProcessorTrait: Send + Sync {
    /// List streams of a media file
    async fn probe(&self, media_path: &Path) -> Result<MediaProbe>;

    /// Extract the audio track tagged `language` to WAV
    async fn extract_audio_track(&self, video_path: &Path, language: &str, audio_path: &Path) -> Result<()>;

    /// Extract the subtitle track tagged `language` in its native format,
    /// falling back to subtitle files next to the video
    async fn extract_subtitles(&self, video_path: &Path, language: &str, output_dir: &Path) -> Result<Option<PathBuf>>;

    /// Write a copy of `source_path` with the dubbed track added
    async fn mux_dubbed_audio(
        &self,
        source_path: &Path,
        dubbed_audio: &Path,
        output_path: &Path,
        language: &str,
    ) -> Result<()>;

    /// Check if media processor is available
    async fn check_availability(&self) -> Result<()>;
}

/// Factory for creating media processor instances
pub struct MediaProcessorFactory;

impl MediaProcessorFactory {
    /// Create the default media processor implementation (FFmpeg-based)
    pub fn create_processor(config: MediaConfig) -> Arc<dyn MediaProcessorTrait> {
        Arc::new(processor::MediaProcessorImpl::new(config))
    }
}
