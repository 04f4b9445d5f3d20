use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::error::{Result, DubError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub language: LanguageConfig,
    pub subtitles: SubtitleConfig,
    pub scheduler: SchedulerConfig,
    pub alignment: AlignmentConfig,
    pub assembly: AssemblyConfig,
    pub models: ModelsConfig,
    pub media: MediaConfig,
    pub notifier: NotifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for the stage ledger, per-episode artifacts and logs
    pub work_dir: PathBuf,
    /// Root of the persistent per-series voice profile store
    pub profile_dir: PathBuf,
    /// Library directories walked by `batch` when no directory is given
    pub scan_paths: Vec<PathBuf>,
    /// Keep synthesized clips and other intermediates after a successful mux
    pub keep_intermediates: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageConfig {
    /// Language of the dubbed track (ISO 639-1)
    pub target: String,
    /// Language of the subtitle track used as the translation source
    pub subtitle: String,
    /// Language of the original audio track voices are cloned from
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitleConfig {
    /// Lines shorter than this are dropped (frame-by-frame typesetting)
    pub min_duration_ms: u64,
    /// Collapse sequential lines with identical text
    pub deduplicate: bool,
    /// ASS styles to drop; `None` uses the built-in sign/karaoke list
    pub excluded_styles: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of stages (of different episodes) allowed to run at once
    pub max_parallel_stages: usize,
    /// Number of GPU-resident models allowed at once
    pub gpu_slots: usize,
    /// Maximum attempts per stage for retryable failures
    pub max_retries: u32,
    /// First retry delay; doubled on every further attempt
    pub backoff_base_ms: u64,
    /// Upper bound for the retry delay
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Minimum similarity for a cluster to reuse an existing voice profile
    pub similarity_threshold: f32,
    /// Assignments below this confidence are flagged for manual review
    pub low_confidence_threshold: f64,
    /// Weight of transcript corroboration when raising confidence
    pub corroboration_weight: f64,
    /// Transcript segments below this confidence never corroborate
    pub min_transcript_confidence: f64,
    /// Base confidence for nearest-segment fallback assignments
    pub fallback_confidence: f64,
    /// Shortest cluster reference clip worth embedding
    pub reference_min_ms: u64,
    /// Longest cluster reference clip cut from the vocals
    pub reference_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    pub sample_rate: u32,
    /// How far a clip may run into the next line before it is compressed
    pub overlap_tolerance_ms: u64,
    /// Maximum playback speed-up before truncation kicks in
    pub max_speedup: f64,
    /// Per-clip dialogue loudness target
    pub clip_loudness_lufs: f64,
    /// Loudness target of the final mix
    pub target_lufs: f64,
    /// Sample peak ceiling of the final mix
    pub peak_limit_dbfs: f64,
    /// Padding around a line when slicing its vocals as a voice reference
    pub reference_pad_before_ms: u64,
    pub reference_pad_after_ms: u64,
    /// Line slices shorter than this fall back to the speaker profile reference
    pub line_reference_min_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Device passed to every model runtime (cuda, cpu)
    pub device: String,
    /// Directory holding pretrained model weights
    pub model_dir: PathBuf,
    pub separator: ModelCommandConfig,
    pub diarizer: ModelCommandConfig,
    pub transcriber: ModelCommandConfig,
    pub embedder: ModelCommandConfig,
    pub synthesizer: ModelCommandConfig,
}

/// External model runtime invocation.
///
/// Arguments may contain `{input}`, `{output}`, `{output_dir}`, `{device}`,
/// `{model_dir}`, `{language}`, `{text_file}` and `{reference}` placeholders.
/// An argument whose placeholder has no value is dropped together with the
/// flag preceding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCommandConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Whether the runtime may be killed when its episode is cancelled
    #[serde(default)]
    pub interruptible: bool,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_model_timeout_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Path to ffmpeg binary
    pub binary_path: String,
    /// Path to ffprobe binary
    pub probe_path: String,
    /// Sample rate of the extracted source audio
    pub extract_sample_rate: u32,
    /// Title suffix of the muxed track, e.g. "English (AI-Dubbed)"
    pub dubbed_track_label: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    /// Mark the dubbed track as the default audio track
    pub default_track: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Refresh endpoint of the media server; disabled when empty
    pub url: Option<String>,
    /// Header carrying the API token, e.g. "X-Emby-Token"
    pub token_header: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(".animedub/work"),
            profile_dir: PathBuf::from(".animedub/profiles"),
            scan_paths: Vec::new(),
            keep_intermediates: false,
        }
    }
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            target: "en".to_string(),
            subtitle: "en".to_string(),
            source: "ja".to_string(),
        }
    }
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self {
            min_duration_ms: 100,
            deduplicate: true,
            excluded_styles: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_stages: 1,
            gpu_slots: 1,
            max_retries: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.75,
            low_confidence_threshold: 0.5,
            corroboration_weight: 0.25,
            min_transcript_confidence: 0.6,
            fallback_confidence: 0.4,
            reference_min_ms: 1_500,
            reference_max_ms: 10_000,
        }
    }
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            overlap_tolerance_ms: 300,
            max_speedup: 1.5,
            clip_loudness_lufs: -20.0,
            target_lufs: -23.0,
            peak_limit_dbfs: -1.0,
            reference_pad_before_ms: 200,
            reference_pad_after_ms: 300,
            line_reference_min_ms: 500,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        let args = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            device: "cuda".to_string(),
            model_dir: PathBuf::from("pretrained_models"),
            separator: ModelCommandConfig {
                program: "python3".to_string(),
                args: args(&[
                    "-m", "demucs", "--two-stems", "vocals", "-n", "htdemucs_ft",
                    "--device", "{device}", "-o", "{output_dir}", "{input}",
                ]),
                interruptible: true,
                timeout_secs: 1800,
            },
            diarizer: ModelCommandConfig {
                program: "python3".to_string(),
                args: args(&[
                    "-m", "animedub_models.diarize", "--model-dir", "{model_dir}",
                    "--device", "{device}", "{input}", "{output}",
                ]),
                interruptible: true,
                timeout_secs: 1800,
            },
            transcriber: ModelCommandConfig {
                program: "whisper".to_string(),
                args: args(&[
                    "{input}", "--model", "large-v3-turbo", "--language", "{language}",
                    "--device", "{device}", "--output_dir", "{output_dir}",
                    "--output_format", "json",
                ]),
                interruptible: true,
                timeout_secs: 1800,
            },
            embedder: ModelCommandConfig {
                program: "python3".to_string(),
                args: args(&[
                    "-m", "animedub_models.embed", "--model-dir", "{model_dir}",
                    "--device", "{device}", "{input}", "{output}",
                ]),
                interruptible: false,
                timeout_secs: 300,
            },
            synthesizer: ModelCommandConfig {
                program: "python3".to_string(),
                args: args(&[
                    "-m", "animedub_models.synthesize", "--model-dir", "{model_dir}",
                    "--device", "{device}", "--language", "{language}",
                    "--text-file", "{text_file}", "--reference", "{reference}",
                    "--prompt-text", "{prompt_text}", "{output}",
                ]),
                interruptible: false,
                timeout_secs: 600,
            },
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            probe_path: "ffprobe".to_string(),
            extract_sample_rate: 44_100,
            dubbed_track_label: "AI-Dubbed".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "192k".to_string(),
            default_track: false,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            url: None,
            token_header: "X-Emby-Token".to_string(),
            token: None,
            timeout_secs: 10,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DubError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| DubError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DubError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| DubError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Reject values the scheduler and assembler cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_parallel_stages == 0 {
            return Err(DubError::Config("scheduler.max_parallel_stages must be at least 1".to_string()));
        }
        if self.scheduler.gpu_slots == 0 {
            return Err(DubError::Config("scheduler.gpu_slots must be at least 1".to_string()));
        }
        if self.scheduler.max_retries == 0 {
            return Err(DubError::Config("scheduler.max_retries must be at least 1".to_string()));
        }
        if self.assembly.max_speedup < 1.0 {
            return Err(DubError::Config("assembly.max_speedup must be >= 1.0".to_string()));
        }
        if self.assembly.sample_rate == 0 {
            return Err(DubError::Config("assembly.sample_rate must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.alignment.similarity_threshold) {
            return Err(DubError::Config("alignment.similarity_threshold must be within [0, 1]".to_string()));
        }
        Ok(())
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.paths.work_dir.join("ledger")
    }

    pub fn episodes_dir(&self) -> PathBuf {
        self.paths.work_dir.join("episodes")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.paths.work_dir.join("log")
    }
}
