use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{DubError, Result};
use crate::ledger::{EpisodeSpec, Stage, StageLedger, StageStatus};
use crate::media::MediaProcessorFactory;
use crate::pipeline::DubbingStages;
use crate::profiles::{VoiceProfile, VoiceProfileStore};
use crate::scheduler::{ProgressUpdate, RunSummary, Scheduler, StageHandler};
use crate::subtitle::{ParseOptions, ParseResult, parse_subtitle_file};

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "wmv", "flv", "webm", "m4v"];

/// Stable id for a media file: UUID v5 of its absolute path
pub fn episode_id_for(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    Uuid::new_v5(&Uuid::NAMESPACE_URL, absolute.as_os_str().as_encoded_bytes())
        .simple()
        .to_string()
}

/// Series of an episode: explicit, else the name of its directory
pub fn series_for(path: &Path, explicit: Option<&str>) -> String {
    if let Some(series) = explicit.map(str::trim).filter(|s| !s.is_empty()) {
        return series.to_string();
    }
    std::path::absolute(path)
        .ok()
        .and_then(|p| p.parent()?.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "default".to_string())
}

fn is_video_file(path: &Path) -> bool {
    let is_partial = path
        .file_stem()
        .is_some_and(|s| s.to_string_lossy().ends_with(".partial"));
    !is_partial
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

/// Ledger view of one episode
#[derive(Debug, Clone)]
pub struct EpisodeStatus {
    pub spec: EpisodeSpec,
    pub summary: String,
    pub stages: Vec<(Stage, Option<StageStatus>, u32)>,
    pub complete: bool,
    pub stuck: bool,
    pub last_error: Option<String>,
}

pub struct Workflow {
    config: Arc<Config>,
    ledger: Arc<StageLedger>,
    profiles: Arc<VoiceProfileStore>,
    scheduler: Scheduler,
}

impl Workflow {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let profiles = Arc::new(VoiceProfileStore::new(
            config.paths.profile_dir.clone(),
            config.alignment.similarity_threshold,
        ));
        let stages = DubbingStages::from_config(config.clone(), profiles.clone())?;
        Ok(Self::assemble(config, profiles, Arc::new(stages)))
    }

    /// Workflow driving a custom stage handler
    pub fn with_handler(config: Config, handler: Arc<dyn StageHandler>) -> Self {
        let config = Arc::new(config);
        let profiles = Arc::new(VoiceProfileStore::new(
            config.paths.profile_dir.clone(),
            config.alignment.similarity_threshold,
        ));
        Self::assemble(config, profiles, handler)
    }

    fn assemble(config: Arc<Config>, profiles: Arc<VoiceProfileStore>, handler: Arc<dyn StageHandler>) -> Self {
        let ledger = Arc::new(StageLedger::new(config.paths.work_dir.clone()));
        let scheduler = Scheduler::new(config.scheduler.clone(), ledger.clone(), handler, config.episodes_dir());
        Self {
            config,
            ledger,
            profiles,
            scheduler,
        }
    }

    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        self.scheduler = self.scheduler.with_progress(sender);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.scheduler.cancellation_token()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Make sure ffmpeg/ffprobe can be run
    pub async fn check_dependencies(&self) -> Result<()> {
        MediaProcessorFactory::create_processor(self.config.media.clone())
            .check_availability()
            .await
    }

    pub fn episode_spec(&self, input: &Path, series: Option<&str>, output: Option<&Path>) -> Result<EpisodeSpec> {
        if !input.exists() {
            return Err(DubError::FileNotFound(input.display().to_string()));
        }
        let input_path = std::path::absolute(input)?;
        let output_path = match output {
            Some(path) => std::path::absolute(path)?,
            None => input_path.clone(),
        };
        Ok(EpisodeSpec {
            episode_id: episode_id_for(&input_path),
            series_id: series_for(&input_path, series),
            input_path,
            output_path,
            enqueued_at: chrono::Utc::now(),
        })
    }

    /// Dub one video file
    pub async fn dub_file(&self, input: &Path, series: Option<&str>, output: Option<&Path>) -> Result<RunSummary> {
        info!("Processing single file: {}", input.display());
        let spec = self.episode_spec(input, series, output)?;
        self.scheduler.enqueue(&spec)?;
        self.scheduler.run().await
    }

    /// Dub every video under `input_dir`, or under the configured scan paths
    pub async fn dub_directory(&self, input_dir: Option<&Path>, series: Option<&str>) -> Result<RunSummary> {
        let roots: Vec<PathBuf> = match input_dir {
            Some(dir) => vec![dir.to_path_buf()],
            None => self.config.paths.scan_paths.clone(),
        };
        if roots.is_empty() {
            return Err(DubError::Config(
                "No input directory given and paths.scan_paths is empty".to_string(),
            ));
        }

        let mut video_files = Vec::new();
        for root in &roots {
            if !root.is_dir() {
                return Err(DubError::Input(format!("{} is not a directory", root.display())));
            }
            info!("Scanning directory: {}", root.display());
            for entry in WalkDir::new(root).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() && is_video_file(entry.path()) {
                    video_files.push(entry.into_path());
                }
            }
        }
        info!("Found {} video files", video_files.len());

        for video_path in &video_files {
            let spec = match self.episode_spec(video_path, series, None) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!("Skipping {}: {}", video_path.display(), e);
                    continue;
                }
            };
            let state = self.ledger.state(&spec.episode_id)?;
            if state.is_complete() {
                info!("Already dubbed: {}", video_path.display());
                continue;
            }
            if state.is_stuck() {
                warn!(
                    "Skipping stuck episode {} ({}); use `retry {}`",
                    spec.episode_id,
                    video_path.display(),
                    spec.episode_id
                );
                continue;
            }
            self.scheduler.enqueue(&spec)?;
        }

        self.scheduler.run().await
    }

    pub async fn resume(&self) -> Result<RunSummary> {
        self.scheduler.resume().await
    }

    pub async fn retry(&self, episode_id: &str) -> Result<RunSummary> {
        self.scheduler.retry(episode_id).await
    }

    /// Every episode the ledger knows about
    pub fn status(&self) -> Result<Vec<EpisodeStatus>> {
        let mut statuses = Vec::new();
        for episode_id in self.ledger.episodes()? {
            let Some(spec) = self.ledger.load_spec(&episode_id)? else {
                continue;
            };
            let state = self.ledger.state(&episode_id)?;
            let stages = Stage::ALL
                .iter()
                .map(|s| (*s, state.status_of(*s), state.attempt_of(*s)))
                .collect();
            let last_error = state
                .latest
                .values()
                .filter(|r| r.status == StageStatus::Failed)
                .max_by_key(|r| r.recorded_at)
                .and_then(|r| r.error.clone());

            statuses.push(EpisodeStatus {
                summary: state.summary(),
                complete: state.is_complete(),
                stuck: state.is_stuck(),
                stages,
                last_error,
                spec,
            });
        }
        Ok(statuses)
    }

    pub async fn profiles(&self, series_id: &str) -> Result<Vec<VoiceProfile>> {
        self.profiles.list(series_id).await
    }

    /// Parse a subtitle file the way Extract would
    pub async fn parse_subtitles(&self, path: &Path, language: Option<&str>) -> Result<ParseResult> {
        let language = language.unwrap_or(&self.config.language.subtitle);
        let options = ParseOptions::new(language, &self.config.subtitles);
        parse_subtitle_file(path, &options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::MockStageHandler;
    use assert_fs::prelude::*;
    use std::collections::BTreeMap;

    fn test_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.paths.work_dir = root.join("work");
        config.paths.profile_dir = root.join("profiles");
        config
    }

    #[test]
    fn test_episode_ids_are_stable_and_distinct() {
        let a = episode_id_for(Path::new("/library/show/ep01.mkv"));
        assert_eq!(a, episode_id_for(Path::new("/library/show/ep01.mkv")));
        assert_ne!(a, episode_id_for(Path::new("/library/show/ep02.mkv")));
        // Ids key the ledger on disk and must not change between builds
        assert_eq!(a, "51e9a853f397515db09fa300b96bd2e1");
    }

    #[test]
    fn test_series_from_parent_directory() {
        let path = Path::new("/library/Frieren/ep01.mkv");
        assert_eq!(series_for(path, None), "Frieren");
        assert_eq!(series_for(path, Some("frieren-s1")), "frieren-s1");
        assert_eq!(series_for(path, Some("  ")), "Frieren");
    }

    #[test]
    fn test_video_file_filter() {
        assert!(is_video_file(Path::new("a/ep01.MKV")));
        assert!(!is_video_file(Path::new("a/ep01.partial.mkv")));
        assert!(!is_video_file(Path::new("a/ep01.srt")));
    }

    #[tokio::test]
    async fn test_dub_directory_enqueues_videos_once() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("library/show/ep01.mkv").write_str("x").unwrap();
        temp.child("library/show/ep02.mp4").write_str("x").unwrap();
        temp.child("library/show/ep01.en.ass").write_str("x").unwrap();

        let mut handler = MockStageHandler::new();
        handler.expect_run_stage().times(12).returning(|_, _| Ok(BTreeMap::new()));

        let workflow = Workflow::with_handler(test_config(temp.path()), Arc::new(handler));
        let library = temp.child("library");
        let summary = workflow.dub_directory(Some(library.path()), None).await.unwrap();
        assert_eq!(summary.completed.len(), 2);

        // Completed episodes are not queued again
        let summary = workflow.dub_directory(Some(library.path()), None).await.unwrap();
        assert_eq!(summary.total(), 0);

        let statuses = workflow.status().unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.complete && s.spec.series_id == "show"));
    }

    #[tokio::test]
    async fn test_status_reports_stuck_episode() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("show/ep01.mkv").write_str("x").unwrap();

        let mut handler = MockStageHandler::new();
        handler
            .expect_run_stage()
            .returning(|_, _| Err(DubError::Input("no japanese audio".into())));

        let workflow = Workflow::with_handler(test_config(temp.path()), Arc::new(handler));
        let summary = workflow
            .dub_file(temp.child("show/ep01.mkv").path(), Some("show"), None)
            .await
            .unwrap();
        assert_eq!(summary.stuck.len(), 1);

        let status = &workflow.status().unwrap()[0];
        assert!(status.stuck);
        assert_eq!(status.summary, "stuck at extract");
        assert!(status.last_error.as_deref().unwrap().contains("no japanese audio"));
    }

    #[tokio::test]
    async fn test_dub_directory_skips_stuck_episodes() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("library/show/ep01.mkv").write_str("x").unwrap();

        let mut handler = MockStageHandler::new();
        handler
            .expect_run_stage()
            .times(1)
            .returning(|_, _| Err(DubError::Input("corrupt container".into())));

        let workflow = Workflow::with_handler(test_config(temp.path()), Arc::new(handler));
        let library = temp.child("library");
        let summary = workflow.dub_directory(Some(library.path()), None).await.unwrap();
        assert_eq!(summary.stuck.len(), 1);

        // Stuck episodes wait for an explicit retry
        let summary = workflow.dub_directory(Some(library.path()), None).await.unwrap();
        assert_eq!(summary.total(), 0);
        assert!(workflow.status().unwrap()[0].stuck);
    }

    #[tokio::test]
    async fn test_dub_missing_file_is_error() {
        let temp = assert_fs::TempDir::new().unwrap();
        let workflow = Workflow::with_handler(test_config(temp.path()), Arc::new(MockStageHandler::new()));
        let err = workflow.dub_file(Path::new("/nope/missing.mkv"), None, None).await.unwrap_err();
        assert!(matches!(err, DubError::FileNotFound(_)));
    }
}
