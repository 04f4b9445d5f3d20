// Append-only stage ledger.
//
// Each episode has <dir>/<episode>.jsonl holding every StageRecord ever
// written, plus <dir>/<episode>.episode.json describing the job. Current
// state is derived from the latest record per stage; nothing is rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::{DubError, Result};
use crate::profiles::write_atomic;

pub const INTERRUPTED: &str = "interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Extract,
    Separate,
    Identify,
    Clone,
    Remix,
    Finalize,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Extract,
        Stage::Separate,
        Stage::Identify,
        Stage::Clone,
        Stage::Remix,
        Stage::Finalize,
    ];

    /// Stages that load a model onto the GPU
    pub fn uses_gpu(self) -> bool {
        matches!(self, Stage::Separate | Stage::Identify | Stage::Clone)
    }

    pub fn previous(self) -> Option<Stage> {
        let pos = Self::ALL.iter().position(|s| *s == self)?;
        pos.checked_sub(1).map(|p| Self::ALL[p])
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Separate => "separate",
            Stage::Identify => "identify",
            Stage::Clone => "clone",
            Stage::Remix => "remix",
            Stage::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Done => "done",
            StageStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub episode_id: String,
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default)]
    pub artifacts: BTreeMap<String, PathBuf>,
    pub attempt: u32,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set on the Failed record that ends automatic retries
    #[serde(default)]
    pub exhausted: bool,
}

impl StageRecord {
    pub fn new(episode_id: &str, stage: Stage, status: StageStatus, attempt: u32) -> Self {
        Self {
            episode_id: episode_id.to_string(),
            stage,
            status,
            artifacts: BTreeMap::new(),
            attempt,
            recorded_at: Utc::now(),
            error: None,
            exhausted: false,
        }
    }

    pub fn with_artifacts(mut self, artifacts: BTreeMap<String, PathBuf>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn failed(episode_id: &str, stage: Stage, attempt: u32, error: impl Into<String>, exhausted: bool) -> Self {
        let mut record = Self::new(episode_id, stage, StageStatus::Failed, attempt);
        record.error = Some(error.into());
        record.exhausted = exhausted;
        record
    }
}

/// What to dub and where the result goes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSpec {
    pub episode_id: String,
    pub series_id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub enqueued_at: DateTime<Utc>,
}

/// Latest record per stage of one episode
#[derive(Debug, Clone, Default)]
pub struct EpisodeState {
    pub latest: BTreeMap<Stage, StageRecord>,
}

impl EpisodeState {
    pub fn from_records(records: &[StageRecord]) -> Self {
        let mut latest = BTreeMap::new();
        for record in records {
            latest.insert(record.stage, record.clone());
        }
        Self { latest }
    }

    pub fn status_of(&self, stage: Stage) -> Option<StageStatus> {
        self.latest.get(&stage).map(|r| r.status)
    }

    pub fn is_done(&self, stage: Stage) -> bool {
        self.status_of(stage) == Some(StageStatus::Done)
    }

    /// First stage in pipeline order that has not reached Done
    pub fn first_incomplete(&self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| !self.is_done(*s))
    }

    pub fn is_complete(&self) -> bool {
        self.first_incomplete().is_none()
    }

    /// Failed record that ended automatic retries, if any
    pub fn stuck_record(&self) -> Option<&StageRecord> {
        self.latest
            .values()
            .find(|r| r.status == StageStatus::Failed && r.exhausted)
    }

    pub fn is_stuck(&self) -> bool {
        self.stuck_record().is_some()
    }

    /// Stages whose latest record says Running: a crash interrupted them
    pub fn interrupted(&self) -> Vec<Stage> {
        self.latest
            .values()
            .filter(|r| r.status == StageStatus::Running)
            .map(|r| r.stage)
            .collect()
    }

    pub fn attempt_of(&self, stage: Stage) -> u32 {
        self.latest.get(&stage).map_or(0, |r| r.attempt)
    }

    /// Artifacts of every Done stage, later stages overriding earlier names
    pub fn artifacts(&self) -> BTreeMap<String, PathBuf> {
        let mut merged = BTreeMap::new();
        for stage in Stage::ALL {
            if let Some(record) = self.latest.get(&stage).filter(|r| r.status == StageStatus::Done) {
                merged.extend(record.artifacts.clone());
            }
        }
        merged
    }

    /// One-word summary for status listings
    pub fn summary(&self) -> String {
        if self.is_complete() {
            return "complete".to_string();
        }
        if let Some(record) = self.stuck_record() {
            return format!("stuck at {}", record.stage);
        }
        match self.first_incomplete() {
            Some(stage) => match self.status_of(stage) {
                Some(StageStatus::Failed) => format!("failed at {} (resumable)", stage),
                Some(StageStatus::Running) => format!("running {}", stage),
                _ => format!("pending {}", stage),
            },
            None => "complete".to_string(),
        }
    }
}

/// Reject transitions that break the per-stage state machine
pub fn validate_transition(state: &EpisodeState, record: &StageRecord) -> Result<()> {
    let previous = state.latest.get(&record.stage);
    let invalid = |why: &str| -> Result<()> {
        Err(DubError::Ledger(format!(
            "Invalid transition for {} {}: {} ({})",
            record.episode_id, record.stage, record.status, why
        )))
    };

    match (previous.map(|p| p.status), record.status) {
        (None, StageStatus::Pending) => Ok(()),
        (_, StageStatus::Pending) => invalid("stage already tracked"),
        (Some(StageStatus::Pending), StageStatus::Running) | (Some(StageStatus::Failed), StageStatus::Running) => {
            let prev_attempt = previous.map_or(0, |p| p.attempt);
            if record.attempt != prev_attempt + 1 {
                return invalid("attempt must advance by one");
            }
            if let Some(before) = record.stage.previous() {
                if !state.is_done(before) {
                    return invalid("previous stage not done");
                }
            }
            Ok(())
        }
        (_, StageStatus::Running) => invalid("stage not pending or failed"),
        (Some(StageStatus::Running), StageStatus::Done | StageStatus::Failed) => {
            if previous.map(|p| p.attempt) != Some(record.attempt) {
                return invalid("attempt mismatch");
            }
            Ok(())
        }
        (_, StageStatus::Done | StageStatus::Failed) => invalid("stage not running"),
    }
}

pub struct StageLedger {
    work_dir: PathBuf,
    dir: PathBuf,
    claims: Arc<Mutex<HashSet<String>>>,
}

impl StageLedger {
    /// Ledger files live under `<work_dir>/ledger`; artifact paths inside
    /// `work_dir` are stored relative to it.
    pub fn new<P: Into<PathBuf>>(work_dir: P) -> Self {
        let work_dir = work_dir.into();
        Self {
            dir: work_dir.join("ledger"),
            work_dir,
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn records_path(&self, episode_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", episode_id))
    }

    fn spec_path(&self, episode_id: &str) -> PathBuf {
        self.dir.join(format!("{}.episode.json", episode_id))
    }

    pub fn register(&self, spec: &EpisodeSpec) -> Result<()> {
        let json = serde_json::to_vec_pretty(spec)
            .map_err(|e| DubError::Ledger(format!("Failed to serialize episode: {}", e)))?;
        write_atomic(&self.spec_path(&spec.episode_id), &json)
    }

    pub fn load_spec(&self, episode_id: &str) -> Result<Option<EpisodeSpec>> {
        let path = self.spec_path(episode_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| DubError::Ledger(format!("Corrupt episode file {}: {}", path.display(), e)))
    }

    /// Registered episode ids, sorted
    pub fn episodes(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_str()?
                    .strip_suffix(".episode.json")
                    .map(|s| s.to_string())
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Every record of an episode in write order. A torn final line from a
    /// crash mid-append is skipped.
    pub fn records(&self, episode_id: &str) -> Result<Vec<StageRecord>> {
        let path = self.records_path(episode_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut records = Vec::with_capacity(lines.len());

        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<StageRecord>(line) {
                Ok(record) => records.push(self.resolve_artifacts(record)),
                Err(e) if i + 1 == lines.len() => {
                    warn!("Skipping torn ledger line in {}: {}", path.display(), e);
                }
                Err(e) => {
                    return Err(DubError::Ledger(format!(
                        "Corrupt ledger {} line {}: {}",
                        path.display(),
                        i + 1,
                        e
                    )));
                }
            }
        }

        Ok(records)
    }

    pub fn state(&self, episode_id: &str) -> Result<EpisodeState> {
        Ok(EpisodeState::from_records(&self.records(episode_id)?))
    }

    /// Validate and durably append one record
    pub fn append(&self, record: StageRecord) -> Result<()> {
        let state = self.state(&record.episode_id)?;
        validate_transition(&state, &record)?;

        let stored = self.relativize_artifacts(record);
        let mut line = serde_json::to_string(&stored)
            .map_err(|e| DubError::Ledger(format!("Failed to serialize record: {}", e)))?;
        line.push('\n');

        std::fs::create_dir_all(&self.dir)?;
        let path = self.records_path(&stored.episode_id);
        drop_torn_tail(&path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        debug!(
            "Ledger {} {} -> {} (attempt {})",
            stored.episode_id, stored.stage, stored.status, stored.attempt
        );
        Ok(())
    }

    /// Write Pending for every stage not yet tracked
    pub fn initialize(&self, episode_id: &str) -> Result<()> {
        let state = self.state(episode_id)?;
        for stage in Stage::ALL {
            if !state.latest.contains_key(&stage) {
                self.append(StageRecord::new(episode_id, stage, StageStatus::Pending, 0))?;
            }
        }
        Ok(())
    }

    /// Close stages left Running by a crash with a non-exhausted Failed record
    pub fn recover_interrupted(&self, episode_id: &str) -> Result<Vec<Stage>> {
        let state = self.state(episode_id)?;
        let interrupted = state.interrupted();
        for stage in &interrupted {
            let attempt = state.attempt_of(*stage);
            self.append(StageRecord::failed(episode_id, *stage, attempt, INTERRUPTED, false))?;
            warn!("Episode {} stage {} was interrupted; will re-run", episode_id, stage);
        }
        Ok(interrupted)
    }

    /// Exclusive right to advance an episode, released on drop
    pub fn claim(&self, episode_id: &str) -> Result<EpisodeClaim> {
        let mut claims = self.claims.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !claims.insert(episode_id.to_string()) {
            return Err(DubError::Ledger(format!("Episode {} is already being processed", episode_id)));
        }
        Ok(EpisodeClaim {
            episode_id: episode_id.to_string(),
            claims: self.claims.clone(),
        })
    }

    fn relativize_artifacts(&self, mut record: StageRecord) -> StageRecord {
        for path in record.artifacts.values_mut() {
            if path.is_absolute() && path.starts_with(&self.work_dir) {
                if let Some(relative) = pathdiff::diff_paths(&*path, &self.work_dir) {
                    *path = relative;
                }
            }
        }
        record
    }

    fn resolve_artifacts(&self, mut record: StageRecord) -> StageRecord {
        for path in record.artifacts.values_mut() {
            if path.is_relative() {
                *path = self.work_dir.join(&*path);
            }
        }
        record
    }
}

/// Cut a partial final line left by a crash mid-append back to the last
/// complete record, so the next append starts on a line of its own.
fn drop_torn_tail(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let content = std::fs::read(path)?;
    if content.last().is_none_or(|b| *b == b'\n') {
        return Ok(());
    }

    let keep = content.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    warn!(
        "Dropping {} bytes of torn ledger record from {}",
        content.len() - keep,
        path.display()
    );
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_data()?;
    Ok(())
}

pub struct EpisodeClaim {
    episode_id: String,
    claims: Arc<Mutex<HashSet<String>>>,
}

impl EpisodeClaim {
    pub fn episode_id(&self) -> &str {
        &self.episode_id
    }
}

impl Drop for EpisodeClaim {
    fn drop(&mut self) {
        let mut claims = self.claims.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        claims.remove(&self.episode_id);
    }
}
