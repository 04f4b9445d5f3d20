// Episode scheduler.
//
// Drives each queued episode through the stage state machine, one stage at a
// time, recording every transition in the ledger. GPU stages hold a slot of
// a process-wide semaphore for their whole run; the worker pool bounds how
// many episodes advance concurrently.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{DubError, FailureClass, Result};
use crate::ledger::{EpisodeSpec, Stage, StageLedger, StageRecord, StageStatus};

/// Everything a stage needs to do its work
#[derive(Debug, Clone)]
pub struct StageContext {
    pub spec: EpisodeSpec,
    /// Scratch and artifact directory of this episode
    pub episode_dir: PathBuf,
    /// Artifacts of all Done stages
    pub artifacts: BTreeMap<String, PathBuf>,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn artifact(&self, name: &str) -> Result<&PathBuf> {
        self.artifacts.get(name).ok_or_else(|| {
            DubError::Input(format!(
                "Episode {} is missing artifact '{}' from an earlier stage",
                self.spec.episode_id, name
            ))
        })
    }
}

/// Runs the work of one stage and returns the artifacts it produced
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run_stage(&self, stage: Stage, ctx: &StageContext) -> Result<BTreeMap<String, PathBuf>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub episode_id: String,
    pub stage: Stage,
    pub status: StageStatus,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeOutcome {
    Completed,
    /// Retries exhausted at this stage
    Stuck(Stage),
    /// Stopped before or during this stage; resumable
    Cancelled(Stage),
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub completed: Vec<String>,
    pub stuck: Vec<(String, Stage)>,
    pub cancelled: Vec<String>,
    /// Episodes that could not be driven at all (ledger trouble, already claimed)
    pub errors: Vec<(String, String)>,
}

impl RunSummary {
    fn record(&mut self, episode_id: String, outcome: Result<EpisodeOutcome>) {
        match outcome {
            Ok(EpisodeOutcome::Completed) => self.completed.push(episode_id),
            Ok(EpisodeOutcome::Stuck(stage)) => self.stuck.push((episode_id, stage)),
            Ok(EpisodeOutcome::Cancelled(_)) => self.cancelled.push(episode_id),
            Err(e) => self.errors.push((episode_id, e.to_string())),
        }
    }

    pub fn total(&self) -> usize {
        self.completed.len() + self.stuck.len() + self.cancelled.len() + self.errors.len()
    }

    pub fn is_success(&self) -> bool {
        self.stuck.is_empty() && self.errors.is_empty() && self.cancelled.is_empty()
    }
}

/// Delay before the retry following the `failures`-th failure
pub fn backoff_delay(config: &SchedulerConfig, failures: u32) -> Duration {
    let factor = 1u64.checked_shl(failures.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(config.backoff_base_ms.saturating_mul(factor).min(config.backoff_max_ms))
}

/// Attempts allowed within one run for the kind of failure `error` is
fn attempts_allowed(config: &SchedulerConfig, error: &DubError) -> u32 {
    if !error.is_retryable() {
        return 1;
    }
    match error.class() {
        FailureClass::Mux => 2,
        _ => config.max_retries.max(1),
    }
}

enum StageResult {
    Done,
    Stuck,
    Cancelled,
}

#[derive(Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    ledger: Arc<StageLedger>,
    handler: Arc<dyn StageHandler>,
    episodes_dir: PathBuf,
    gpu: Arc<Semaphore>,
    cancel: CancellationToken,
    episode_tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
    queue: Arc<Mutex<VecDeque<String>>>,
    progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        ledger: Arc<StageLedger>,
        handler: Arc<dyn StageHandler>,
        episodes_dir: PathBuf,
    ) -> Self {
        let gpu = Arc::new(Semaphore::new(config.gpu_slots.max(1)));
        Self {
            config,
            ledger,
            handler,
            episodes_dir,
            gpu,
            cancel: CancellationToken::new(),
            episode_tokens: Arc::new(Mutex::new(HashMap::new())),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            progress: None,
        }
    }

    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Root token; cancelling it stops every episode
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn ledger(&self) -> &StageLedger {
        &self.ledger
    }

    /// Stop one in-flight episode at its next safe point
    pub fn cancel_episode(&self, episode_id: &str) -> bool {
        let tokens = self.episode_tokens.lock().unwrap_or_else(|p| p.into_inner());
        match tokens.get(episode_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Persist the episode and put it on the queue
    pub fn enqueue(&self, spec: &EpisodeSpec) -> Result<()> {
        self.ledger.register(spec)?;
        self.ledger.initialize(&spec.episode_id)?;
        info!(
            "Enqueued episode {} ({}) of series '{}'",
            spec.episode_id,
            spec.input_path.display(),
            spec.series_id
        );
        self.push(&spec.episode_id);
        Ok(())
    }

    fn push(&self, episode_id: &str) {
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        if !queue.iter().any(|id| id == episode_id) {
            queue.push_back(episode_id.to_string());
        }
    }

    fn pop(&self) -> Option<String> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Process everything on the queue with the worker pool
    pub async fn run(&self) -> Result<RunSummary> {
        let workers = self.config.max_parallel_stages.max(1).min(self.queued().max(1));
        debug!("Starting {} scheduler worker(s) for {} episode(s)", workers, self.queued());

        let mut set = JoinSet::new();
        for _ in 0..workers {
            let worker = self.clone();
            set.spawn(async move { worker.worker_loop().await });
        }

        let mut summary = RunSummary::default();
        while let Some(joined) = set.join_next().await {
            let results = joined.map_err(|e| DubError::Resource(format!("Scheduler worker failed: {}", e)))?;
            for (episode_id, outcome) in results {
                summary.record(episode_id, outcome);
            }
        }

        info!(
            "Run finished: {} completed, {} stuck, {} cancelled, {} errors",
            summary.completed.len(),
            summary.stuck.len(),
            summary.cancelled.len(),
            summary.errors.len()
        );
        Ok(summary)
    }

    /// Queue every unfinished, non-stuck episode in the ledger and run
    pub async fn resume(&self) -> Result<RunSummary> {
        for episode_id in self.ledger.episodes()? {
            let state = self.ledger.state(&episode_id)?;
            if state.is_complete() {
                continue;
            }
            if let Some(record) = state.stuck_record() {
                info!(
                    "Episode {} is stuck at {} ({}); use retry to run it again",
                    episode_id,
                    record.stage,
                    record.error.as_deref().unwrap_or("unknown error")
                );
                continue;
            }
            info!("Resuming episode {}: {}", episode_id, state.summary());
            self.push(&episode_id);
        }
        self.run().await
    }

    /// Run an episode again from its first unfinished stage, stuck or not
    pub async fn retry(&self, episode_id: &str) -> Result<RunSummary> {
        if self.ledger.load_spec(episode_id)?.is_none() {
            return Err(DubError::Input(format!("Unknown episode: {}", episode_id)));
        }
        let state = self.ledger.state(episode_id)?;
        if let Some(record) = state.stuck_record() {
            info!("Retrying episode {} from stage {}", episode_id, record.stage);
        }
        self.push(episode_id);
        self.run().await
    }

    async fn worker_loop(self) -> Vec<(String, Result<EpisodeOutcome>)> {
        let mut results = Vec::new();
        while let Some(episode_id) = self.pop() {
            let outcome = self.process_episode(&episode_id).await;
            if let Err(e) = &outcome {
                error!("Episode {} could not be processed: {}", episode_id, e);
            }
            results.push((episode_id, outcome));
        }
        results
    }

    async fn process_episode(&self, episode_id: &str) -> Result<EpisodeOutcome> {
        let _claim = self.ledger.claim(episode_id)?;
        let spec = self
            .ledger
            .load_spec(episode_id)?
            .ok_or_else(|| DubError::Ledger(format!("No episode file for {}", episode_id)))?;

        self.ledger.initialize(episode_id)?;
        self.ledger.recover_interrupted(episode_id)?;

        let episode_dir = self.episodes_dir.join(episode_id);
        std::fs::create_dir_all(&episode_dir)?;

        let cancel = self.cancel.child_token();
        self.episode_tokens
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(episode_id.to_string(), cancel.clone());

        let outcome = self.drive(&spec, &episode_dir, &cancel).await;

        self.episode_tokens
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(episode_id);
        outcome
    }

    async fn drive(&self, spec: &EpisodeSpec, episode_dir: &Path, cancel: &CancellationToken) -> Result<EpisodeOutcome> {
        let episode_id = spec.episode_id.as_str();
        loop {
            let state = self.ledger.state(episode_id)?;
            let Some(stage) = state.first_incomplete() else {
                info!("Episode {} complete", episode_id);
                return Ok(EpisodeOutcome::Completed);
            };

            if cancel.is_cancelled() {
                info!("Episode {} cancelled before {}", episode_id, stage);
                return Ok(EpisodeOutcome::Cancelled(stage));
            }

            match self.execute_stage(spec, stage, episode_dir, cancel).await? {
                StageResult::Done => continue,
                StageResult::Stuck => return Ok(EpisodeOutcome::Stuck(stage)),
                StageResult::Cancelled => return Ok(EpisodeOutcome::Cancelled(stage)),
            }
        }
    }

    async fn acquire_gpu(&self, cancel: &CancellationToken) -> Result<Option<OwnedSemaphorePermit>> {
        tokio::select! {
            permit = self.gpu.clone().acquire_owned() => permit
                .map(Some)
                .map_err(|e| DubError::Resource(format!("GPU slot unavailable: {}", e))),
            _ = cancel.cancelled() => Ok(None),
        }
    }

    async fn execute_stage(
        &self,
        spec: &EpisodeSpec,
        stage: Stage,
        episode_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<StageResult> {
        let episode_id = spec.episode_id.as_str();
        let mut failures = 0u32;

        loop {
            let state = self.ledger.state(episode_id)?;
            let attempt = state.attempt_of(stage) + 1;

            let permit = if stage.uses_gpu() {
                debug!("Episode {} waiting for GPU slot ({})", episode_id, stage);
                match self.acquire_gpu(cancel).await? {
                    Some(permit) => Some(permit),
                    None => return Ok(StageResult::Cancelled),
                }
            } else {
                None
            };

            self.ledger
                .append(StageRecord::new(episode_id, stage, StageStatus::Running, attempt))?;
            self.emit(episode_id, stage, StageStatus::Running, attempt);
            info!("Episode {} stage {} started (attempt {})", episode_id, stage, attempt);

            let ctx = StageContext {
                spec: spec.clone(),
                episode_dir: episode_dir.to_path_buf(),
                artifacts: state.artifacts(),
                attempt,
                cancel: cancel.clone(),
            };
            let result = self.handler.run_stage(stage, &ctx).await;
            drop(permit);

            let e = match result {
                Ok(artifacts) => {
                    self.ledger.append(
                        StageRecord::new(episode_id, stage, StageStatus::Done, attempt).with_artifacts(artifacts),
                    )?;
                    self.emit(episode_id, stage, StageStatus::Done, attempt);
                    info!("Episode {} stage {} done", episode_id, stage);
                    return Ok(StageResult::Done);
                }
                Err(e) => e,
            };

            if cancel.is_cancelled() || e.class() == FailureClass::Cancelled {
                self.ledger
                    .append(StageRecord::failed(episode_id, stage, attempt, e.to_string(), false))?;
                self.emit(episode_id, stage, StageStatus::Failed, attempt);
                warn!("Episode {} stage {} cancelled: {}", episode_id, stage, e);
                return Ok(StageResult::Cancelled);
            }

            failures += 1;
            let exhausted = failures >= attempts_allowed(&self.config, &e);
            self.ledger
                .append(StageRecord::failed(episode_id, stage, attempt, e.to_string(), exhausted))?;
            self.emit(episode_id, stage, StageStatus::Failed, attempt);

            if exhausted {
                error!(
                    "Episode {} stuck at {} after {} attempt(s): {}",
                    episode_id, stage, failures, e
                );
                return Ok(StageResult::Stuck);
            }

            let delay = backoff_delay(&self.config, failures);
            warn!(
                "Episode {} stage {} failed (attempt {}): {}; retrying in {:?}",
                episode_id, stage, attempt, e, delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Ok(StageResult::Cancelled),
            }
        }
    }

    fn emit(&self, episode_id: &str, stage: Stage, status: StageStatus, attempt: u32) {
        if let Some(sender) = &self.progress {
            let _ = sender.send(ProgressUpdate {
                episode_id: episode_id.to_string(),
                stage,
                status,
                attempt,
            });
        }
    }
}
