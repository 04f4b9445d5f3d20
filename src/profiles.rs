// Persistent per-series voice profiles.
//
// Layout: <root>/<series>/<speaker>.json plus <root>/<series>/clips/.
// Every mutation is read-modify-write under a per-(series, speaker) lock and
// lands on disk through a temp file + rename. Minting new speakers is
// serialized per series so two clusters never receive the same id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{DubError, Result};

const SPEAKER_PREFIX: &str = "spk_";
const CLIPS_DIR: &str = "clips";

/// Accumulated reference material for one character of a series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub series_id: String,
    pub speaker_id: String,
    /// Append-only
    pub reference_clips: Vec<PathBuf>,
    pub sample_count: u32,
    /// Running mean of every embedding folded into this profile
    pub embedding: Vec<f32>,
    pub embedding_samples: u32,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl VoiceProfile {
    fn new(series_id: &str, speaker_id: &str, embedding: &[f32]) -> Self {
        let now = Utc::now();
        Self {
            series_id: series_id.to_string(),
            speaker_id: speaker_id.to_string(),
            reference_clips: Vec::new(),
            sample_count: 0,
            embedding: embedding.to_vec(),
            embedding_samples: if embedding.is_empty() { 0 } else { 1 },
            created_at: now,
            last_updated: now,
        }
    }

    /// Most recently added reference clip
    pub fn latest_reference(&self) -> Option<&Path> {
        self.reference_clips.last().map(|p| p.as_path())
    }

    fn fold_embedding(&mut self, new_embedding: &[f32]) {
        if new_embedding.is_empty() {
            return;
        }
        if self.embedding_samples == 0 || self.embedding.len() != new_embedding.len() {
            self.embedding = new_embedding.to_vec();
            self.embedding_samples = 1;
            return;
        }

        let count = self.embedding_samples as f32;
        let new_count = count + 1.0;
        self.embedding = self
            .embedding
            .iter()
            .zip(new_embedding.iter())
            .map(|(old, new)| (old * count + new) / new_count)
            .collect();
        self.embedding_samples += 1;
    }
}

/// Result of matching a cluster embedding against a series
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub speaker_id: String,
    /// Similarity of the matched profile; None when minted
    pub score: Option<f32>,
    pub minted: bool,
}

pub struct VoiceProfileStore {
    root: PathBuf,
    similarity_threshold: f32,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VoiceProfileStore {
    pub fn new<P: Into<PathBuf>>(root: P, similarity_threshold: f32) -> Self {
        Self {
            root: root.into(),
            similarity_threshold,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn similarity_threshold(&self) -> f32 {
        self.similarity_threshold
    }

    pub async fn lookup(&self, series_id: &str, speaker_id: &str) -> Result<Option<VoiceProfile>> {
        let lock = self.key_lock(&profile_key(series_id, speaker_id));
        let _guard = lock.lock().await;
        self.load(series_id, speaker_id)
    }

    /// All profiles of a series, ordered by speaker id
    pub async fn list(&self, series_id: &str) -> Result<Vec<VoiceProfile>> {
        let dir = self.series_dir(series_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&dir)
            .map_err(|e| DubError::Store(format!("Failed to read {}: {}", dir.display(), e)))?;

        let mut profiles = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            profiles.push(read_profile(&path)?);
        }

        profiles.sort_by(|a, b| a.speaker_id.cmp(&b.speaker_id));
        Ok(profiles)
    }

    /// Find the series speaker whose embedding scores highest against
    /// `embedding`, or mint a new one when none reaches the threshold.
    /// Equal scores resolve to the lower speaker id.
    pub async fn match_or_create<F>(&self, series_id: &str, embedding: &[f32], similarity: F) -> Result<MatchOutcome>
    where
        F: Fn(&[f32], &[f32]) -> f32,
    {
        let lock = self.key_lock(&mint_key(series_id));
        let _guard = lock.lock().await;

        let profiles = self.list(series_id).await?;

        let mut best: Option<(&VoiceProfile, f32)> = None;
        for profile in profiles.iter().filter(|p| !p.embedding.is_empty()) {
            let score = similarity(embedding, &profile.embedding);
            if !score.is_finite() || score < self.similarity_threshold {
                continue;
            }
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((profile, score));
            }
        }

        if let Some((profile, score)) = best {
            debug!("Matched {} in {} with similarity {:.3}", profile.speaker_id, series_id, score);
            return Ok(MatchOutcome {
                speaker_id: profile.speaker_id.clone(),
                score: Some(score),
                minted: false,
            });
        }

        let next = profiles
            .iter()
            .filter_map(|p| p.speaker_id.strip_prefix(SPEAKER_PREFIX)?.parse::<u32>().ok())
            .max()
            .map_or(1, |n| n + 1);
        let speaker_id = format!("{}{:04}", SPEAKER_PREFIX, next);

        let profile = VoiceProfile::new(series_id, &speaker_id, embedding);
        self.save(&profile)?;
        info!("Minted new voice profile {} for series {}", speaker_id, series_id);

        Ok(MatchOutcome {
            speaker_id,
            score: None,
            minted: true,
        })
    }

    pub async fn append_reference(&self, series_id: &str, speaker_id: &str, clip: &Path) -> Result<VoiceProfile> {
        self.append(series_id, speaker_id, clip, None).await
    }

    /// Append a clip and fold its embedding into the profile's running mean
    pub async fn append_reference_with_embedding(
        &self,
        series_id: &str,
        speaker_id: &str,
        clip: &Path,
        embedding: &[f32],
    ) -> Result<VoiceProfile> {
        self.append(series_id, speaker_id, clip, Some(embedding)).await
    }

    async fn append(
        &self,
        series_id: &str,
        speaker_id: &str,
        clip: &Path,
        embedding: Option<&[f32]>,
    ) -> Result<VoiceProfile> {
        let lock = self.key_lock(&profile_key(series_id, speaker_id));
        let _guard = lock.lock().await;

        let mut profile = self
            .load(series_id, speaker_id)?
            .ok_or_else(|| DubError::Store(format!("Unknown speaker {} in series {}", speaker_id, series_id)))?;

        let clips_dir = self.series_dir(series_id).join(CLIPS_DIR);
        std::fs::create_dir_all(&clips_dir)
            .map_err(|e| DubError::Store(format!("Failed to create {}: {}", clips_dir.display(), e)))?;

        let ext = clip.extension().and_then(|e| e.to_str()).unwrap_or("wav");
        let stored = clips_dir.join(format!("{}_{}.{}", file_safe(speaker_id), uuid::Uuid::new_v4(), ext));
        std::fs::copy(clip, &stored)
            .map_err(|e| DubError::Store(format!("Failed to store clip {}: {}", clip.display(), e)))?;

        profile.reference_clips.push(stored);
        profile.sample_count += 1;
        if let Some(embedding) = embedding {
            profile.fold_embedding(embedding);
        }
        profile.last_updated = Utc::now();

        self.save(&profile)?;
        debug!(
            "Appended reference to {}/{} (now {} clips)",
            series_id, speaker_id, profile.sample_count
        );
        Ok(profile)
    }

    fn series_dir(&self, series_id: &str) -> PathBuf {
        self.root.join(file_safe(series_id))
    }

    fn profile_path(&self, series_id: &str, speaker_id: &str) -> PathBuf {
        self.series_dir(series_id).join(format!("{}.json", file_safe(speaker_id)))
    }

    fn load(&self, series_id: &str, speaker_id: &str) -> Result<Option<VoiceProfile>> {
        let path = self.profile_path(series_id, speaker_id);
        if !path.exists() {
            return Ok(None);
        }
        read_profile(&path).map(Some)
    }

    fn save(&self, profile: &VoiceProfile) -> Result<()> {
        let path = self.profile_path(&profile.series_id, &profile.speaker_id);
        let json = serde_json::to_vec_pretty(profile)
            .map_err(|e| DubError::Store(format!("Failed to serialize profile: {}", e)))?;
        write_atomic(&path, &json)
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }
}

fn profile_key(series_id: &str, speaker_id: &str) -> String {
    format!("{}/{}", series_id, speaker_id)
}

fn mint_key(series_id: &str) -> String {
    format!("{}#mint", series_id)
}

fn read_profile(path: &Path) -> Result<VoiceProfile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DubError::Store(format!("Failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| DubError::Store(format!("Corrupt profile {}: {}", path.display(), e)))
}

/// Write through a sibling temp file so readers never see a partial document
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| DubError::Resource(format!("No parent directory for {}", path.display())))?;
    std::fs::create_dir_all(dir)
        .map_err(|e| DubError::Resource(format!("Failed to create {}: {}", dir.display(), e)))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| DubError::Resource(format!("Failed to create temp file in {}: {}", dir.display(), e)))?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|e| DubError::Resource(format!("Failed to persist {}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Series names come from directory names; keep them usable as paths
pub fn file_safe(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    let safe = safe.trim_matches('.').to_string();
    if safe.is_empty() { "_".to_string() } else { safe }
}
