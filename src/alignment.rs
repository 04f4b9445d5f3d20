// Speaker-to-subtitle alignment.
//
// Fuses three imperfect signals into one speaker per subtitle line:
// - diarization overlap picks the episode-local cluster
// - transcript overlap only corroborates timing, never names a speaker
// - the SpeakerResolver maps each cluster to a durable series speaker
//
// Every line is assigned. Weak evidence lowers confidence and sets
// `low_confidence` instead of dropping the line.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::AlignmentConfig;
use crate::error::Result;
use crate::models::{DiarizationSegment, TranscriptSegment};
use crate::subtitle::{SubtitleLine, format_timestamp};

/// Speaker id used when diarization found no speech at all
pub const NARRATOR_SPEAKER: &str = "narrator";

/// Confidence multiplier when a cluster could not be mapped to a series speaker
const UNRESOLVED_PENALTY: f64 = 0.5;

/// A cluster mapped onto a durable series speaker
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSpeaker {
    pub speaker_id: String,
    /// Reference audio to clone this speaker from
    pub reference_clip: Option<PathBuf>,
    pub minted: bool,
}

/// Maps episode-local cluster ids to stable speakers
#[async_trait]
pub trait SpeakerResolver: Send + Sync {
    async fn resolve(&self, cluster_id: u32) -> Result<ResolvedSpeaker>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentBasis {
    /// Diarization overlapped the line
    Overlap,
    /// Line fell into a diarization gap; closest segment used
    NearestSegment,
    /// No diarization segments in the episode
    Narrator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerAssignment {
    pub subtitle_index: usize,
    pub speaker_id: String,
    pub confidence: f64,
    pub reference_clip: Option<PathBuf>,
    pub low_confidence: bool,
    pub cluster_id: Option<u32>,
    pub basis: AssignmentBasis,
}

/// Cluster choice for one line before speaker resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterChoice {
    pub subtitle_index: usize,
    pub cluster_id: Option<u32>,
    pub confidence: f64,
    pub basis: AssignmentBasis,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignmentReport {
    pub total_lines: usize,
    pub by_overlap: usize,
    pub by_nearest_segment: usize,
    pub by_narrator: usize,
    pub low_confidence_lines: Vec<usize>,
    pub unresolved_clusters: Vec<u32>,
    pub minted_speakers: Vec<String>,
    pub speakers: BTreeSet<String>,
    pub mean_confidence: f64,
}

impl AlignmentReport {
    fn from_assignments(assignments: &[SpeakerAssignment]) -> Self {
        let mut report = AlignmentReport {
            total_lines: assignments.len(),
            ..Default::default()
        };
        for a in assignments {
            match a.basis {
                AssignmentBasis::Overlap => report.by_overlap += 1,
                AssignmentBasis::NearestSegment => report.by_nearest_segment += 1,
                AssignmentBasis::Narrator => report.by_narrator += 1,
            }
            if a.low_confidence {
                report.low_confidence_lines.push(a.subtitle_index);
            }
            report.speakers.insert(a.speaker_id.clone());
        }
        if !assignments.is_empty() {
            report.mean_confidence =
                assignments.iter().map(|a| a.confidence).sum::<f64>() / assignments.len() as f64;
        }
        report
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentOutput {
    pub assignments: Vec<SpeakerAssignment>,
    pub report: AlignmentReport,
}

pub struct AlignmentEngine {
    config: AlignmentConfig,
}

impl AlignmentEngine {
    pub fn new(config: AlignmentConfig) -> Self {
        Self { config }
    }

    pub fn narrator_confidence(&self) -> f64 {
        0.1f64.min(self.config.low_confidence_threshold / 2.0)
    }

    /// Pick a cluster for every line from diarization and transcript timing
    pub fn choose_clusters(
        &self,
        lines: &[SubtitleLine],
        diarization: &[DiarizationSegment],
        transcript: &[TranscriptSegment],
    ) -> Vec<ClusterChoice> {
        if diarization.is_empty() {
            return lines
                .iter()
                .map(|line| ClusterChoice {
                    subtitle_index: line.index,
                    cluster_id: None,
                    confidence: self.narrator_confidence(),
                    basis: AssignmentBasis::Narrator,
                })
                .collect();
        }

        let centroids = cluster_centroids(diarization);

        lines
            .iter()
            .map(|line| {
                let by_overlap = if line.is_point_event() {
                    None
                } else {
                    best_overlap_cluster(line, diarization, &centroids)
                };

                match by_overlap {
                    Some((cluster_id, overlap_ms)) => {
                        let duration = line.duration_ms() as f64;
                        let overlap_fraction = (overlap_ms as f64 / duration).clamp(0.0, 1.0);
                        let corroboration = self.corroboration(line, transcript);
                        let confidence = overlap_fraction
                            + self.config.corroboration_weight * corroboration * (1.0 - overlap_fraction);
                        ClusterChoice {
                            subtitle_index: line.index,
                            cluster_id: Some(cluster_id),
                            confidence: confidence.clamp(0.0, 1.0),
                            basis: AssignmentBasis::Overlap,
                        }
                    }
                    None => {
                        let (cluster_id, distance_ms) = nearest_cluster(line, diarization, &centroids);
                        let confidence = self.config.fallback_confidence / (1.0 + distance_ms as f64 / 1000.0);
                        ClusterChoice {
                            subtitle_index: line.index,
                            cluster_id: Some(cluster_id),
                            confidence: confidence.clamp(0.0, 1.0),
                            basis: AssignmentBasis::NearestSegment,
                        }
                    }
                }
            })
            .collect()
    }

    /// Share of the line covered by confident transcript segments, in [0, 1]
    fn corroboration(&self, line: &SubtitleLine, transcript: &[TranscriptSegment]) -> f64 {
        let duration = line.duration_ms() as f64;
        if duration <= 0.0 {
            return 0.0;
        }
        transcript
            .iter()
            .filter(|seg| seg.confidence >= self.config.min_transcript_confidence)
            .map(|seg| overlap_ms(line.start_ms, line.end_ms, seg.start_ms, seg.end_ms) as f64 / duration * seg.confidence)
            .sum::<f64>()
            .clamp(0.0, 1.0)
    }

    /// Assign a resolved speaker to every subtitle line
    pub async fn align(
        &self,
        lines: &[SubtitleLine],
        diarization: &[DiarizationSegment],
        transcript: &[TranscriptSegment],
        resolver: &dyn SpeakerResolver,
    ) -> Result<AlignmentOutput> {
        let choices = self.choose_clusters(lines, diarization, transcript);

        // Ascending order keeps minting deterministic across runs
        let clusters: BTreeSet<u32> = choices.iter().filter_map(|c| c.cluster_id).collect();
        let mut resolved: BTreeMap<u32, ResolvedSpeaker> = BTreeMap::new();
        let mut unresolved: Vec<u32> = Vec::new();

        for cluster_id in clusters {
            match resolver.resolve(cluster_id).await {
                Ok(speaker) => {
                    resolved.insert(cluster_id, speaker);
                }
                Err(e) => {
                    warn!("Could not resolve cluster {} to a series speaker: {}", cluster_id, e);
                    unresolved.push(cluster_id);
                }
            }
        }

        let assignments: Vec<SpeakerAssignment> = choices
            .into_iter()
            .map(|choice| {
                let (speaker_id, reference_clip, confidence) = match choice.cluster_id {
                    None => (NARRATOR_SPEAKER.to_string(), None, choice.confidence),
                    Some(cluster_id) => match resolved.get(&cluster_id) {
                        Some(speaker) => (
                            speaker.speaker_id.clone(),
                            speaker.reference_clip.clone(),
                            choice.confidence,
                        ),
                        None => (
                            episode_scoped_speaker(cluster_id),
                            None,
                            choice.confidence * UNRESOLVED_PENALTY,
                        ),
                    },
                };

                SpeakerAssignment {
                    subtitle_index: choice.subtitle_index,
                    speaker_id,
                    confidence,
                    reference_clip,
                    low_confidence: confidence < self.config.low_confidence_threshold,
                    cluster_id: choice.cluster_id,
                    basis: choice.basis,
                }
            })
            .collect();

        let mut report = AlignmentReport::from_assignments(&assignments);
        report.unresolved_clusters = unresolved;
        report.minted_speakers = resolved
            .values()
            .filter(|s| s.minted)
            .map(|s| s.speaker_id.clone())
            .collect();

        self.log_review_lines(lines, &assignments);
        info!(
            "Aligned {} lines to {} speakers (overlap {}, nearest {}, narrator {}, low confidence {})",
            report.total_lines,
            report.speakers.len(),
            report.by_overlap,
            report.by_nearest_segment,
            report.by_narrator,
            report.low_confidence_lines.len()
        );

        Ok(AlignmentOutput { assignments, report })
    }

    fn log_review_lines(&self, lines: &[SubtitleLine], assignments: &[SpeakerAssignment]) {
        let by_index: BTreeMap<usize, &SubtitleLine> = lines.iter().map(|l| (l.index, l)).collect();
        for a in assignments.iter().filter(|a| a.low_confidence) {
            if let Some(line) = by_index.get(&a.subtitle_index) {
                warn!(
                    "Low-confidence speaker for line #{} at {}: {} ({:?}, {:.2}) {:?}",
                    a.subtitle_index,
                    format_timestamp(line.start_ms),
                    a.speaker_id,
                    a.basis,
                    a.confidence,
                    line.text
                );
            }
        }
    }
}

/// Fallback id for a cluster the profile store could not resolve
pub fn episode_scoped_speaker(cluster_id: u32) -> String {
    format!("episode_cluster_{:02}", cluster_id)
}

fn overlap_ms(a_start: u64, a_end: u64, b_start: u64, b_end: u64) -> u64 {
    a_end.min(b_end).saturating_sub(a_start.max(b_start))
}

/// Gap between a line and a segment; zero when they touch or overlap
fn distance_ms(line: &SubtitleLine, seg: &DiarizationSegment) -> u64 {
    if seg.start_ms > line.end_ms {
        seg.start_ms - line.end_ms
    } else if line.start_ms > seg.end_ms {
        line.start_ms - seg.end_ms
    } else {
        0
    }
}

/// Duration-weighted mean midpoint of each cluster's segments
fn cluster_centroids(diarization: &[DiarizationSegment]) -> BTreeMap<u32, f64> {
    let mut sums: BTreeMap<u32, (f64, f64)> = BTreeMap::new();
    for seg in diarization {
        let duration = seg.end_ms.saturating_sub(seg.start_ms).max(1) as f64;
        let mid = (seg.start_ms + seg.end_ms) as f64 / 2.0;
        let entry = sums.entry(seg.cluster_id).or_insert((0.0, 0.0));
        entry.0 += mid * duration;
        entry.1 += duration;
    }
    sums.into_iter().map(|(id, (weighted, total))| (id, weighted / total)).collect()
}

/// Order candidates: larger `primary` first, then closer centroid, then lower id
fn pick_cluster(candidates: BTreeMap<u32, i128>, line: &SubtitleLine, centroids: &BTreeMap<u32, f64>) -> Option<(u32, i128)> {
    let mid = line.midpoint_ms();
    let centroid_distance = |id: u32| centroids.get(&id).map_or(f64::MAX, |c| (c - mid).abs());

    candidates.into_iter().min_by(|(id_a, score_a), (id_b, score_b)| {
        score_b
            .cmp(score_a)
            .then_with(|| centroid_distance(*id_a).total_cmp(&centroid_distance(*id_b)))
            .then_with(|| id_a.cmp(id_b))
    })
}

fn best_overlap_cluster(
    line: &SubtitleLine,
    diarization: &[DiarizationSegment],
    centroids: &BTreeMap<u32, f64>,
) -> Option<(u32, u64)> {
    let mut per_cluster: BTreeMap<u32, i128> = BTreeMap::new();
    for seg in diarization {
        let overlap = overlap_ms(line.start_ms, line.end_ms, seg.start_ms, seg.end_ms);
        if overlap > 0 {
            *per_cluster.entry(seg.cluster_id).or_insert(0) += overlap as i128;
        }
    }
    pick_cluster(per_cluster, line, centroids).map(|(id, overlap)| (id, overlap as u64))
}

fn nearest_cluster(line: &SubtitleLine, diarization: &[DiarizationSegment], centroids: &BTreeMap<u32, f64>) -> (u32, u64) {
    let mut per_cluster: BTreeMap<u32, i128> = BTreeMap::new();
    for seg in diarization {
        // Negated so that the smallest distance ranks first
        let score = -(distance_ms(line, seg) as i128);
        let entry = per_cluster.entry(seg.cluster_id).or_insert(score);
        *entry = (*entry).max(score);
    }
    pick_cluster(per_cluster, line, centroids)
        .map(|(id, score)| (id, (-score) as u64))
        .unwrap_or((diarization[0].cluster_id, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DubError;

    fn line(index: usize, start_ms: u64, end_ms: u64, text: &str) -> SubtitleLine {
        SubtitleLine {
            index,
            start_ms,
            end_ms,
            text: text.to_string(),
            language_tag: "en".to_string(),
            speaker_hint: None,
            style: None,
        }
    }

    fn seg(start_ms: u64, end_ms: u64, cluster_id: u32) -> DiarizationSegment {
        DiarizationSegment::new(start_ms, end_ms, cluster_id)
    }

    /// Maps cluster n to "spk_n"; listed clusters fail to resolve
    struct FixedResolver {
        failing: Vec<u32>,
    }

    #[async_trait]
    impl SpeakerResolver for FixedResolver {
        async fn resolve(&self, cluster_id: u32) -> Result<ResolvedSpeaker> {
            if self.failing.contains(&cluster_id) {
                return Err(DubError::Store("profile store offline".to_string()));
            }
            Ok(ResolvedSpeaker {
                speaker_id: format!("spk_{}", cluster_id),
                reference_clip: Some(PathBuf::from(format!("/refs/{}.wav", cluster_id))),
                minted: cluster_id == 1,
            })
        }
    }

    fn resolver() -> FixedResolver {
        FixedResolver { failing: Vec::new() }
    }

    fn engine() -> AlignmentEngine {
        AlignmentEngine::new(AlignmentConfig::default())
    }

    #[tokio::test]
    async fn test_two_speaker_exchange() {
        let lines = vec![line(0, 0, 2000, "Hi"), line(1, 2000, 4000, "Bye")];
        let diarization = vec![seg(0, 1900, 0), seg(1900, 4000, 1)];

        let output = engine().align(&lines, &diarization, &[], &resolver()).await.unwrap();
        let a = &output.assignments;

        assert_eq!(a.len(), 2);
        assert_eq!((a[0].subtitle_index, a[0].speaker_id.as_str()), (0, "spk_0"));
        assert_eq!((a[1].subtitle_index, a[1].speaker_id.as_str()), (1, "spk_1"));
        assert!(a[0].confidence >= 0.9);
        assert!(a[1].confidence >= 0.9);
        assert!(a.iter().all(|x| x.basis == AssignmentBasis::Overlap && !x.low_confidence));
        assert_eq!(output.report.minted_speakers, vec!["spk_1".to_string()]);
    }

    #[tokio::test]
    async fn test_every_line_assigned_exactly_once() {
        let lines: Vec<SubtitleLine> = (0..25)
            .map(|i| line(i, i as u64 * 1000, i as u64 * 1000 + 800, "line"))
            .collect();
        let diarization = vec![seg(0, 5000, 0), seg(9000, 12000, 1), seg(20000, 21000, 2)];

        let output = engine().align(&lines, &diarization, &[], &resolver()).await.unwrap();
        let indices: BTreeSet<usize> = output.assignments.iter().map(|a| a.subtitle_index).collect();
        assert_eq!(output.assignments.len(), 25);
        assert_eq!(indices.len(), 25);
        assert_eq!(output.report.total_lines, 25);
    }

    #[tokio::test]
    async fn test_single_covering_cluster_gives_one_speaker() {
        let lines = vec![line(0, 100, 900, "a"), line(1, 1200, 3000, "b"), line(2, 5000, 5500, "c")];
        let diarization = vec![seg(0, 6000, 4)];

        let output = engine().align(&lines, &diarization, &[], &resolver()).await.unwrap();
        assert!(output.assignments.iter().all(|a| a.speaker_id == "spk_4"));
        assert_eq!(output.report.speakers.len(), 1);
    }

    #[tokio::test]
    async fn test_no_diarization_means_narrator() {
        let lines = vec![line(0, 0, 1000, "a"), line(1, 2000, 3000, "b")];
        let engine = engine();

        let output = engine.align(&lines, &[], &[], &resolver()).await.unwrap();
        for a in &output.assignments {
            assert_eq!(a.speaker_id, NARRATOR_SPEAKER);
            assert_eq!(a.basis, AssignmentBasis::Narrator);
            assert!(a.confidence < AlignmentConfig::default().low_confidence_threshold);
            assert!(a.low_confidence);
        }
        assert_eq!(output.report.by_narrator, 2);
    }

    #[test]
    fn test_overlap_summed_per_cluster() {
        // Cluster 1 has two short turns that together beat cluster 0
        let lines = vec![line(0, 0, 3000, "x")];
        let diarization = vec![seg(0, 1200, 1), seg(1200, 2200, 0), seg(2200, 3000, 1)];
        let choice = &engine().choose_clusters(&lines, &diarization, &[])[0];
        assert_eq!(choice.cluster_id, Some(1));
        assert!((choice.confidence - 2000.0 / 3000.0).abs() < 1e-9);
    }

    #[test]
    fn test_equal_overlap_prefers_closer_centroid() {
        let lines = vec![line(0, 1000, 3000, "x")];
        // Both overlap 1000 ms; cluster 3 also speaks far away, pulling its centroid off
        let diarization = vec![seg(0, 2000, 3), seg(2000, 3000, 5), seg(40000, 42000, 3)];
        let choice = &engine().choose_clusters(&lines, &diarization, &[])[0];
        assert_eq!(choice.cluster_id, Some(5));
    }

    #[test]
    fn test_full_tie_prefers_lower_cluster() {
        let lines = vec![line(0, 1000, 3000, "x")];
        let diarization = vec![seg(1000, 2000, 7), seg(2000, 3000, 2)];
        // Symmetric around the midpoint: same overlap, same centroid distance
        let choice = &engine().choose_clusters(&lines, &diarization, &[])[0];
        assert_eq!(choice.cluster_id, Some(2));
    }

    #[test]
    fn test_gap_falls_back_to_nearest_segment() {
        let lines = vec![line(0, 5000, 6000, "x")];
        let diarization = vec![seg(0, 1000, 0), seg(6500, 8000, 1)];
        let choice = &engine().choose_clusters(&lines, &diarization, &[])[0];
        assert_eq!(choice.cluster_id, Some(1));
        assert_eq!(choice.basis, AssignmentBasis::NearestSegment);
        let expected = AlignmentConfig::default().fallback_confidence / 1.5;
        assert!((choice.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_point_event_uses_nearest_rule() {
        let lines = vec![line(0, 1500, 1500, "!")];
        let diarization = vec![seg(1000, 2000, 3)];
        let choice = &engine().choose_clusters(&lines, &diarization, &[])[0];
        assert_eq!(choice.cluster_id, Some(3));
        assert_eq!(choice.basis, AssignmentBasis::NearestSegment);
        assert_eq!(choice.confidence, AlignmentConfig::default().fallback_confidence);
    }

    #[test]
    fn test_transcript_corroborates_partial_overlap() {
        let lines = vec![line(0, 0, 2000, "x")];
        let diarization = vec![seg(0, 1000, 0)];
        let confident = vec![TranscriptSegment {
            start_ms: 0,
            end_ms: 2000,
            text: "sou desu ne".to_string(),
            confidence: 0.9,
        }];
        let unsure = vec![TranscriptSegment { confidence: 0.2, ..confident[0].clone() }];

        let engine = engine();
        let base = engine.choose_clusters(&lines, &diarization, &[])[0].confidence;
        let raised = engine.choose_clusters(&lines, &diarization, &confident)[0].confidence;
        let ignored = engine.choose_clusters(&lines, &diarization, &unsure)[0].confidence;

        assert!((base - 0.5).abs() < 1e-9);
        assert!(raised > base && raised <= 1.0);
        assert_eq!(ignored, base);
    }

    #[tokio::test]
    async fn test_resolution_failure_keeps_episode_speaker() {
        let lines = vec![line(0, 0, 2000, "Hi"), line(1, 2000, 4000, "Bye")];
        let diarization = vec![seg(0, 2000, 0), seg(2000, 4000, 1)];
        let resolver = FixedResolver { failing: vec![1] };

        let output = engine().align(&lines, &diarization, &[], &resolver).await.unwrap();
        let second = &output.assignments[1];
        assert_eq!(second.speaker_id, episode_scoped_speaker(1));
        assert!((second.confidence - 0.5).abs() < 1e-9);
        assert!(second.reference_clip.is_none());
        assert_eq!(output.report.unresolved_clusters, vec![1]);
        assert_eq!(output.assignments[0].speaker_id, "spk_0");
    }
}
