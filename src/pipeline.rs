// Dubbing stages
//
// Concrete work behind each scheduler stage. Every stage reads the artifacts
// of earlier stages from the ledger and writes its own under
// <work_dir>/episodes/<episode>/<stage>/:
// - extract:  source-language audio, subtitle file, parsed lines
// - separate: vocals and accompaniment stems
// - identify: diarization, transcript, alignment, cluster references
// - clone:    one synthesized clip per line, profile store updated
// - remix:    assembled dub track muxed into a `.partial` container
// - finalize: partial renamed over the output, intermediates removed

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alignment::{AlignmentEngine, AlignmentOutput, ResolvedSpeaker, SpeakerResolver};
use crate::assembler::{SynthesizedClip, TimelineAssembler};
use crate::audio::{self, AudioBuffer};
use crate::config::Config;
use crate::error::{DubError, FailureClass, Result};
use crate::ledger::Stage;
use crate::media::{MediaProcessorFactory, MediaProcessorTrait};
use crate::models::{
    DiarizationSegment, Embedding, ModelAdapterFactory, ModelAdapters, TranscriptSegment, VoiceClonerTrait,
};
use crate::notify::{MediaServerNotifier, NotifierFactory};
use crate::profiles::{VoiceProfileStore, write_atomic};
use crate::scheduler::{StageContext, StageHandler};
use crate::subtitle::{ParseOptions, SubtitleLine, parse_subtitle_file};

pub const SOURCE_AUDIO: &str = "source_audio";
pub const SUBTITLES: &str = "subtitles";
pub const LINES: &str = "lines";
pub const VOCALS: &str = "vocals";
pub const ACCOMPANIMENT: &str = "accompaniment";
pub const DIARIZATION: &str = "diarization";
pub const TRANSCRIPT: &str = "transcript";
pub const ALIGNMENT: &str = "alignment";
pub const SPEAKERS: &str = "speakers";
pub const CLIPS: &str = "clips";
pub const DUB_AUDIO: &str = "dub_audio";
pub const MUXED: &str = "muxed";
pub const OUTPUT: &str = "output";

const REFERENCE_FADE_MS: u64 = 10;
const PROFILES_UPDATED_MARKER: &str = "profiles_updated";
const OUTPUT_MOVED_MARKER: &str = "output_moved";

/// Reference cut for one diarization cluster during Identify
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterReference {
    pub cluster_id: u32,
    pub speaker_id: String,
    pub clip: PathBuf,
    pub embedding: Embedding,
    pub minted: bool,
    pub score: Option<f32>,
}

/// Longest speech of one cluster, concatenated up to `max_ms`.
/// None when less than `min_ms` of non-silent audio is available.
pub fn cluster_reference(
    vocals: &AudioBuffer,
    diarization: &[DiarizationSegment],
    cluster_id: u32,
    min_ms: u64,
    max_ms: u64,
) -> Option<AudioBuffer> {
    let mut turns: Vec<&DiarizationSegment> = diarization.iter().filter(|s| s.cluster_id == cluster_id).collect();
    turns.sort_by(|a, b| {
        (b.end_ms.saturating_sub(b.start_ms))
            .cmp(&a.end_ms.saturating_sub(a.start_ms))
            .then(a.start_ms.cmp(&b.start_ms))
    });

    let fade = audio::ms_to_samples(REFERENCE_FADE_MS, vocals.sample_rate);
    let max_samples = audio::ms_to_samples(max_ms, vocals.sample_rate);
    let mut samples = Vec::new();

    for turn in turns {
        if samples.len() >= max_samples {
            break;
        }
        let mut piece = vocals.slice_ms(turn.start_ms, turn.end_ms);
        if piece.is_silent() {
            continue;
        }
        audio::apply_fades(&mut piece.samples, fade);
        samples.extend_from_slice(&piece.samples);
    }
    samples.truncate(max_samples);

    let reference = AudioBuffer::new(samples, vocals.sample_rate);
    (reference.duration_ms() >= min_ms && !reference.is_silent()).then_some(reference)
}

/// The line's own stretch of the original vocals, padded on both sides
pub fn line_reference(vocals: &AudioBuffer, line: &SubtitleLine, pad_before_ms: u64, pad_after_ms: u64, min_ms: u64) -> Option<AudioBuffer> {
    let clip = vocals.slice_ms(line.start_ms.saturating_sub(pad_before_ms), line.end_ms + pad_after_ms);
    (clip.duration_ms() >= min_ms && !clip.is_silent()).then_some(clip)
}

/// Source-language words spoken in `[start_ms, end_ms)`, for runtimes that
/// condition synthesis on the reference clip's transcript
pub fn reference_prompt_text(transcript: &[TranscriptSegment], start_ms: u64, end_ms: u64) -> Option<String> {
    let text = transcript
        .iter()
        .filter(|s| s.start_ms < end_ms && s.end_ms > start_ms)
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!text.is_empty()).then_some(text)
}

/// `<stem>.partial.<ext>` next to `output`
pub fn partial_output_path(output: &Path) -> PathBuf {
    let stem = output.file_stem().unwrap_or_default().to_string_lossy();
    let name = match output.extension() {
        Some(ext) => format!("{}.partial.{}", stem, ext.to_string_lossy()),
        None => format!("{}.partial", stem),
    };
    output.with_file_name(name)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_atomic(path, &serde_json::to_vec_pretty(value)?)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(DubError::FileNotFound(path.display().to_string()));
    }
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

/// Maps clusters to series speakers by embedding a reference cut from the vocals
struct ClusterResolver<'a> {
    series_id: &'a str,
    vocals: &'a AudioBuffer,
    diarization: &'a [DiarizationSegment],
    cloner: &'a dyn VoiceClonerTrait,
    profiles: &'a VoiceProfileStore,
    min_ms: u64,
    max_ms: u64,
    output_dir: &'a Path,
    cancel: &'a CancellationToken,
    references: Mutex<Vec<ClusterReference>>,
}

impl ClusterResolver<'_> {
    fn into_references(self) -> Vec<ClusterReference> {
        self.references.into_inner().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl SpeakerResolver for ClusterResolver<'_> {
    async fn resolve(&self, cluster_id: u32) -> Result<ResolvedSpeaker> {
        let clip = cluster_reference(self.vocals, self.diarization, cluster_id, self.min_ms, self.max_ms)
            .ok_or_else(|| {
                DubError::Model(format!(
                    "Cluster {} has less than {} ms of usable speech",
                    cluster_id, self.min_ms
                ))
            })?;

        let clip_path = self.output_dir.join(format!("cluster_{:02}.wav", cluster_id));
        audio::write_wav(&clip_path, &clip)?;

        let embedding = self.cloner.embed(&clip_path, self.cancel).await?;
        let outcome = self
            .profiles
            .match_or_create(self.series_id, &embedding, |a, b| self.cloner.similarity(a, b))
            .await?;

        let reference_clip = if outcome.minted {
            clip_path.clone()
        } else {
            self.profiles
                .lookup(self.series_id, &outcome.speaker_id)
                .await?
                .and_then(|p| p.latest_reference().map(Path::to_path_buf))
                .unwrap_or_else(|| clip_path.clone())
        };

        debug!(
            "Cluster {} -> {} ({})",
            cluster_id,
            outcome.speaker_id,
            outcome.score.map_or("new".to_string(), |s| format!("{:.3}", s))
        );

        self.references
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(ClusterReference {
                cluster_id,
                speaker_id: outcome.speaker_id.clone(),
                clip: clip_path,
                embedding,
                minted: outcome.minted,
                score: outcome.score,
            });

        Ok(ResolvedSpeaker {
            speaker_id: outcome.speaker_id,
            reference_clip: Some(reference_clip),
            minted: outcome.minted,
        })
    }
}

pub struct DubbingStages {
    config: Arc<Config>,
    media: Arc<dyn MediaProcessorTrait>,
    models: ModelAdapters,
    profiles: Arc<VoiceProfileStore>,
    notifier: Arc<dyn MediaServerNotifier>,
    alignment: AlignmentEngine,
}

impl DubbingStages {
    pub fn new(
        config: Arc<Config>,
        media: Arc<dyn MediaProcessorTrait>,
        models: ModelAdapters,
        profiles: Arc<VoiceProfileStore>,
        notifier: Arc<dyn MediaServerNotifier>,
    ) -> Self {
        let alignment = AlignmentEngine::new(config.alignment.clone());
        Self {
            config,
            media,
            models,
            profiles,
            notifier,
            alignment,
        }
    }

    /// Stages backed by the configured commands, ffmpeg and notifier
    pub fn from_config(config: Arc<Config>, profiles: Arc<VoiceProfileStore>) -> Result<Self> {
        let media = MediaProcessorFactory::create_processor(config.media.clone());
        let models = ModelAdapterFactory::create_from_config(&config.models);
        let notifier = NotifierFactory::create_from_config(&config.notifier)?;
        Ok(Self::new(config, media, models, profiles, notifier))
    }

    async fn extract(&self, ctx: &StageContext) -> Result<BTreeMap<String, PathBuf>> {
        let dir = ctx.episode_dir.join(Stage::Extract.as_str());
        let input = &ctx.spec.input_path;
        if !input.exists() {
            return Err(DubError::FileNotFound(input.display().to_string()));
        }

        let language = &self.config.language;
        let audio_path = dir.join("source.wav");
        self.media.extract_audio_track(input, &language.source, &audio_path).await?;

        let subtitle_path = self
            .media
            .extract_subtitles(input, &language.subtitle, &dir)
            .await?
            .ok_or_else(|| {
                DubError::Input(format!(
                    "No '{}' subtitles embedded in or next to {}",
                    language.subtitle,
                    input.display()
                ))
            })?;

        let options = ParseOptions::new(&language.subtitle, &self.config.subtitles);
        let parsed = parse_subtitle_file(&subtitle_path, &options).await?;
        if parsed.dialogue_count() == 0 {
            return Err(DubError::Input(format!(
                "No dialogue lines in {} ({})",
                subtitle_path.display(),
                parsed.summary()
            )));
        }
        info!("{}", parsed.summary());

        let lines_path = dir.join("lines.json");
        write_json(&lines_path, &parsed.lines)?;

        Ok(BTreeMap::from([
            (SOURCE_AUDIO.to_string(), audio_path),
            (SUBTITLES.to_string(), subtitle_path),
            (LINES.to_string(), lines_path),
        ]))
    }

    async fn separate(&self, ctx: &StageContext) -> Result<BTreeMap<String, PathBuf>> {
        let dir = ctx.episode_dir.join(Stage::Separate.as_str());
        let audio = ctx.artifact(SOURCE_AUDIO)?;
        let stems = self.models.separator.separate(audio, &dir, &ctx.cancel).await?;

        Ok(BTreeMap::from([
            (VOCALS.to_string(), stems.vocals),
            (ACCOMPANIMENT.to_string(), stems.accompaniment),
        ]))
    }

    async fn identify(&self, ctx: &StageContext) -> Result<BTreeMap<String, PathBuf>> {
        let dir = ctx.episode_dir.join(Stage::Identify.as_str());
        tokio::fs::create_dir_all(&dir).await?;

        let lines: Vec<SubtitleLine> = read_json(ctx.artifact(LINES)?).await?;
        let vocals_path = ctx.artifact(VOCALS)?;

        let diarization = self.models.diarizer.diarize(vocals_path, &ctx.cancel).await?;
        info!("Diarization found {} segments", diarization.len());

        let transcript = self
            .models
            .transcriber
            .transcribe(vocals_path, &self.config.language.source, &ctx.cancel)
            .await?;
        info!("Transcript has {} segments", transcript.len());

        let vocals = audio::read_wav(vocals_path)?;
        let resolver = ClusterResolver {
            series_id: &ctx.spec.series_id,
            vocals: &vocals,
            diarization: &diarization,
            cloner: self.models.cloner.as_ref(),
            profiles: &self.profiles,
            min_ms: self.config.alignment.reference_min_ms,
            max_ms: self.config.alignment.reference_max_ms,
            output_dir: &dir,
            cancel: &ctx.cancel,
            references: Mutex::new(Vec::new()),
        };

        let output = self.alignment.align(&lines, &diarization, &transcript, &resolver).await?;
        if ctx.cancel.is_cancelled() {
            return Err(DubError::Cancelled("identify interrupted during speaker resolution".to_string()));
        }
        let references = resolver.into_references();

        let diarization_path = dir.join("diarization.json");
        let transcript_path = dir.join("transcript.json");
        let alignment_path = dir.join("alignment.json");
        let speakers_path = dir.join("speakers.json");
        write_json(&diarization_path, &diarization)?;
        write_json(&transcript_path, &transcript)?;
        write_json(&alignment_path, &output)?;
        write_json(&speakers_path, &references)?;

        Ok(BTreeMap::from([
            (DIARIZATION.to_string(), diarization_path),
            (TRANSCRIPT.to_string(), transcript_path),
            (ALIGNMENT.to_string(), alignment_path),
            (SPEAKERS.to_string(), speakers_path),
        ]))
    }

    async fn clone_voices(&self, ctx: &StageContext) -> Result<BTreeMap<String, PathBuf>> {
        let dir = ctx.episode_dir.join(Stage::Clone.as_str());
        let refs_dir = dir.join("refs");
        let clips_dir = dir.join("clips");
        tokio::fs::create_dir_all(&clips_dir).await?;

        let lines: Vec<SubtitleLine> = read_json(ctx.artifact(LINES)?).await?;
        let alignment: AlignmentOutput = read_json(ctx.artifact(ALIGNMENT)?).await?;
        let transcript: Vec<TranscriptSegment> = read_json(ctx.artifact(TRANSCRIPT)?).await?;
        let vocals = audio::read_wav(ctx.artifact(VOCALS)?)?;
        let assembly = &self.config.assembly;

        let by_index: BTreeMap<usize, &SubtitleLine> = lines.iter().map(|l| (l.index, l)).collect();
        let total = alignment.assignments.len();
        let mut clips = Vec::with_capacity(total);
        let mut reused = 0;
        let mut failed = 0;

        for (n, assignment) in alignment.assignments.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(DubError::Cancelled(format!("stopped after {} of {} lines", n, total)));
            }
            let Some(line) = by_index.get(&assignment.subtitle_index) else {
                warn!("Assignment for unknown line #{}", assignment.subtitle_index);
                continue;
            };

            let clip_path = clips_dir.join(format!("line_{:04}.wav", line.index));
            // Clips left by an interrupted attempt are kept if readable
            match audio::read_wav(&clip_path) {
                Ok(existing) if !existing.is_empty() => {
                    clips.push(SynthesizedClip {
                        subtitle_index: line.index,
                        speaker_id: assignment.speaker_id.clone(),
                        audio_path: clip_path,
                        duration_ms: existing.duration_ms(),
                    });
                    reused += 1;
                    continue;
                }
                _ => {}
            }

            let own_reference = line_reference(
                &vocals,
                line,
                assembly.reference_pad_before_ms,
                assembly.reference_pad_after_ms,
                assembly.line_reference_min_ms,
            );
            // Only the line's own cut has a known transcript
            let (reference, prompt_text) = match own_reference {
                Some(buffer) => {
                    let path = refs_dir.join(format!("line_{:04}.wav", line.index));
                    audio::write_wav(&path, &buffer)?;
                    let prompt = reference_prompt_text(
                        &transcript,
                        line.start_ms.saturating_sub(assembly.reference_pad_before_ms),
                        line.end_ms + assembly.reference_pad_after_ms,
                    );
                    (Some(path), prompt)
                }
                None => (assignment.reference_clip.clone(), None),
            };

            let synthesized = self
                .models
                .cloner
                .synthesize(
                    &line.text,
                    reference.as_deref(),
                    prompt_text.as_deref(),
                    &self.config.language.target,
                    &clip_path,
                    &ctx.cancel,
                )
                .await;
            match synthesized {
                Ok(()) => {}
                Err(e) if e.class() == FailureClass::Model => {
                    warn!("Skipping line #{} ({}): {}", line.index, line.text, e);
                    failed += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let rendered = match audio::read_wav(&clip_path) {
                Ok(rendered) if !rendered.is_empty() => rendered,
                Ok(_) => {
                    warn!("Skipping line #{}: synthesizer wrote an empty clip", line.index);
                    failed += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Skipping line #{}: unreadable clip: {}", line.index, e);
                    failed += 1;
                    continue;
                }
            };
            debug!(
                "Line #{} as {} ({} ms): {}",
                line.index,
                assignment.speaker_id,
                rendered.duration_ms(),
                line.text
            );
            clips.push(SynthesizedClip {
                subtitle_index: line.index,
                speaker_id: assignment.speaker_id.clone(),
                audio_path: clip_path,
                duration_ms: rendered.duration_ms(),
            });

            if (n + 1) % 25 == 0 {
                info!("Synthesized {}/{} lines", n + 1, total);
            }
        }

        if clips.is_empty() {
            return Err(DubError::Model(format!(
                "No dubbed clips were synthesized ({} lines failed)",
                failed
            )));
        }
        info!(
            "Synthesized {} clips ({} reused from an earlier attempt, {} failed)",
            clips.len(),
            reused,
            failed
        );

        self.update_profiles(ctx, &dir).await?;

        let clips_path = dir.join("clips.json");
        write_json(&clips_path, &clips)?;
        Ok(BTreeMap::from([(CLIPS.to_string(), clips_path)]))
    }

    /// Append this episode's cluster references to the series profiles, once
    async fn update_profiles(&self, ctx: &StageContext, dir: &Path) -> Result<()> {
        let marker = dir.join(PROFILES_UPDATED_MARKER);
        if marker.exists() {
            return Ok(());
        }

        let references: Vec<ClusterReference> = read_json(ctx.artifact(SPEAKERS)?).await?;
        for reference in &references {
            if let Err(e) = self
                .profiles
                .append_reference_with_embedding(
                    &ctx.spec.series_id,
                    &reference.speaker_id,
                    &reference.clip,
                    &reference.embedding,
                )
                .await
            {
                warn!("Voice profile {} not updated: {}", reference.speaker_id, e);
            }
        }

        tokio::fs::write(&marker, b"").await?;
        Ok(())
    }

    async fn remix(&self, ctx: &StageContext) -> Result<BTreeMap<String, PathBuf>> {
        let dir = ctx.episode_dir.join(Stage::Remix.as_str());
        let lines: Vec<SubtitleLine> = read_json(ctx.artifact(LINES)?).await?;
        let clips: Vec<SynthesizedClip> = read_json(ctx.artifact(CLIPS)?).await?;
        let accompaniment = ctx.artifact(ACCOMPANIMENT)?.clone();
        let dub_path = dir.join("dub.wav");

        let assembler = TimelineAssembler::new(self.config.assembly.clone());
        let output = dub_path.clone();
        let stats = tokio::task::spawn_blocking(move || assembler.assemble_files(&clips, &lines, &accompaniment, &output))
            .await
            .map_err(|e| DubError::Resource(format!("Assembly task failed: {}", e)))??;

        if ctx.cancel.is_cancelled() {
            return Err(DubError::Cancelled("stopped before mux".to_string()));
        }

        let muxed = partial_output_path(&ctx.spec.output_path);
        self.media
            .mux_dubbed_audio(&ctx.spec.input_path, &dub_path, &muxed, &self.config.language.target)
            .await?;

        write_json(&dir.join("assembly.json"), &stats)?;
        Ok(BTreeMap::from([
            (DUB_AUDIO.to_string(), dub_path),
            (MUXED.to_string(), muxed),
        ]))
    }

    async fn finalize(&self, ctx: &StageContext) -> Result<BTreeMap<String, PathBuf>> {
        let muxed = ctx.artifact(MUXED)?;
        let output = &ctx.spec.output_path;

        // Written before the rename: a re-run after a crash that finds the
        // marker and no partial file knows the output is already the dub
        let marker = ctx.episode_dir.join(OUTPUT_MOVED_MARKER);

        if muxed.exists() {
            tokio::fs::create_dir_all(&ctx.episode_dir).await?;
            tokio::fs::write(&marker, b"").await?;
            tokio::fs::rename(muxed, output)
                .await
                .map_err(|e| DubError::Mux(format!("Failed to move {} into place: {}", muxed.display(), e)))?;
            info!("Dubbed episode written to {}", output.display());
        } else if output.exists() && (marker.exists() || *output != ctx.spec.input_path) {
            warn!("{} already in place; partial file gone", output.display());
        } else {
            return Err(DubError::Input(format!(
                "Muxed file {} is missing; retry from remix",
                muxed.display()
            )));
        }

        if !self.config.paths.keep_intermediates {
            for stage in [Stage::Extract, Stage::Separate, Stage::Clone, Stage::Remix] {
                let path = ctx.episode_dir.join(stage.as_str());
                if path.exists() {
                    if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                        warn!("Failed to remove {}: {}", path.display(), e);
                    }
                }
            }
        }

        let notifier = self.notifier.clone();
        let episode_id = ctx.spec.episode_id.clone();
        let notified = output.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&episode_id, &notified).await {
                warn!("Media server refresh for {} failed: {}", episode_id, e);
            }
        });

        Ok(BTreeMap::from([(OUTPUT.to_string(), output.clone())]))
    }
}

#[async_trait]
impl StageHandler for DubbingStages {
    async fn run_stage(&self, stage: Stage, ctx: &StageContext) -> Result<BTreeMap<String, PathBuf>> {
        match stage {
            Stage::Extract => self.extract(ctx).await,
            Stage::Separate => self.separate(ctx).await,
            Stage::Identify => self.identify(ctx).await,
            Stage::Clone => self.clone_voices(ctx).await,
            Stage::Remix => self.remix(ctx).await,
            Stage::Finalize => self.finalize(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{EpisodeSpec, StageLedger};
    use crate::media::MediaProbe;
    use crate::models::{DiarizerTrait, SeparatedStems, SeparatorTrait, TranscriberTrait, TranscriptSegment};
    use crate::notify::NoopNotifier;
    use crate::scheduler::Scheduler;

    const RATE: u32 = 16_000;

    fn tone(ms: u64, rate: u32, freq: f32, amp: f32) -> AudioBuffer {
        let samples = (0..audio::ms_to_samples(ms, rate))
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect();
        AudioBuffer::new(samples, rate)
    }

    struct FakeMedia;

    #[async_trait]
    impl MediaProcessorTrait for FakeMedia {
        async fn probe(&self, _media_path: &Path) -> Result<MediaProbe> {
            Err(DubError::Media("not probed in tests".to_string()))
        }

        async fn extract_audio_track(&self, _video: &Path, _language: &str, audio_path: &Path) -> Result<()> {
            audio::write_wav(audio_path, &tone(4000, RATE, 220.0, 0.4))
        }

        async fn extract_subtitles(&self, _video: &Path, _language: &str, output_dir: &Path) -> Result<Option<PathBuf>> {
            std::fs::create_dir_all(output_dir)?;
            let path = output_dir.join("subs.srt");
            std::fs::write(
                &path,
                "1\n00:00:00,500 --> 00:00:01,500\nHello there.\n\n2\n00:00:02,000 --> 00:00:03,000\nGoodbye.\n",
            )?;
            Ok(Some(path))
        }

        async fn mux_dubbed_audio(&self, _source: &Path, dubbed: &Path, output: &Path, _language: &str) -> Result<()> {
            std::fs::copy(dubbed, output)?;
            Ok(())
        }

        async fn check_availability(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeSeparator;

    #[async_trait]
    impl SeparatorTrait for FakeSeparator {
        async fn separate(&self, audio_in: &Path, output_dir: &Path, _cancel: &CancellationToken) -> Result<SeparatedStems> {
            std::fs::create_dir_all(output_dir)?;
            let vocals = output_dir.join("vocals.wav");
            let accompaniment = output_dir.join("no_vocals.wav");
            std::fs::copy(audio_in, &vocals)?;
            audio::write_wav(&accompaniment, &tone(4000, RATE, 110.0, 0.05))?;
            Ok(SeparatedStems { vocals, accompaniment })
        }
    }

    struct FakeDiarizer;

    #[async_trait]
    impl DiarizerTrait for FakeDiarizer {
        async fn diarize(&self, _vocals: &Path, _cancel: &CancellationToken) -> Result<Vec<DiarizationSegment>> {
            Ok(vec![DiarizationSegment::new(0, 1800, 0), DiarizationSegment::new(1800, 4000, 1)])
        }
    }

    struct FakeTranscriber;

    #[async_trait]
    impl TranscriberTrait for FakeTranscriber {
        async fn transcribe(&self, _vocals: &Path, _language: &str, _cancel: &CancellationToken) -> Result<Vec<TranscriptSegment>> {
            Ok(vec![TranscriptSegment {
                start_ms: 400,
                end_ms: 1600,
                text: "こんにちは".to_string(),
                confidence: 0.9,
            }])
        }
    }

    /// Embeds cluster clips by their file name so matching is predictable
    struct FakeCloner;

    #[async_trait]
    impl VoiceClonerTrait for FakeCloner {
        async fn embed(&self, clip: &Path, _cancel: &CancellationToken) -> Result<Embedding> {
            let name = clip.file_name().unwrap_or_default().to_string_lossy().into_owned();
            Ok(if name.contains("cluster_00") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
        }

        async fn synthesize(
            &self,
            _text: &str,
            _reference: Option<&Path>,
            _prompt_text: Option<&str>,
            _language: &str,
            output: &Path,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            audio::write_wav(output, &tone(800, 22_050, 330.0, 0.3))
        }
    }

    /// FakeCloner that records prompts and cannot voice one line
    struct FlakyCloner {
        fails_on: &'static str,
        prompts: Mutex<Vec<(String, Option<String>)>>,
    }

    #[async_trait]
    impl VoiceClonerTrait for FlakyCloner {
        async fn embed(&self, clip: &Path, cancel: &CancellationToken) -> Result<Embedding> {
            FakeCloner.embed(clip, cancel).await
        }

        async fn synthesize(
            &self,
            text: &str,
            _reference: Option<&Path>,
            prompt_text: Option<&str>,
            _language: &str,
            output: &Path,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.prompts
                .lock()
                .unwrap()
                .push((text.to_string(), prompt_text.map(str::to_string)));
            if text == self.fails_on {
                return Err(DubError::Model("synthesizer returned no audio".to_string()));
            }
            audio::write_wav(output, &tone(800, 22_050, 330.0, 0.3))
        }
    }

    fn stages(config: Arc<Config>) -> Arc<DubbingStages> {
        let profiles = Arc::new(VoiceProfileStore::new(
            config.paths.profile_dir.clone(),
            config.alignment.similarity_threshold,
        ));
        let models = ModelAdapters {
            separator: Arc::new(FakeSeparator),
            diarizer: Arc::new(FakeDiarizer),
            transcriber: Arc::new(FakeTranscriber),
            cloner: Arc::new(FakeCloner),
        };
        Arc::new(DubbingStages::new(config, Arc::new(FakeMedia), models, profiles, Arc::new(NoopNotifier)))
    }

    fn config(root: &Path) -> Config {
        let mut config = Config::default();
        config.paths.work_dir = root.join("work");
        config.paths.profile_dir = root.join("profiles");
        config.assembly.sample_rate = RATE;
        config
    }

    fn episode(root: &Path, name: &str) -> EpisodeSpec {
        let input = root.join("show").join(format!("{}.mkv", name));
        std::fs::create_dir_all(input.parent().unwrap()).unwrap();
        std::fs::write(&input, b"not really a video").unwrap();
        EpisodeSpec {
            episode_id: name.to_string(),
            series_id: "show".to_string(),
            input_path: input.clone(),
            output_path: input,
            enqueued_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_cluster_reference_prefers_longest_turns() {
        let vocals = tone(6000, 1000, 50.0, 0.5);
        let diarization = vec![
            DiarizationSegment::new(0, 500, 0),
            DiarizationSegment::new(1000, 3000, 0),
            DiarizationSegment::new(3000, 6000, 1),
        ];
        let reference = cluster_reference(&vocals, &diarization, 0, 1500, 2200).unwrap();
        assert_eq!(reference.duration_ms(), 2200);
        assert!(cluster_reference(&vocals, &diarization, 0, 5000, 10000).is_none());
        assert!(cluster_reference(&vocals, &diarization, 7, 100, 1000).is_none());
    }

    #[test]
    fn test_line_reference_skips_silence_and_short_lines() {
        let mut samples = vec![0.0; 2000];
        samples.extend(tone(2000, 1000, 50.0, 0.5).samples);
        let vocals = AudioBuffer::new(samples, 1000);
        let line = |start_ms, end_ms| SubtitleLine {
            index: 0,
            start_ms,
            end_ms,
            text: "x".to_string(),
            language_tag: "en".to_string(),
            speaker_hint: None,
            style: None,
        };

        assert!(line_reference(&vocals, &line(300, 1200), 200, 300, 500).is_none());
        assert_eq!(line_reference(&vocals, &line(2500, 3500), 200, 300, 500).unwrap().duration_ms(), 1500);
        assert!(line_reference(&vocals, &line(2500, 2600), 0, 0, 500).is_none());
    }

    #[test]
    fn test_reference_prompt_text_joins_overlapping_segments() {
        let segment = |start_ms, end_ms, text: &str| TranscriptSegment {
            start_ms,
            end_ms,
            text: text.to_string(),
            confidence: 0.9,
        };
        let transcript = vec![
            segment(0, 1000, "おはよう"),
            segment(1000, 2000, " 元気? "),
            segment(5000, 6000, "またね"),
        ];
        assert_eq!(
            reference_prompt_text(&transcript, 500, 1500).as_deref(),
            Some("おはよう 元気?")
        );
        assert_eq!(reference_prompt_text(&transcript, 2000, 5000), None);
    }

    #[test]
    fn test_partial_output_path_keeps_extension() {
        assert_eq!(
            partial_output_path(Path::new("/lib/show/ep01.mkv")),
            PathBuf::from("/lib/show/ep01.partial.mkv")
        );
        assert_eq!(partial_output_path(Path::new("ep01")), PathBuf::from("ep01.partial"));
    }

    #[tokio::test]
    async fn test_episodes_dubbed_end_to_end_and_speakers_carry_over() {
        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(config(temp.path()));
        let ledger = Arc::new(StageLedger::new(config.paths.work_dir.clone()));
        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            ledger.clone(),
            stages(config.clone()),
            config.episodes_dir(),
        );

        let first = episode(temp.path(), "ep01");
        scheduler.enqueue(&first).unwrap();
        let summary = scheduler.run().await.unwrap();
        assert_eq!(summary.completed, vec!["ep01".to_string()]);

        // In-place output now holds the dub track
        let written = audio::read_wav(&first.output_path).unwrap();
        assert_eq!(written.sample_rate, RATE);
        assert!(!partial_output_path(&first.output_path).exists());
        assert!(!config.episodes_dir().join("ep01").join("clone").exists());

        let alignment: AlignmentOutput =
            read_json(&config.episodes_dir().join("ep01/identify/alignment.json")).await.unwrap();
        let speakers: Vec<&str> = alignment.assignments.iter().map(|a| a.speaker_id.as_str()).collect();
        assert_eq!(speakers, vec!["spk_0001", "spk_0002"]);

        let store = VoiceProfileStore::new(config.paths.profile_dir.clone(), 0.75);
        let profiles = store.list("show").await.unwrap();
        assert_eq!(profiles.len(), 2);
        assert!(profiles.iter().all(|p| p.reference_clips.len() == 1));

        // Same voices in the next episode resolve to the existing speakers
        let second = episode(temp.path(), "ep02");
        scheduler.enqueue(&second).unwrap();
        assert_eq!(scheduler.run().await.unwrap().completed.len(), 1);

        let profiles = store.list("show").await.unwrap();
        assert_eq!(profiles.len(), 2);
        assert!(profiles.iter().all(|p| p.reference_clips.len() == 2));
    }

    #[tokio::test]
    async fn test_failed_line_is_skipped_and_prompt_text_passed() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = config(temp.path());
        config.paths.keep_intermediates = true;
        let config = Arc::new(config);

        let cloner = Arc::new(FlakyCloner {
            fails_on: "Goodbye.",
            prompts: Mutex::new(Vec::new()),
        });
        let profiles = Arc::new(VoiceProfileStore::new(config.paths.profile_dir.clone(), 0.75));
        let models = ModelAdapters {
            separator: Arc::new(FakeSeparator),
            diarizer: Arc::new(FakeDiarizer),
            transcriber: Arc::new(FakeTranscriber),
            cloner: cloner.clone(),
        };
        let stages = Arc::new(DubbingStages::new(
            config.clone(),
            Arc::new(FakeMedia),
            models,
            profiles,
            Arc::new(NoopNotifier),
        ));
        let ledger = Arc::new(StageLedger::new(config.paths.work_dir.clone()));
        let scheduler = Scheduler::new(config.scheduler.clone(), ledger, stages, config.episodes_dir());

        scheduler.enqueue(&episode(temp.path(), "ep01")).unwrap();
        let summary = scheduler.run().await.unwrap();
        assert_eq!(summary.completed, vec!["ep01".to_string()]);

        let clips: Vec<SynthesizedClip> =
            read_json(&config.episodes_dir().join("ep01/clone/clips.json")).await.unwrap();
        let placed: Vec<usize> = clips.iter().map(|c| c.subtitle_index).collect();
        assert_eq!(placed.len(), 1);

        // The failing line was tried once; the stage did not retry
        let prompts = cloner.prompts.lock().unwrap().clone();
        assert_eq!(
            prompts,
            vec![
                ("Hello there.".to_string(), Some("こんにちは".to_string())),
                ("Goodbye.".to_string(), None),
            ]
        );
    }

    #[tokio::test]
    async fn test_finalize_rerun_after_in_place_rename_succeeds() {
        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(config(temp.path()));
        let stages = stages(config.clone());

        let spec = episode(temp.path(), "ep01");
        let muxed = partial_output_path(&spec.output_path);
        std::fs::write(&muxed, b"dubbed").unwrap();
        let ctx = StageContext {
            episode_dir: config.episodes_dir().join("ep01"),
            artifacts: BTreeMap::from([(MUXED.to_string(), muxed.clone())]),
            spec,
            attempt: 1,
            cancel: CancellationToken::new(),
        };

        stages.run_stage(Stage::Finalize, &ctx).await.unwrap();
        assert!(!muxed.exists());
        assert_eq!(std::fs::read(&ctx.spec.output_path).unwrap(), b"dubbed");

        // Crash before Done landed: Finalize runs again with the partial gone
        let rerun = StageContext { attempt: 2, ..ctx };
        let artifacts = stages.run_stage(Stage::Finalize, &rerun).await.unwrap();
        assert_eq!(artifacts.get(OUTPUT), Some(&rerun.spec.output_path));
        assert_eq!(std::fs::read(&rerun.spec.output_path).unwrap(), b"dubbed");
    }

    #[tokio::test]
    async fn test_finalize_without_partial_or_marker_is_error() {
        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(config(temp.path()));
        let stages = stages(config.clone());

        let spec = episode(temp.path(), "ep01");
        let ctx = StageContext {
            episode_dir: config.episodes_dir().join("ep01"),
            artifacts: BTreeMap::from([(MUXED.to_string(), partial_output_path(&spec.output_path))]),
            spec,
            attempt: 1,
            cancel: CancellationToken::new(),
        };
        let err = stages.run_stage(Stage::Finalize, &ctx).await.unwrap_err();
        assert_eq!(err.class(), crate::error::FailureClass::Input);
    }

    #[tokio::test]
    async fn test_missing_subtitles_is_input_error() {
        struct NoSubs;

        #[async_trait]
        impl MediaProcessorTrait for NoSubs {
            async fn probe(&self, _media_path: &Path) -> Result<MediaProbe> {
                Err(DubError::Media("unused".to_string()))
            }
            async fn extract_audio_track(&self, _video: &Path, _language: &str, audio_path: &Path) -> Result<()> {
                audio::write_wav(audio_path, &tone(100, RATE, 220.0, 0.4))
            }
            async fn extract_subtitles(&self, _video: &Path, _language: &str, _dir: &Path) -> Result<Option<PathBuf>> {
                Ok(None)
            }
            async fn mux_dubbed_audio(&self, _s: &Path, _d: &Path, _o: &Path, _l: &str) -> Result<()> {
                Ok(())
            }
            async fn check_availability(&self) -> Result<()> {
                Ok(())
            }
        }

        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(config(temp.path()));
        let profiles = Arc::new(VoiceProfileStore::new(config.paths.profile_dir.clone(), 0.75));
        let models = ModelAdapters {
            separator: Arc::new(FakeSeparator),
            diarizer: Arc::new(FakeDiarizer),
            transcriber: Arc::new(FakeTranscriber),
            cloner: Arc::new(FakeCloner),
        };
        let stages = DubbingStages::new(config.clone(), Arc::new(NoSubs), models, profiles, Arc::new(NoopNotifier));

        let spec = episode(temp.path(), "ep01");
        let ctx = StageContext {
            episode_dir: config.episodes_dir().join("ep01"),
            spec,
            artifacts: BTreeMap::new(),
            attempt: 1,
            cancel: CancellationToken::new(),
        };
        let err = stages.run_stage(Stage::Extract, &ctx).await.unwrap_err();
        assert_eq!(err.class(), crate::error::FailureClass::Input);
    }
}
