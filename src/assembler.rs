// Timeline assembly: place synthesized lines at their subtitle times over the
// accompaniment, fit overlong clips, then level and peak-limit the mix.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::audio::{self, AudioBuffer, SILENCE_RMS};
use crate::config::AssemblyConfig;
use crate::error::Result;
use crate::subtitle::SubtitleLine;

/// Clips shorter than this are levelled by RMS; EBU R128 needs 400 ms blocks
const MIN_GATED_MS: u64 = 400;
const TRUNCATION_FADE_MS: u64 = 20;

/// One synthesized line on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedClip {
    pub subtitle_index: usize,
    pub speaker_id: String,
    pub audio_path: PathBuf,
    pub duration_ms: u64,
}

/// Clip audio with its timeline slot
#[derive(Debug, Clone)]
pub struct TimedClip {
    pub subtitle_index: usize,
    pub start_ms: u64,
    /// Start of the next line, if any
    pub next_start_ms: Option<u64>,
    pub samples: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClipFit {
    AsIs,
    Compressed(f64),
    Truncated,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssemblyStats {
    pub clips_placed: usize,
    pub clips_compressed: usize,
    pub clips_truncated: usize,
    pub clips_skipped: usize,
    pub duration_ms: u64,
    pub peak: f32,
}

pub struct TimelineAssembler {
    config: AssemblyConfig,
}

impl TimelineAssembler {
    pub fn new(config: AssemblyConfig) -> Self {
        Self { config }
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Make a clip fit in `window_samples`: as-is, compressed up to
    /// `max_speedup`, or as a last resort compressed and cut with a fade.
    pub fn fit_clip(&self, samples: Vec<f32>, window_samples: usize) -> (Vec<f32>, ClipFit) {
        if samples.len() <= window_samples || window_samples == 0 {
            return (samples, ClipFit::AsIs);
        }

        let needed = samples.len() as f64 / window_samples as f64;
        if needed <= self.config.max_speedup {
            return (audio::time_stretch(&samples, needed), ClipFit::Compressed(needed));
        }

        let mut fitted = audio::time_stretch(&samples, self.config.max_speedup);
        fitted.truncate(window_samples);
        fade_out(&mut fitted, audio::ms_to_samples(TRUNCATION_FADE_MS, self.config.sample_rate));
        (fitted, ClipFit::Truncated)
    }

    /// Bring one clip to the per-clip loudness target
    fn level_clip(&self, samples: &mut [f32]) -> Result<()> {
        let rate = self.config.sample_rate;
        if audio::rms(samples) < SILENCE_RMS {
            return Ok(());
        }
        if audio::samples_to_ms(samples.len(), rate) >= MIN_GATED_MS
            && audio::normalize_loudness(samples, rate, self.config.clip_loudness_lufs)?.is_some()
        {
            return Ok(());
        }
        let gain = audio::db_to_linear(self.config.clip_loudness_lufs) / audio::rms(samples);
        samples.iter_mut().for_each(|s| *s *= gain);
        Ok(())
    }

    /// Mix clips onto the accompaniment. Everything is at `sample_rate`.
    pub fn mix(&self, clips: Vec<TimedClip>, accompaniment: Vec<f32>) -> Result<(Vec<f32>, AssemblyStats)> {
        let rate = self.config.sample_rate;
        let total = accompaniment.len();
        let tolerance = audio::ms_to_samples(self.config.overlap_tolerance_ms, rate);
        let mut voice = vec![0.0f32; total];
        let mut stats = AssemblyStats::default();

        for clip in clips {
            let start = audio::ms_to_samples(clip.start_ms, rate);
            if start >= total {
                warn!("Clip for line #{} starts past end of track, skipping", clip.subtitle_index);
                stats.clips_skipped += 1;
                continue;
            }

            let to_track_end = total - start;
            let window = match clip.next_start_ms {
                Some(next) => (audio::ms_to_samples(next.saturating_sub(clip.start_ms), rate) + tolerance).min(to_track_end),
                None => to_track_end,
            };

            let mut samples = clip.samples;
            self.level_clip(&mut samples)?;

            let (fitted, fit) = self.fit_clip(samples, window);
            match fit {
                ClipFit::AsIs => {}
                ClipFit::Compressed(factor) => {
                    stats.clips_compressed += 1;
                    debug!("Line #{} compressed by {:.2}x", clip.subtitle_index, factor);
                }
                ClipFit::Truncated => {
                    stats.clips_truncated += 1;
                    warn!("Line #{} exceeds {:.2}x speed-up; truncated", clip.subtitle_index, self.config.max_speedup);
                }
            }

            let end = (start + fitted.len()).min(total);
            for (dst, src) in voice[start..end].iter_mut().zip(fitted.iter()) {
                *dst += *src;
            }
            stats.clips_placed += 1;
        }

        let mut mixed: Vec<f32> = accompaniment.iter().zip(voice.iter()).map(|(a, v)| a + v).collect();

        if let Some(before) = audio::normalize_loudness(&mut mixed, rate, self.config.target_lufs)? {
            debug!("Mix loudness {:.1} LUFS -> {:.1} LUFS", before, self.config.target_lufs);
        }

        let ceiling = audio::db_to_linear(self.config.peak_limit_dbfs);
        let peak = audio::peak(&mixed);
        if peak > ceiling {
            let scale = ceiling / peak;
            mixed.iter_mut().for_each(|s| *s = (*s * scale).clamp(-ceiling, ceiling));
            debug!("Peak limited from {:.3} to {:.3}", peak, ceiling);
        }

        stats.peak = audio::peak(&mixed);
        stats.duration_ms = audio::samples_to_ms(mixed.len(), rate);
        Ok((mixed, stats))
    }

    /// Read clips and accompaniment from disk, mix, and write `output`
    pub fn assemble_files(
        &self,
        clips: &[SynthesizedClip],
        lines: &[SubtitleLine],
        accompaniment: &Path,
        output: &Path,
    ) -> Result<AssemblyStats> {
        let rate = self.config.sample_rate;
        let backing = audio::read_wav(accompaniment)?.resampled(rate);
        info!(
            "Assembling {} dubbed clips onto {:.1}s accompaniment track",
            clips.len(),
            backing.duration_ms() as f64 / 1000.0
        );

        let by_index: BTreeMap<usize, &SubtitleLine> = lines.iter().map(|l| (l.index, l)).collect();
        let mut starts: Vec<u64> = lines.iter().map(|l| l.start_ms).collect();
        starts.sort_unstable();
        starts.dedup();

        let mut timed = Vec::with_capacity(clips.len());
        let mut missing = 0;
        for clip in clips {
            let Some(line) = by_index.get(&clip.subtitle_index) else {
                warn!("Clip refers to unknown line #{}", clip.subtitle_index);
                missing += 1;
                continue;
            };
            let samples = match audio::read_wav(&clip.audio_path) {
                Ok(buffer) => buffer.resampled(rate).samples,
                Err(e) => {
                    warn!("Skipping clip for line #{}: {}", clip.subtitle_index, e);
                    missing += 1;
                    continue;
                }
            };
            let next_start_ms = starts.iter().copied().find(|s| *s > line.start_ms);
            timed.push(TimedClip {
                subtitle_index: clip.subtitle_index,
                start_ms: line.start_ms,
                next_start_ms,
                samples,
            });
        }
        timed.sort_by_key(|c| (c.start_ms, c.subtitle_index));

        let (mixed, mut stats) = self.mix(timed, backing.samples)?;
        stats.clips_skipped += missing;

        audio::write_wav(output, &AudioBuffer::new(mixed, rate))?;
        info!(
            "Assembly complete: {} placed, {} compressed, {} truncated, {} skipped, {:.1}s output",
            stats.clips_placed,
            stats.clips_compressed,
            stats.clips_truncated,
            stats.clips_skipped,
            stats.duration_ms as f64 / 1000.0
        );
        Ok(stats)
    }
}

fn fade_out(samples: &mut [f32], fade_len: usize) {
    let fade_len = fade_len.min(samples.len());
    let len = samples.len();
    for i in 0..fade_len {
        samples[len - 1 - i] *= i as f32 / fade_len as f32;
    }
}
