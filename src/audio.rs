// Mono PCM helpers shared by reference slicing and dub assembly.
use std::path::Path;

use crate::error::{DubError, Result};

/// Below this RMS a clip is treated as silence
pub const SILENCE_RMS: f32 = 1e-4;

/// Mono samples in [-1.0, 1.0] at a fixed rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    #[cfg(test)]
    pub fn silence(duration_ms: u64, sample_rate: u32) -> Self {
        Self::new(vec![0.0; ms_to_samples(duration_ms, sample_rate)], sample_rate)
    }

    pub fn duration_ms(&self) -> u64 {
        samples_to_ms(self.samples.len(), self.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Copy of `[start_ms, end_ms)`, clamped to the buffer
    pub fn slice_ms(&self, start_ms: u64, end_ms: u64) -> AudioBuffer {
        let len = self.samples.len();
        let start = ms_to_samples(start_ms, self.sample_rate).min(len);
        let end = ms_to_samples(end_ms, self.sample_rate).clamp(start, len);
        AudioBuffer::new(self.samples[start..end].to_vec(), self.sample_rate)
    }

    pub fn resampled(&self, target_rate: u32) -> AudioBuffer {
        AudioBuffer::new(resample_linear(&self.samples, self.sample_rate, target_rate), target_rate)
    }

    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    pub fn peak(&self) -> f32 {
        peak(&self.samples)
    }

    pub fn is_silent(&self) -> bool {
        self.is_empty() || self.rms() < SILENCE_RMS
    }
}

pub fn ms_to_samples(ms: u64, sample_rate: u32) -> usize {
    ((ms as u128 * sample_rate as u128) / 1000) as usize
}

pub fn samples_to_ms(samples: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    ((samples as u128 * 1000) / sample_rate as u128) as u64
}

/// Read any PCM WAV, downmixing to mono.
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(DubError::FileNotFound(path.display().to_string()));
    }

    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(AudioBuffer::new(samples, spec.sample_rate))
}

/// Write 16-bit mono PCM, creating parent directories.
pub fn write_wav<P: AsRef<Path>>(path: P, buffer: &AudioBuffer) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in &buffer.samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer.write_sample((clamped * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Linear-interpolation resampler.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let target_len = ((samples.len() as u128 * to_rate as u128) / from_rate as u128).max(1) as usize;
    interpolate_to_len(samples, target_len)
}

/// Shorten (factor > 1) or lengthen (factor < 1) a clip by resampling.
/// Pitch moves with speed.
pub fn time_stretch(samples: &[f32], factor: f64) -> Vec<f32> {
    if samples.is_empty() || factor <= 0.0 || (factor - 1.0).abs() < f64::EPSILON {
        return samples.to_vec();
    }
    let target_len = ((samples.len() as f64 / factor).round() as usize).max(1);
    interpolate_to_len(samples, target_len)
}

fn interpolate_to_len(samples: &[f32], target_len: usize) -> Vec<f32> {
    if target_len == samples.len() {
        return samples.to_vec();
    }
    if samples.len() == 1 || target_len == 1 {
        return vec![samples[0]; target_len];
    }

    let step = (samples.len() - 1) as f64 / (target_len - 1) as f64;
    (0..target_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&x| x * x).sum::<f32>() / samples.len() as f32).sqrt()
}

pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |max, &s| max.max(s.abs()))
}

pub fn db_to_linear(db: f64) -> f32 {
    10f64.powf(db / 20.0) as f32
}

/// Integrated EBU R128 loudness in LUFS; None for silence or clips too short to gate.
pub fn integrated_loudness(samples: &[f32], sample_rate: u32) -> Result<Option<f64>> {
    if samples.is_empty() {
        return Ok(None);
    }

    let mut meter = ebur128::EbuR128::new(1, sample_rate, ebur128::Mode::I)
        .map_err(|e| DubError::Audio(format!("Failed to create EBU R128 meter: {}", e)))?;
    meter
        .add_frames_f32(samples)
        .map_err(|e| DubError::Audio(format!("Failed to measure loudness: {}", e)))?;

    let lufs = meter
        .loudness_global()
        .map_err(|e| DubError::Audio(format!("Failed to read loudness: {}", e)))?;

    Ok(Some(lufs).filter(|l| l.is_finite()))
}

/// Gain a clip toward `target_lufs`. Clips that cannot be measured are left alone.
pub fn normalize_loudness(samples: &mut [f32], sample_rate: u32, target_lufs: f64) -> Result<Option<f64>> {
    let Some(current) = integrated_loudness(samples, sample_rate)? else {
        return Ok(None);
    };
    let gain = db_to_linear(target_lufs - current);
    samples.iter_mut().for_each(|s| *s *= gain);
    Ok(Some(current))
}

/// Linear fade-in and fade-out over `fade_len` samples each.
pub fn apply_fades(samples: &mut [f32], fade_len: usize) {
    let fade_len = fade_len.min(samples.len() / 2);
    if fade_len == 0 {
        return;
    }
    let len = samples.len();
    for i in 0..fade_len {
        let g = i as f32 / fade_len as f32;
        samples[i] *= g;
        samples[len - 1 - i] *= g;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, ms: u64, rate: u32, amp: f32) -> Vec<f32> {
        let n = ms_to_samples(ms, rate);
        (0..n)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_sample_conversions() {
        assert_eq!(ms_to_samples(1000, 44100), 44100);
        assert_eq!(ms_to_samples(500, 16000), 8000);
        assert_eq!(samples_to_ms(22050, 44100), 500);
    }

    #[test]
    fn test_slice_clamps_to_bounds() {
        let buf = AudioBuffer::new(vec![0.5; 1000], 1000);
        assert_eq!(buf.slice_ms(200, 400).samples.len(), 200);
        assert_eq!(buf.slice_ms(900, 5000).samples.len(), 100);
        assert!(buf.slice_ms(2000, 3000).is_empty());
    }

    #[test]
    fn test_resample_changes_length() {
        let samples = vec![0.0, 1.0, 0.0, -1.0];
        let up = resample_linear(&samples, 2, 4);
        assert_eq!(up.len(), 8);
        assert_eq!(up[0], 0.0);
        assert_eq!(resample_linear(&samples, 4, 4), samples);
    }

    #[test]
    fn test_time_stretch_shortens() {
        let samples = vec![0.25; 1500];
        let out = time_stretch(&samples, 1.5);
        assert_eq!(out.len(), 1000);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_silence_detection() {
        assert!(AudioBuffer::silence(100, 16000).is_silent());
        assert!(!AudioBuffer::new(sine(440.0, 100, 16000, 0.5), 16000).is_silent());
    }

    #[test]
    fn test_fades_zero_the_edges() {
        let mut samples = vec![1.0; 100];
        apply_fades(&mut samples, 10);
        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[99], 0.0);
        assert_eq!(samples[50], 1.0);
    }

    #[test]
    fn test_loudness_normalization_moves_toward_target() {
        let rate = 44100;
        let mut samples = sine(1000.0, 2000, rate, 0.05);
        let before = integrated_loudness(&samples, rate).unwrap().unwrap();
        normalize_loudness(&mut samples, rate, -20.0).unwrap();
        let after = integrated_loudness(&samples, rate).unwrap().unwrap();
        assert!(before < -25.0);
        assert!((after - -20.0).abs() < 0.5);
    }

    #[test]
    fn test_wav_round_trip_downmixes_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..100 {
            writer.write_sample(i16::MAX / 2).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let buf = read_wav(&path).unwrap();
        assert_eq!(buf.sample_rate, 8000);
        assert_eq!(buf.samples.len(), 100);
        assert!((buf.samples[0] - 0.25).abs() < 0.01);

        let out = dir.path().join("nested/mono.wav");
        write_wav(&out, &buf).unwrap();
        assert_eq!(read_wav(&out).unwrap().samples.len(), 100);
    }
}
