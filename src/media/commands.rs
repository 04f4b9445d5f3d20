use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use crate::error::{DubError, Result};

/// Bytes of stderr kept in error messages
const STDERR_TAIL_BYTES: usize = 500;

/// Abstract media processing command representation
#[derive(Debug, Clone)]
pub struct MediaCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

impl MediaCommand {
    /// Create a new media processing command
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Add input file
    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Add output file
    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Force overwrite output
    pub fn overwrite(self) -> Self {
        self.arg("-y")
    }

    /// Select a stream for the output
    pub fn map<S: Into<String>>(self, spec: S) -> Self {
        self.arg("-map").arg(spec)
    }

    /// Copy every mapped stream unless overridden per stream
    pub fn copy_all(self) -> Self {
        self.arg("-c").arg("copy")
    }

    /// Set audio codec
    pub fn audio_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:a").arg(codec)
    }

    /// Set the codec of one output audio stream
    pub fn audio_stream_codec<S: Into<String>>(self, stream: usize, codec: S) -> Self {
        self.arg(format!("-c:a:{}", stream)).arg(codec)
    }

    pub fn audio_stream_bitrate<S: Into<String>>(self, stream: usize, bitrate: S) -> Self {
        self.arg(format!("-b:a:{}", stream)).arg(bitrate)
    }

    pub fn audio_stream_metadata(self, stream: usize, key: &str, value: &str) -> Self {
        self.arg(format!("-metadata:s:a:{}", stream)).arg(format!("{}={}", key, value))
    }

    pub fn audio_stream_disposition<S: Into<String>>(self, stream: usize, disposition: S) -> Self {
        self.arg(format!("-disposition:a:{}", stream)).arg(disposition)
    }

    /// Copy subtitle stream
    pub fn copy_subtitles(self) -> Self {
        self.arg("-c:s").arg("copy")
    }

    /// Disable video
    pub fn no_video(self) -> Self {
        self.arg("-vn")
    }

    /// Set audio sample rate
    pub fn audio_sample_rate(self, rate: u32) -> Self {
        self.arg("-ar").arg(rate.to_string())
    }

    /// Set audio channels
    pub fn audio_channels(self, channels: u32) -> Self {
        self.arg("-ac").arg(channels.to_string())
    }

    /// Execute the command, returning its stdout
    pub async fn execute(&self) -> Result<String> {
        debug!("Executing media processing command: {} {:?}", self.binary_path, self.args);
        debug!("Description: {}", self.description);

        let output = Command::new(&self.binary_path)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DubError::Media(format!("Failed to execute {}: {}", self.binary_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DubError::Media(format!("{} failed: {}", self.description, stderr_tail(&stderr))));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn stderr_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim_end();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed;
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

/// Description of the dubbed track written by mux
#[derive(Debug, Clone)]
pub struct MuxTrack {
    /// ISO 639-2 code, e.g. "eng"
    pub language: String,
    pub title: String,
    pub codec: String,
    pub bitrate: String,
    pub default_track: bool,
}

/// Builder for the ffmpeg/ffprobe invocations of the pipeline
pub struct MediaCommandBuilder {
    binary_path: String,
    probe_path: String,
}

impl MediaCommandBuilder {
    /// Create a new command builder
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, probe_path: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            probe_path: probe_path.into(),
        }
    }

    /// Stream and container listing as JSON
    pub fn probe<P: AsRef<Path>>(&self, media_path: P) -> MediaCommand {
        MediaCommand::new(&self.probe_path, "Media probe")
            .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"])
            .output(media_path)
    }

    /// Build audio extraction command for one stream
    pub fn extract_audio_track<P: AsRef<Path>>(
        &self,
        video_path: P,
        stream_spec: &str,
        audio_path: P,
        sample_rate: u32,
    ) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Audio extraction")
            .input(video_path)
            .map(stream_spec)
            .no_video()
            .audio_codec("pcm_s16le")
            .audio_sample_rate(sample_rate)
            .audio_channels(2)
            .overwrite()
            .output(audio_path)
    }

    /// Copy a subtitle stream out without transcoding, keeping ASS styling
    pub fn extract_subtitle_track<P: AsRef<Path>>(
        &self,
        video_path: P,
        stream_spec: &str,
        subtitle_path: P,
    ) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Subtitle extraction")
            .input(video_path)
            .map(stream_spec)
            .copy_subtitles()
            .overwrite()
            .output(subtitle_path)
    }

    /// Add the dubbed track after all original streams, copying everything else.
    /// `existing_audio` is the number of audio streams already in the source.
    pub fn mux_dubbed_audio<P: AsRef<Path>>(
        &self,
        source_path: P,
        dubbed_audio: P,
        output_path: P,
        existing_audio: usize,
        track: &MuxTrack,
    ) -> MediaCommand {
        let idx = existing_audio;
        let mut cmd = MediaCommand::new(&self.binary_path, "Dubbed audio mux")
            .input(source_path)
            .input(dubbed_audio)
            .map("0")
            .map("1:a:0")
            .copy_all()
            .audio_stream_codec(idx, &track.codec)
            .audio_stream_bitrate(idx, &track.bitrate)
            .audio_stream_metadata(idx, "language", &track.language)
            .audio_stream_metadata(idx, "title", &track.title);

        if track.default_track {
            cmd = cmd.audio_stream_disposition(idx, "default");
            for i in 0..idx {
                cmd = cmd.audio_stream_disposition(i, "0");
            }
        }

        cmd.overwrite().output(output_path)
    }

    /// Build version check command
    pub fn version_check(&self) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Version check").arg("-version")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(default_track: bool) -> MuxTrack {
        MuxTrack {
            language: "eng".to_string(),
            title: "English (AI-Dubbed)".to_string(),
            codec: "aac".to_string(),
            bitrate: "192k".to_string(),
            default_track,
        }
    }

    #[test]
    fn test_mux_command_appends_track_after_existing_audio() {
        let builder = MediaCommandBuilder::new("ffmpeg", "ffprobe");
        let cmd = builder.mux_dubbed_audio("ep.mkv", "dub.wav", "ep.partial.mkv", 2, &track(false));
        let args = cmd.args.join(" ");

        assert!(args.starts_with("-i ep.mkv -i dub.wav -map 0 -map 1:a:0 -c copy"));
        assert!(args.contains("-c:a:2 aac -b:a:2 192k"));
        assert!(args.contains("-metadata:s:a:2 language=eng"));
        assert!(args.contains("-metadata:s:a:2 title=English (AI-Dubbed)"));
        assert!(!args.contains("-disposition"));
        assert!(args.ends_with("-y ep.partial.mkv"));
    }

    #[test]
    fn test_mux_command_default_track_clears_others() {
        let builder = MediaCommandBuilder::new("ffmpeg", "ffprobe");
        let cmd = builder.mux_dubbed_audio("ep.mkv", "dub.wav", "out.mkv", 1, &track(true));
        let args = cmd.args.join(" ");
        assert!(args.contains("-disposition:a:1 default"));
        assert!(args.contains("-disposition:a:0 0"));
    }

    #[test]
    fn test_extract_audio_maps_stream() {
        let builder = MediaCommandBuilder::new("ffmpeg", "ffprobe");
        let cmd = builder.extract_audio_track("ep.mkv", "0:a:1", "audio.wav", 44100);
        assert_eq!(
            cmd.args,
            vec!["-i", "ep.mkv", "-map", "0:a:1", "-vn", "-c:a", "pcm_s16le", "-ar", "44100", "-ac", "2", "-y", "audio.wav"]
        );
    }

    #[test]
    fn test_stderr_tail_keeps_end() {
        let long = "x".repeat(600) + "END";
        assert!(stderr_tail(&long).ends_with("END"));
        assert_eq!(stderr_tail(&long).len(), STDERR_TAIL_BYTES);
    }
}
