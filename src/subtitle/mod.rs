// Subtitle parsing
//
// Subtitles are the translation source of the dub: every dialogue line becomes
// one synthesized clip. Two formats are supported:
// - SRT: plain timed blocks, HTML-style tags stripped
// - ASS/SSA: [Events] dialogue, sign/karaoke styles filtered, override tags stripped
//
// Parsing yields immutable `SubtitleLine`s ordered by start time and re-indexed
// after filtering, so `index` is the stable key used by alignment and synthesis.

pub mod ass;
pub mod srt;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::SubtitleConfig;
use crate::error::{DubError, Result};

/// ASS styles that typically carry typesetting or songs, not dialogue
pub const DEFAULT_EXCLUDED_STYLES: &[&str] = &[
    "sign", "signs", "sign2", "sign3",
    "title", "title2",
    "op", "op1", "op2", "opening",
    "ed", "ed1", "ed2", "ending",
    "karaoke", "kara",
    "note", "notes",
    "flashback",
    "top", "top-i",
    "insert", "insert song",
    "typeset", "typesetting", "ts",
    "staff", "credit", "credits",
    "song", "lyrics",
];

/// Sequential duplicates closer than this are merged into one line
const DEDUP_MAX_GAP_MS: u64 = 500;

/// One parsed dialogue line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleLine {
    pub index: usize,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    pub language_tag: String,
    /// ASS `Name` field, when the fansub credits a speaker
    pub speaker_hint: Option<String>,
    pub style: Option<String>,
}

impl SubtitleLine {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn midpoint_ms(&self) -> f64 {
        (self.start_ms as f64 + self.end_ms as f64) / 2.0
    }

    /// Zero-length lines carry a timestamp but no interval
    pub fn is_point_event(&self) -> bool {
        self.end_ms <= self.start_ms
    }
}

impl fmt::Display for SubtitleLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview: String = self.text.chars().take(50).collect();
        let ellipsis = if self.text.chars().count() > 50 { "..." } else { "" };
        write!(
            f,
            "#{} {} -> {} {:?}{}",
            self.index,
            format_timestamp(self.start_ms),
            format_timestamp(self.end_ms),
            preview,
            ellipsis
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubtitleFormat {
    Srt,
    Ass,
}

impl SubtitleFormat {
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "srt" => Some(Self::Srt),
            "ass" | "ssa" => Some(Self::Ass),
            _ => None,
        }
    }

    /// Sniff the format from file content when the extension says nothing
    pub fn detect(content: &str) -> Option<Self> {
        if content.contains("[Script Info]") || content.contains("[V4+ Styles]") || content.contains("[Events]") {
            Some(Self::Ass)
        } else if srt::looks_like_srt(content) {
            Some(Self::Srt)
        } else {
            None
        }
    }
}

impl fmt::Display for SubtitleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Srt => write!(f, "srt"),
            Self::Ass => write!(f, "ass"),
        }
    }
}

/// Parsing knobs, usually built from `SubtitleConfig`
#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub language_tag: String,
    pub min_duration_ms: u64,
    pub deduplicate: bool,
    pub excluded_styles: HashSet<String>,
}

impl ParseOptions {
    pub fn new(language_tag: &str, config: &SubtitleConfig) -> Self {
        let excluded_styles = match &config.excluded_styles {
            Some(styles) => styles.iter().map(|s| s.trim().to_lowercase()).collect(),
            None => DEFAULT_EXCLUDED_STYLES.iter().map(|s| s.to_string()).collect(),
        };
        Self {
            language_tag: language_tag.to_string(),
            min_duration_ms: config.min_duration_ms,
            deduplicate: config.deduplicate,
            excluded_styles,
        }
    }
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self::new("en", &SubtitleConfig::default())
    }
}

/// Entry produced by a format reader before filtering and indexing
#[derive(Debug, Clone)]
pub(crate) struct RawEntry {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    pub style: Option<String>,
    pub speaker: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RawParse {
    pub entries: Vec<RawEntry>,
    pub total_raw_lines: usize,
    pub filtered_lines: usize,
    pub styles_found: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct ParseResult {
    pub lines: Vec<SubtitleLine>,
    pub format: SubtitleFormat,
    pub total_raw_lines: usize,
    pub filtered_lines: usize,
    pub styles_found: BTreeSet<String>,
    pub source_path: Option<PathBuf>,
}

impl ParseResult {
    pub fn dialogue_count(&self) -> usize {
        self.lines.len()
    }

    pub fn summary(&self) -> String {
        let styles = if self.styles_found.is_empty() {
            "N/A".to_string()
        } else {
            self.styles_found.iter().cloned().collect::<Vec<_>>().join(", ")
        };
        format!(
            "Format: {} | Dialogue: {} lines | Filtered: {} non-dialogue | Styles: {}",
            self.format,
            self.dialogue_count(),
            self.filtered_lines,
            styles
        )
    }
}

/// Parse a subtitle file, picking the reader from the extension or the content
pub async fn parse_subtitle_file<P: AsRef<Path>>(path: P, options: &ParseOptions) -> Result<ParseResult> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(DubError::FileNotFound(path.display().to_string()));
    }

    let bytes = tokio::fs::read(path).await?;
    let content = String::from_utf8_lossy(&bytes);

    let format = SubtitleFormat::from_extension(path)
        .or_else(|| SubtitleFormat::detect(&content))
        .ok_or_else(|| DubError::UnsupportedFormat(format!("subtitle file {}", path.display())))?;

    let mut result = parse_subtitle_str(&content, format, options)?;
    result.source_path = Some(path.to_path_buf());

    info!(
        "Parsed {}: {} dialogue lines ({} filtered from {} raw)",
        path.file_name().unwrap_or_default().to_string_lossy(),
        result.dialogue_count(),
        result.filtered_lines,
        result.total_raw_lines
    );
    Ok(result)
}

/// Parse subtitle content of a known format
pub fn parse_subtitle_str(content: &str, format: SubtitleFormat, options: &ParseOptions) -> Result<ParseResult> {
    let content = content.trim_start_matches('\u{feff}').replace("\r\n", "\n");

    let raw = match format {
        SubtitleFormat::Srt => srt::parse(&content),
        SubtitleFormat::Ass => ass::parse(&content, &options.excluded_styles),
    };

    let RawParse { mut entries, total_raw_lines, mut filtered_lines, styles_found } = raw;

    // Stable sort: overlapping lines keep their file order
    entries.sort_by_key(|e| e.start_ms);

    let before = entries.len();
    entries.retain(|e| e.end_ms.saturating_sub(e.start_ms) >= options.min_duration_ms);
    filtered_lines += before - entries.len();

    if options.deduplicate {
        let before = entries.len();
        entries = deduplicate_sequential(entries);
        filtered_lines += before - entries.len();
    }

    let lines = entries
        .into_iter()
        .enumerate()
        .map(|(index, e)| SubtitleLine {
            index,
            start_ms: e.start_ms,
            end_ms: e.end_ms,
            text: e.text,
            language_tag: options.language_tag.clone(),
            speaker_hint: e.speaker,
            style: e.style,
        })
        .collect();

    Ok(ParseResult {
        lines,
        format,
        total_raw_lines,
        filtered_lines,
        styles_found,
        source_path: None,
    })
}

/// Merge runs of identical text that fansub typesetting splits frame by frame
fn deduplicate_sequential(entries: Vec<RawEntry>) -> Vec<RawEntry> {
    let mut merged: Vec<RawEntry> = Vec::with_capacity(entries.len());

    for entry in entries {
        match merged.last_mut() {
            Some(current)
                if current.text == entry.text
                    && entry.start_ms.saturating_sub(current.end_ms) < DEDUP_MAX_GAP_MS =>
            {
                current.end_ms = current.end_ms.max(entry.end_ms);
            }
            _ => merged.push(entry),
        }
    }

    merged
}

/// Format milliseconds as HH:MM:SS.mmm for logs
pub fn format_timestamp(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let secs = (ms % 60_000) / 1_000;
    let millis = ms % 1_000;

    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
}
