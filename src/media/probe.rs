use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// ffprobe `-show_streams -show_format` JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaProbe {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    pub format: Option<ProbeFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeStream {
    pub index: u32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
}

impl ProbeStream {
    pub fn language(&self) -> Option<&str> {
        self.tags.get("language").map(|s| s.as_str())
    }

    fn is_kind(&self, kind: &str) -> bool {
        self.codec_type.as_deref() == Some(kind)
    }
}

impl MediaProbe {
    pub fn audio_streams(&self) -> impl Iterator<Item = &ProbeStream> {
        self.streams.iter().filter(|s| s.is_kind("audio"))
    }

    pub fn subtitle_streams(&self) -> impl Iterator<Item = &ProbeStream> {
        self.streams.iter().filter(|s| s.is_kind("subtitle"))
    }

    pub fn audio_count(&self) -> usize {
        self.audio_streams().count()
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.format.as_ref()?.duration.as_ref()?.parse().ok()
    }

    /// `0:a:N` spec of the first audio stream tagged with `language`.
    /// A single untagged audio stream is accepted as a fallback.
    pub fn find_audio_stream(&self, language: &str) -> Option<String> {
        let streams: Vec<&ProbeStream> = self.audio_streams().collect();
        if let Some(pos) = streams
            .iter()
            .position(|s| s.language().is_some_and(|tag| language_matches(tag, language)))
        {
            return Some(format!("0:a:{}", pos));
        }
        match streams.as_slice() {
            [only] if only.language().is_none_or(|t| t.is_empty() || t == "und") => Some("0:a:0".to_string()),
            _ => None,
        }
    }

    /// `0:s:N` spec and file extension of the first subtitle stream tagged
    /// with `language`. ASS stays ASS so style filtering still works.
    pub fn find_subtitle_stream(&self, language: &str) -> Option<(String, &'static str)> {
        self.subtitle_streams()
            .enumerate()
            .find(|(_, s)| s.language().is_some_and(|tag| language_matches(tag, language)))
            .map(|(pos, s)| {
                let ext = match s.codec_name.as_deref().map(|c| c.to_lowercase()).as_deref() {
                    Some("ass") | Some("ssa") => "ass",
                    Some("webvtt") => "vtt",
                    _ => "srt",
                };
                (format!("0:s:{}", pos), ext)
            })
    }
}

const LANGUAGES: &[(&str, &[&str], &str)] = &[
    ("en", &["eng"], "English"),
    ("ja", &["jpn"], "Japanese"),
    ("de", &["ger", "deu"], "German"),
    ("fr", &["fre", "fra"], "French"),
    ("es", &["spa"], "Spanish"),
    ("it", &["ita"], "Italian"),
    ("pt", &["por"], "Portuguese"),
    ("ru", &["rus"], "Russian"),
    ("ko", &["kor"], "Korean"),
    ("zh", &["chi", "zho"], "Chinese"),
];

fn lookup(code: &str) -> Option<&'static (&'static str, &'static [&'static str], &'static str)> {
    let code = code.to_lowercase();
    LANGUAGES
        .iter()
        .find(|(two, three, _)| *two == code || three.contains(&code.as_str()))
}

/// ISO 639-2 tag for a language code, as container metadata expects
pub fn iso639_2(code: &str) -> String {
    match lookup(code) {
        Some((_, three, _)) => three[0].to_string(),
        None => code.to_lowercase(),
    }
}

pub fn language_name(code: &str) -> String {
    match lookup(code) {
        Some((_, _, name)) => name.to_string(),
        None => code.to_uppercase(),
    }
}

/// Stream language tags mix 639-1 and 639-2 codes
pub fn language_matches(tag: &str, language: &str) -> bool {
    let tag = tag.to_lowercase();
    let language = language.to_lowercase();
    if tag.starts_with(&language) {
        return true;
    }
    match (lookup(&tag), lookup(&language)) {
        (Some(a), Some(b)) => a.0 == b.0,
        _ => false,
    }
}
