use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::warn;

use super::{RawEntry, RawParse};

static OVERRIDE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{[^}]*\}").expect("valid override pattern"));

static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+):(\d{2}):(\d{2})\.(\d{2,3})").expect("valid ASS time pattern"));

static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Read the `[Events]` section. Field order comes from its `Format:` line;
/// the final `Text` field may itself contain commas.
pub(crate) fn parse(content: &str, excluded_styles: &HashSet<String>) -> RawParse {
    let mut result = RawParse::default();
    let mut in_events = false;
    let mut format_fields: Vec<String> = Vec::new();

    for line in content.lines() {
        let stripped = line.trim();

        if stripped.to_lowercase().starts_with("[events]") {
            in_events = true;
            continue;
        }
        if !in_events {
            continue;
        }
        if stripped.starts_with('[') {
            break;
        }

        if stripped.to_lowercase().starts_with("format:") {
            if let Some((_, fields)) = stripped.split_once(':') {
                format_fields = fields.split(',').map(|f| f.trim().to_lowercase()).collect();
            }
            continue;
        }

        if !stripped.starts_with("Dialogue:") {
            continue;
        }
        result.total_raw_lines += 1;

        if format_fields.is_empty() {
            warn!("Dialogue line found before Format line, skipping");
            continue;
        }

        if let Some(entry) = parse_dialogue(stripped, &format_fields, excluded_styles, &mut result) {
            result.entries.push(entry);
        }
    }

    result
}

fn parse_dialogue(
    line: &str,
    format_fields: &[String],
    excluded_styles: &HashSet<String>,
    result: &mut RawParse,
) -> Option<RawEntry> {
    let (_, data) = line.split_once(':')?;
    let parts: Vec<&str> = data.trim().splitn(format_fields.len(), ',').collect();
    if parts.len() < format_fields.len() {
        return None;
    }

    let field = |name: &str| -> &str {
        format_fields
            .iter()
            .position(|f| f == name)
            .and_then(|i| parts.get(i).copied())
            .unwrap_or("")
            .trim()
    };

    let style = field("style").to_string();
    result.styles_found.insert(style.clone());

    if excluded_styles.contains(&style.to_lowercase()) {
        result.filtered_lines += 1;
        return None;
    }

    let start_ms = parse_time(field("start"))?;
    let end_ms = parse_time(field("end"))?;

    let text = clean_text(field("text"));
    if text.is_empty() {
        result.filtered_lines += 1;
        return None;
    }

    let speaker = Some(field("name").to_string()).filter(|s| !s.is_empty());

    Some(RawEntry {
        start_ms,
        end_ms,
        text,
        style: Some(style).filter(|s| !s.is_empty()),
        speaker,
    })
}

/// `H:MM:SS.cc`; ASS counts centiseconds, some tools emit milliseconds
fn parse_time(value: &str) -> Option<u64> {
    let caps = TIME_RE.captures(value)?;
    let num = |i: usize| -> Option<u64> { caps.get(i)?.as_str().parse().ok() };

    let frac = caps.get(4)?.as_str();
    let millis = if frac.len() == 2 { num(4)? * 10 } else { num(4)? };

    Some(num(1)? * 3_600_000 + num(2)? * 60_000 + num(3)? * 1_000 + millis)
}

fn clean_text(text: &str) -> String {
    let text = OVERRIDE_RE.replace_all(text, "");
    let text = text.replace("\\N", " ").replace("\\n", " ").replace("\\h", " ");
    SPACE_RE
        .replace_all(&text, " ")
        .trim()
        .trim_matches('\u{feff}')
        .to_string()
}
