use regex::Regex;
use std::sync::LazyLock;

use super::{RawEntry, RawParse};

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,2}):(\d{2}):(\d{2})[,.](\d{3})\s*-->\s*(\d{1,2}):(\d{2}):(\d{2})[,.](\d{3})")
        .expect("valid SRT timestamp pattern")
});

static BLOCK_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("valid block separator pattern"));

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>|\{\\[^}]*\}").expect("valid tag pattern"));

static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

static SRT_HEAD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\d+\s*\n\d{1,2}:\d{2}:\d{2}").expect("valid SRT head pattern"));

pub fn looks_like_srt(content: &str) -> bool {
    SRT_HEAD_RE.is_match(&content.replace("\r\n", "\n"))
}

/// Read SRT blocks. The index line is optional; the first timestamp line in a
/// block starts the cue and everything after it is text.
pub(crate) fn parse(content: &str) -> RawParse {
    let mut result = RawParse::default();

    for block in BLOCK_SPLIT_RE.split(content.trim()) {
        let lines: Vec<&str> = block.trim().lines().collect();
        if lines.len() < 2 {
            continue;
        }
        result.total_raw_lines += 1;

        let Some((ts_line, caps)) = lines
            .iter()
            .enumerate()
            .find_map(|(i, line)| TIMESTAMP_RE.captures(line).map(|c| (i, c)))
        else {
            continue;
        };

        let text_lines = &lines[ts_line + 1..];
        if text_lines.is_empty() {
            continue;
        }

        let text = clean_text(&text_lines.join(" "));
        if text.is_empty() {
            result.filtered_lines += 1;
            continue;
        }

        result.entries.push(RawEntry {
            start_ms: captures_to_ms(&caps, 1),
            end_ms: captures_to_ms(&caps, 5),
            text,
            style: None,
            speaker: None,
        });
    }

    result
}

fn captures_to_ms(caps: &regex::Captures<'_>, first: usize) -> u64 {
    let field = |i: usize| -> u64 { caps.get(first + i).and_then(|m| m.as_str().parse().ok()).unwrap_or(0) };
    field(0) * 3_600_000 + field(1) * 60_000 + field(2) * 1_000 + field(3)
}

fn clean_text(text: &str) -> String {
    let stripped = TAG_RE.replace_all(text, "");
    SPACE_RE.replace_all(&stripped, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_blocks() {
        let srt = "1\n00:00:01,500 --> 00:00:03,250\n<i>Where are you</i>\ngoing?\n\n2\n01:02:03.004 --> 01:02:04.000\n{\\an8}Wait!\n";
        let result = parse(srt);
        assert_eq!(result.total_raw_lines, 2);
        assert_eq!(result.entries.len(), 2);
        assert_eq!(result.entries[0].start_ms, 1_500);
        assert_eq!(result.entries[0].end_ms, 3_250);
        assert_eq!(result.entries[0].text, "Where are you going?");
        assert_eq!(result.entries[1].start_ms, 3_723_004);
        assert_eq!(result.entries[1].text, "Wait!");
    }

    #[test]
    fn test_block_without_index_line() {
        let result = parse("00:00:01,000 --> 00:00:02,000\nNo index here\n");
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].text, "No index here");
    }

    #[test]
    fn test_tag_only_block_is_filtered() {
        let result = parse("1\n00:00:01,000 --> 00:00:02,000\n<font color=\"red\"></font>\n");
        assert!(result.entries.is_empty());
        assert_eq!(result.filtered_lines, 1);
    }

    #[test]
    fn test_looks_like_srt() {
        assert!(looks_like_srt("1\r\n00:00:01,000 --> 00:00:02,000\r\nHi"));
        assert!(!looks_like_srt("[Script Info]"));
    }
}
