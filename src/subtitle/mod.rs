//! WebVTT preamble + cue parsing, per spec.md §4.6.
//!
//! This is deliberately not a general WebVTT parser: spec.md §1 scopes it to
//! "the parser's contract for subtitle cues" — just enough structure
//! (preamble, identifier, timestamp line, settings, text, interstitial
//! notes) to hand `codec::SubtitleCue` values to either back-end.

use crate::codec::SubtitleCue;
use crate::error::{MuxError, Result};

/// The WebVTT preamble text plus every cue parsed from the remainder of the
/// input.
pub struct ParsedSubtitle {
    pub description: String,
    pub cues: Vec<SubtitleCue>,
}

/// Parses a complete WebVTT document.
///
/// Fails unless `input` begins with `WEBVTT`, optionally followed by header
/// text, terminated by a blank line. CRLF/CR are normalized to LF before
/// parsing.
pub fn parse_webvtt(input: &str) -> Result<ParsedSubtitle> {
    let normalized = normalize_newlines(input);

    if !normalized.starts_with("WEBVTT") {
        return Err(MuxError::invalid_argument(
            "WebVTT input must begin with WEBVTT",
        ));
    }

    let blank_at = find_blank_line(&normalized).ok_or_else(|| {
        MuxError::invalid_argument("WebVTT preamble must be terminated by a blank line")
    })?;

    let description = normalized[..blank_at].trim().to_string();
    let rest = &normalized[blank_at..];

    let mut cues = Vec::new();
    let mut pending_notes: Option<String> = None;

    for block in split_blocks(rest) {
        let block = block.trim_matches('\n');
        if block.is_empty() {
            continue;
        }
        match parse_block(block, pending_notes.take())? {
            Some(cue) => cues.push(cue),
            None => {
                pending_notes = Some(match pending_notes.take() {
                    Some(existing) => format!("{existing}\n{block}"),
                    None => block.to_string(),
                });
            }
        }
    }

    Ok(ParsedSubtitle { description, cues })
}

fn normalize_newlines(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn find_blank_line(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
            return Some(i + 2);
        }
        i += 1;
    }
    None
}

fn split_blocks(s: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut start = 0;
    let bytes = s.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
            blocks.push(&s[start..i]);
            start = i + 2;
            i += 2;
            continue;
        }
        i += 1;
    }
    blocks.push(&s[start..]);
    blocks
}

/// Parses one blank-line-delimited block. Returns `Ok(None)` when the block
/// doesn't contain a timestamp line (an interstitial comment, attached to
/// the next cue's `notes`).
fn parse_block(block: &str, notes: Option<String>) -> Result<Option<SubtitleCue>> {
    let lines: Vec<&str> = block.lines().collect();
    let Some(ts_line_idx) = lines.iter().position(|l| l.contains("-->")) else {
        return Ok(None);
    };

    let identifier = if ts_line_idx > 0 {
        Some(lines[..ts_line_idx].join("\n"))
    } else {
        None
    };

    let (start, end, settings) = parse_timestamp_line(lines[ts_line_idx])?;
    let text = lines[ts_line_idx + 1..].join("\n");

    Ok(Some(SubtitleCue {
        text,
        timestamp: start,
        duration: (end - start).max(0) as u64,
        identifier,
        settings,
        notes,
    }))
}

fn parse_timestamp_line(line: &str) -> Result<(i64, i64, Option<String>)> {
    let (left, right) = line
        .split_once("-->")
        .ok_or_else(|| MuxError::invalid_argument("cue block missing timestamp line"))?;
    let start = parse_timestamp(left.trim())?;
    let mut right = right.trim_start();
    let end_token_len = right
        .find(char::is_whitespace)
        .unwrap_or(right.len());
    let end = parse_timestamp(&right[..end_token_len])?;
    right = right[end_token_len..].trim();
    let settings = if right.is_empty() { None } else { Some(right.to_string()) };
    Ok((start, end, settings))
}

/// Parses `hh:mm:ss.mmm` into microseconds.
fn parse_timestamp(s: &str) -> Result<i64> {
    let err = || MuxError::invalid_argument(format!("malformed WebVTT timestamp {s:?}"));
    let (hms, ms) = s.split_once('.').ok_or_else(err)?;
    let parts: Vec<&str> = hms.split(':').collect();
    let (h, m, sec) = match parts.as_slice() {
        [h, m, s] => (
            h.parse::<i64>().map_err(|_| err())?,
            m.parse::<i64>().map_err(|_| err())?,
            s.parse::<i64>().map_err(|_| err())?,
        ),
        [m, s] => (
            0,
            m.parse::<i64>().map_err(|_| err())?,
            s.parse::<i64>().map_err(|_| err())?,
        ),
        _ => return Err(err()),
    };
    let ms: i64 = ms.parse().map_err(|_| err())?;
    Ok(((h * 3600 + m * 60 + sec) * 1000 + ms) * 1000)
}

/// Rewrites inline `<HH:MM:SS.mmm>` timestamp tags in a cue's text to be
/// relative to `base_micros` (spec.md §4.5.4), for Matroska's single-block-
/// per-cue encoding. Non-matching `<...>` spans are left untouched.
pub fn rewrite_inline_timestamps(text: &str, base_micros: i64) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('<') {
        let Some(end) = rest[start..].find('>') else {
            out.push_str(rest);
            return out;
        };
        let end = start + end;
        let inner = &rest[start + 1..end];
        out.push_str(&rest[..start]);
        match parse_timestamp(inner) {
            Ok(abs) => {
                let rel = (abs - base_micros).max(0);
                out.push('<');
                out.push_str(&format_timestamp(rel));
                out.push('>');
            }
            Err(_) => {
                out.push('<');
                out.push_str(inner);
                out.push('>');
            }
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}

fn format_timestamp(micros: i64) -> String {
    let total_ms = micros / 1000;
    let ms = total_ms % 1000;
    let total_s = total_ms / 1000;
    let s = total_s % 60;
    let total_m = total_s / 60;
    let m = total_m % 60;
    let h = total_m / 60;
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_webvtt_header() {
        assert!(parse_webvtt("hello\n\n").is_err());
    }

    #[test]
    fn parses_preamble_and_single_cue() {
        let input = "WEBVTT - a test\n\n00:00:01.000 --> 00:00:02.500\nhello\nworld\n";
        let parsed = parse_webvtt(input).unwrap();
        assert_eq!(parsed.description, "WEBVTT - a test");
        assert_eq!(parsed.cues.len(), 1);
        assert_eq!(parsed.cues[0].timestamp, 1_000_000);
        assert_eq!(parsed.cues[0].duration, 1_500_000);
        assert_eq!(parsed.cues[0].text, "hello\nworld");
    }

    #[test]
    fn parses_identifier_and_settings() {
        let input =
            "WEBVTT\n\ncue-1\n00:00:00.000 --> 00:00:01.000 align:start line:0\ntext\n";
        let parsed = parse_webvtt(input).unwrap();
        let cue = &parsed.cues[0];
        assert_eq!(cue.identifier.as_deref(), Some("cue-1"));
        assert_eq!(cue.settings.as_deref(), Some("align:start line:0"));
    }

    #[test]
    fn interstitial_comment_becomes_notes_on_next_cue() {
        let input = "WEBVTT\n\nNOTE this is a comment\n\n00:00:00.000 --> 00:00:01.000\ntext\n";
        let parsed = parse_webvtt(input).unwrap();
        assert_eq!(parsed.cues[0].notes.as_deref(), Some("NOTE this is a comment"));
    }

    #[test]
    fn rewrites_inline_timestamps_relative_to_cue_start() {
        let text = "<00:00:02.000>hello";
        let rewritten = rewrite_inline_timestamps(text, 1_000_000);
        assert_eq!(rewritten, "<00:00:01.000>hello");
    }

    #[test]
    fn crlf_is_normalized() {
        let input = "WEBVTT\r\n\r\n00:00:00.000 --> 00:00:01.000\r\ntext\r\n";
        let parsed = parse_webvtt(input).unwrap();
        assert_eq!(parsed.cues.len(), 1);
    }
}
