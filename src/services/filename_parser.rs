//! Filename parser for scene-style release names
//!
//! Parses names like:
//! - "Movie.Name.2020.1080p.BluRay.x264-GROUP.mkv"
//! - "Show Name S02E05E06 720p HDTV"
//! - "[Group] Show.Name.S01.1080p.WEB-DL" (season bundle directory)
//! - "2012.2009.1080p.mkv" (a leading year belongs to the title)

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::file_utils::media_stem;

/// Identifying tokens parsed from a file or directory name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedName {
    pub title: String,
    pub year: Option<u32>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub end_episode: Option<u32>,
}

impl ParsedName {
    pub fn has_title(&self) -> bool {
        !self.title.is_empty()
    }

    /// Whether the name carries any season or episode marker
    pub fn looks_episodic(&self) -> bool {
        self.season.is_some() || self.episode.is_some()
    }
}

/// Quality tags extracted from a filename
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedQuality {
    pub resolution: Option<String>,
    pub source: Option<String>,
}

impl ParsedQuality {
    /// Human readable version label such as "1080p - BluRay"
    pub fn label(&self) -> Option<String> {
        let parts: Vec<&str> = [self.resolution.as_deref(), self.source.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" - "))
        }
    }
}

static GROUP_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:\[[^\]]*\]\s*)+").expect("valid group tag regex"));
static YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").expect("valid year regex"));
static SXXEXX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bS(\d{1,2})\s?E(\d{1,3})(?:\s?-?\s?E(\d{1,3}))?\b")
        .expect("valid SxxExx regex")
});
static NXNN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{1,2})x(\d{2,3})\b").expect("valid NxNN regex"));
static VERBOSE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bSeason\s*(\d{1,2})\s*Episode\s*(\d{1,3})\b")
        .expect("valid verbose episode regex")
});
static SEASON_ONLY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:S|Season\s*)(\d{1,2})\b").expect("valid season regex")
});
static EPISODE_ONLY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:E|Ep|Episode\s*)(\d{1,3})\b").expect("valid episode regex")
});
static QUALITY_START_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(2160p|1080p|720p|576p|480p|4k|uhd|remux|blu-?ray|web-?dl|webrip|web|hdtv|dvdrip|x264|x265|hevc|h\s?26[45])\b",
    )
    .expect("valid quality regex")
});
static SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid space regex"));

/// Parse a file or directory name into title, year and episode markers
pub fn parse_name(name: &str) -> ParsedName {
    let stem = media_stem(std::path::Path::new(name));
    let without_groups = GROUP_TAG_RE.replace(&stem, "");
    let cleaned = without_groups.replace(['.', '_'], " ");
    let cleaned = cleaned.trim();

    let mut result = ParsedName::default();
    // Positions where the title may end; the earliest wins
    let mut cut_points: Vec<usize> = Vec::new();

    // A year at the very start is the title itself ("2012", "1917")
    if let Some(m) = YEAR_RE.find_iter(cleaned).find(|m| m.start() > 0) {
        result.year = m.as_str().parse().ok();
        cut_points.push(m.start());
    }

    if let Some(caps) = SXXEXX_RE.captures(cleaned) {
        result.season = caps.get(1).and_then(|m| m.as_str().parse().ok());
        result.episode = caps.get(2).and_then(|m| m.as_str().parse().ok());
        result.end_episode = caps.get(3).and_then(|m| m.as_str().parse().ok());
        cut_points.extend(caps.get(0).map(|m| m.start()));
    } else if let Some(caps) = VERBOSE_RE.captures(cleaned) {
        result.season = caps.get(1).and_then(|m| m.as_str().parse().ok());
        result.episode = caps.get(2).and_then(|m| m.as_str().parse().ok());
        cut_points.extend(caps.get(0).map(|m| m.start()));
    } else if let Some(caps) = NXNN_RE.captures(cleaned) {
        result.season = caps.get(1).and_then(|m| m.as_str().parse().ok());
        result.episode = caps.get(2).and_then(|m| m.as_str().parse().ok());
        cut_points.extend(caps.get(0).map(|m| m.start()));
    } else {
        if let Some(caps) = SEASON_ONLY_RE.captures(cleaned) {
            result.season = caps.get(1).and_then(|m| m.as_str().parse().ok());
            cut_points.extend(caps.get(0).map(|m| m.start()));
        }
        if let Some(caps) = EPISODE_ONLY_RE.captures(cleaned) {
            result.episode = caps.get(1).and_then(|m| m.as_str().parse().ok());
            cut_points.extend(caps.get(0).map(|m| m.start()));
        }
    }

    if let Some(m) = QUALITY_START_RE.find(cleaned) {
        cut_points.push(m.start());
    }

    // An end episode equal to or below the start is noise ("S01E05-E05")
    if let (Some(start), Some(end)) = (result.episode, result.end_episode) {
        if end <= start {
            result.end_episode = None;
        }
    }

    let end = cut_points.into_iter().min().unwrap_or(cleaned.len());
    result.title = clean_title(&cleaned[..end]);

    debug!(
        name = name,
        title = %result.title,
        year = ?result.year,
        season = ?result.season,
        episode = ?result.episode,
        end_episode = ?result.end_episode,
        "Parsed name"
    );

    result
}

/// Parse resolution and source tags from a filename
pub fn parse_quality(filename: &str) -> ParsedQuality {
    let lower = filename.to_lowercase();
    let mut quality = ParsedQuality::default();

    const RESOLUTIONS: &[(&str, &str)] = &[
        ("2160p", "4K"),
        ("4k", "4K"),
        ("1080p", "1080p"),
        ("720p", "720p"),
        ("576p", "576p"),
        ("480p", "480p"),
        ("dvd", "DVD"),
    ];
    const SOURCES: &[(&str, &str)] = &[
        ("remux", "Remux"),
        ("bluray", "BluRay"),
        ("blu-ray", "BluRay"),
        ("web-dl", "WEB-DL"),
        ("webdl", "WEB-DL"),
        ("webrip", "WEBRip"),
        ("hdtv", "HDTV"),
        ("dvdrip", "DVDRip"),
    ];

    quality.resolution = RESOLUTIONS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, tag)| tag.to_string());
    quality.source = SOURCES
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, tag)| tag.to_string());

    quality
}

/// Trim separators and bracket leftovers from the title part of a name
fn clean_title(raw: &str) -> String {
    let collapsed = SPACE_RE.replace_all(raw, " ");
    collapsed
        .trim()
        .trim_end_matches(|c: char| matches!(c, '-' | '(' | '[' | ' ' | ','))
        .trim()
        .to_string()
}
