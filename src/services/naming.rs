//! Destination path formatting
//!
//! Formatters return paths relative to the category root (movies or tv).
//! Version labels are appended to a primary's base stem as ` - Version`;
//! the quality arbiter relies on that to find existing versions.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use super::classifier::ExtraKind;
use super::file_utils::sanitize_for_filename;
use super::metadata::{MediaIdentity, MediaType};

/// The destination media unit a file is being placed for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTarget {
    pub media_type: MediaType,
    pub catalog_id: String,
    /// Canonical catalog title
    pub title: String,
    pub year: Option<u32>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub end_episode: Option<u32>,
    pub edition: Option<String>,
}

impl MediaTarget {
    pub fn identity(&self) -> MediaIdentity {
        MediaIdentity {
            catalog_id: self.catalog_id.clone(),
            season: self.season,
            episode: self.episode,
            edition: self.edition.clone(),
        }
    }

    /// One identity per episode the file covers; a single identity otherwise
    pub fn identities(&self) -> Vec<MediaIdentity> {
        match (self.episode, self.end_episode) {
            (Some(first), Some(last)) if last > first => (first..=last)
                .map(|episode| MediaIdentity {
                    episode: Some(episode),
                    ..self.identity()
                })
                .collect(),
            _ => vec![self.identity()],
        }
    }
}

/// What a file is within its bundle
#[derive(Debug, Clone, Copy)]
pub enum FileRole<'a> {
    Primary {
        version: Option<&'a str>,
    },
    Extra {
        kind: ExtraKind,
        /// Original file name, kept as the extra's title
        file_name: &'a str,
    },
    Subtitle {
        /// Version label of the primary it belongs to
        version: Option<&'a str>,
        language: &'a str,
        forced: bool,
        sdh: bool,
    },
}

/// Destination-path formatter collaborator
pub trait PathFormatter: Send + Sync {
    /// Relative destination path for a file of `extension` (without the dot)
    fn format(&self, target: &MediaTarget, role: FileRole<'_>, extension: &str) -> PathBuf;
}

/// Plex naming conventions with `{tvdb-ID}` folder hints
#[derive(Debug, Clone, Copy, Default)]
pub struct PlexPathFormatter;

impl PlexPathFormatter {
    fn title_with_year(target: &MediaTarget) -> String {
        let title = sanitize_for_filename(&target.title);
        match target.year {
            Some(year) => format!("{} ({})", title, year),
            None => title,
        }
    }

    fn title_folder(target: &MediaTarget) -> PathBuf {
        PathBuf::from(format!(
            "{} {{tvdb-{}}}",
            Self::title_with_year(target),
            sanitize_for_filename(&target.catalog_id)
        ))
    }

    fn primary_dir(target: &MediaTarget) -> PathBuf {
        let folder = Self::title_folder(target);
        match (target.media_type, target.season) {
            (MediaType::Series, Some(season)) => folder.join(format!("Season {:02}", season)),
            _ => folder,
        }
    }

    fn primary_stem(target: &MediaTarget, version: Option<&str>) -> String {
        let mut stem = Self::title_with_year(target);

        if target.media_type == MediaType::Series {
            if let (Some(season), Some(episode)) = (target.season, target.episode) {
                stem.push_str(&format!(" - s{:02}e{:02}", season, episode));
                if let Some(end) = target.end_episode {
                    stem.push_str(&format!("-e{:02}", end));
                }
            }
        }
        if let Some(edition) = &target.edition {
            stem.push_str(&format!(" {{edition-{}}}", sanitize_for_filename(edition)));
        }
        if let Some(version) = version.filter(|v| !v.is_empty()) {
            stem.push_str(" - ");
            stem.push_str(&sanitize_for_filename(version));
        }
        stem
    }
}

impl PathFormatter for PlexPathFormatter {
    fn format(&self, target: &MediaTarget, role: FileRole<'_>, extension: &str) -> PathBuf {
        let dir = Self::primary_dir(target);
        match role {
            FileRole::Primary { version } => {
                dir.join(format!("{}.{}", Self::primary_stem(target, version), extension))
            }
            FileRole::Extra { kind, file_name } => {
                dir.join(kind.folder()).join(sanitize_for_filename(file_name))
            }
            FileRole::Subtitle {
                version,
                language,
                forced,
                sdh,
            } => {
                let marker = if forced {
                    ".forced"
                } else if sdh {
                    ".sdh"
                } else {
                    ""
                };
                dir.join(format!(
                    "{}.{}{}.{}",
                    Self::primary_stem(target, version),
                    language,
                    marker,
                    extension
                ))
            }
        }
    }
}

/// Whether `stem` is the base stem itself or a ` - Version` of it
pub fn is_version_of(stem: &str, base_stem: &str) -> bool {
    if stem == base_stem || has_version_suffix(stem, base_stem) {
        return true;
    }
    match (EpisodeStem::parse(stem), EpisodeStem::parse(base_stem)) {
        (Some(existing), Some(wanted)) => {
            existing.same_unit(&wanted)
                && existing.overlaps(&wanted)
                && (existing.rest == wanted.rest || has_version_suffix(existing.rest, wanted.rest))
        }
        _ => false,
    }
}

/// Whether every episode in `stem` is also in `base_stem`. Stems without an
/// episode range cover each other.
pub fn covers_episodes(base_stem: &str, stem: &str) -> bool {
    match (EpisodeStem::parse(base_stem), EpisodeStem::parse(stem)) {
        (Some(base), Some(other)) => base.first <= other.first && other.last <= base.last,
        _ => true,
    }
}

fn has_version_suffix(stem: &str, base_stem: &str) -> bool {
    stem.strip_prefix(base_stem)
        .is_some_and(|rest| rest.starts_with(" - "))
}

static EPISODE_STEM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.*?) - s(\d{2,})e(\d{2,})(?:-e(\d{2,}))?(.*)$").expect("valid episode stem regex")
});

/// A formatted episode stem split around its `sNNeNN[-eNN]` marker
struct EpisodeStem<'a> {
    title: &'a str,
    season: u32,
    first: u32,
    last: u32,
    rest: &'a str,
}

impl<'a> EpisodeStem<'a> {
    fn parse(stem: &'a str) -> Option<Self> {
        let caps = EPISODE_STEM_RE.captures(stem)?;
        let first = caps.get(3)?.as_str().parse().ok()?;
        let last = match caps.get(4) {
            Some(end) => end.as_str().parse().ok()?,
            None => first,
        };
        Some(Self {
            title: caps.get(1)?.as_str(),
            season: caps.get(2)?.as_str().parse().ok()?,
            first,
            last: last.max(first),
            rest: caps.get(5).map_or("", |m| m.as_str()),
        })
    }

    fn same_unit(&self, other: &Self) -> bool {
        self.title == other.title && self.season == other.season
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.first <= other.last && other.first <= self.last
    }
}

/// Stem of a formatted path as a string
pub fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}
