//! Bundle classifier
//!
//! Partitions a settled item into primaries, typed extras, subtitles and
//! unrecognized files, and decides whether it is a movie or a series bundle.
//!
//! Every file found under the item lands in exactly one of those buckets.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::file_utils::{is_subtitle_file, is_video_file, media_stem};
use super::filename_parser::{ParsedName, parse_name, parse_quality};
use super::metadata::{CatalogQuery, MediaType};
use crate::config::{Config, Vocabulary, normalize_extra_keyword};
use crate::error::PipelineError;

/// Subtitle language vocabulary, matched against dotted filename tags
const LANG_CODE_MAP: &[(&str, &str)] = &[
    ("english", "en"),
    ("eng", "en"),
    ("spanish", "es"),
    ("spa", "es"),
    ("esp", "es"),
    ("french", "fr"),
    ("fre", "fr"),
    ("fra", "fr"),
    ("german", "de"),
    ("ger", "de"),
    ("deu", "de"),
    ("italian", "it"),
    ("ita", "it"),
    ("portuguese", "pt"),
    ("por", "pt"),
    ("dutch", "nl"),
    ("dut", "nl"),
    ("nld", "nl"),
    ("japanese", "ja"),
    ("jpn", "ja"),
    ("korean", "ko"),
    ("kor", "ko"),
    ("chinese", "zh"),
    ("chi", "zh"),
    ("zho", "zh"),
    ("russian", "ru"),
    ("rus", "ru"),
    ("swedish", "sv"),
    ("swe", "sv"),
    ("danish", "da"),
    ("dan", "da"),
    ("norwegian", "no"),
    ("nor", "no"),
    ("finnish", "fi"),
    ("fin", "fi"),
    ("polish", "pl"),
    ("pol", "pl"),
];

const DEFAULT_LANGUAGE: &str = "en";

/// Kind of bonus material, mapped to a Plex extras folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtraKind {
    BehindTheScenes,
    DeletedScene,
    Featurette,
    Interview,
    Scene,
    Short,
    Trailer,
    GagReel,
    Other,
}

impl ExtraKind {
    /// Folder name inside the title (or season) directory
    pub fn folder(&self) -> &'static str {
        match self {
            Self::BehindTheScenes => "Behind The Scenes",
            Self::DeletedScene => "Deleted Scenes",
            Self::Featurette | Self::GagReel => "Featurettes",
            Self::Interview => "Interviews",
            Self::Scene => "Scenes",
            Self::Short => "Shorts",
            Self::Trailer => "Trailers",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for ExtraKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BehindTheScenes => "behind-the-scenes",
            Self::DeletedScene => "deleted-scene",
            Self::Featurette => "featurette",
            Self::Interview => "interview",
            Self::Scene => "scene",
            Self::Short => "short",
            Self::Trailer => "trailer",
            Self::GagReel => "gag-reel",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

impl FromStr for ExtraKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match normalize_extra_keyword(s).trim_end_matches('s') {
            "behindthescene" | "bt" => Ok(Self::BehindTheScenes),
            "deletedscene" | "deleted" => Ok(Self::DeletedScene),
            "featurette" => Ok(Self::Featurette),
            "interview" => Ok(Self::Interview),
            "scene" => Ok(Self::Scene),
            "short" => Ok(Self::Short),
            "trailer" => Ok(Self::Trailer),
            "gagreel" | "blooper" => Ok(Self::GagReel),
            "other" | "extra" => Ok(Self::Other),
            _ => anyhow::bail!("Unknown extras kind '{}'", s),
        }
    }
}

/// Whether the settled item was a loose file or a directory tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Directory,
}

/// Main feature or episode video
#[derive(Debug, Clone, Serialize)]
pub struct PrimaryFile {
    pub path: PathBuf,
    /// Parsed tokens with season filled in from the bundle context
    pub parsed: ParsedName,
    pub edition: Option<String>,
    /// Version label from filename tags ("1080p - BluRay")
    pub version: Option<String>,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtraFile {
    pub path: PathBuf,
    pub kind: ExtraKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubtitleFile {
    pub path: PathBuf,
    /// Index into [`Bundle::primaries`]
    pub primary: usize,
    pub language: String,
    pub forced: bool,
    pub sdh: bool,
}

/// The resolved set of files belonging to one media unit
#[derive(Debug, Clone, Serialize)]
pub struct Bundle {
    pub root: PathBuf,
    pub kind: ItemKind,
    pub media_type: MediaType,
    /// Tokens used for the catalog query
    pub context: ParsedName,
    pub primaries: Vec<PrimaryFile>,
    pub extras: Vec<ExtraFile>,
    pub subtitles: Vec<SubtitleFile>,
    pub unrecognized: Vec<PathBuf>,
}

impl Bundle {
    pub fn file_count(&self) -> usize {
        self.primaries.len() + self.extras.len() + self.subtitles.len() + self.unrecognized.len()
    }

    /// Catalog query for the whole bundle
    pub fn query(&self) -> CatalogQuery {
        let single = (self.primaries.len() == 1).then(|| &self.primaries[0].parsed);
        CatalogQuery {
            title: self.context.title.clone(),
            year: self.context.year,
            media_type: self.media_type,
            season: self
                .context
                .season
                .or_else(|| single.and_then(|p| p.season)),
            episode: single.and_then(|p| p.episode),
        }
    }

    /// Every (season, episode) pair the primaries cover, multi-episode ranges expanded
    pub fn episodes(&self) -> BTreeSet<(u32, u32)> {
        let mut episodes = BTreeSet::new();
        for primary in &self.primaries {
            let parsed = &primary.parsed;
            if let (Some(season), Some(first)) = (parsed.season, parsed.episode) {
                let last = parsed.end_episode.unwrap_or(first);
                episodes.extend((first..=last).map(|e| (season, e)));
            }
        }
        episodes
    }
}

/// Classifies settled items into bundles
#[derive(Debug, Clone)]
pub struct BundleClassifier {
    vocabulary: Vocabulary,
    min_primary_bytes: u64,
    source_root: Option<PathBuf>,
}

impl BundleClassifier {
    pub fn new(vocabulary: Vocabulary, min_primary_bytes: u64, source_root: Option<PathBuf>) -> Self {
        Self {
            vocabulary,
            min_primary_bytes,
            source_root,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.vocabulary.clone(),
            config.min_primary_bytes,
            Some(config.source_dir.clone()),
        )
    }

    /// Inspect an item on disk. Blocking; run it off the async runtime.
    pub fn classify(&self, item: &Path) -> Result<Bundle, PipelineError> {
        let metadata = std::fs::metadata(item).map_err(|e| {
            PipelineError::Unclassifiable(format!("cannot read {}: {}", item.display(), e))
        })?;

        if metadata.is_file() {
            return self.classify_entries(item, ItemKind::File, vec![(item.to_path_buf(), metadata.len())]);
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(item).follow_links(false) {
            let entry = entry.map_err(|e| {
                PipelineError::Unclassifiable(format!("cannot walk {}: {}", item.display(), e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push((entry.into_path(), size));
        }
        entries.sort();

        self.classify_entries(item, ItemKind::Directory, entries)
    }

    /// Classify a listing of `(path, size)` pairs found under `root`
    pub fn classify_entries(
        &self,
        root: &Path,
        kind: ItemKind,
        entries: Vec<(PathBuf, u64)>,
    ) -> Result<Bundle, PipelineError> {
        let mut videos: Vec<(PathBuf, u64)> = Vec::new();
        let mut subtitle_paths: Vec<PathBuf> = Vec::new();
        let mut extras: Vec<ExtraFile> = Vec::new();
        let mut unrecognized: Vec<PathBuf> = Vec::new();

        let root_context = match kind {
            ItemKind::Directory => parse_name(&file_name(root)),
            ItemKind::File => ParsedName::default(),
        };

        for (path, size) in entries {
            if is_video_file(&path) {
                if kind == ItemKind::Directory {
                    if let Some(extra_kind) = self.extra_kind(root, &path, &root_context.title) {
                        debug!(file = %path.display(), kind = %extra_kind, "Classified extra");
                        extras.push(ExtraFile {
                            path,
                            kind: extra_kind,
                        });
                        continue;
                    }
                }
                videos.push((path, size));
            } else if is_subtitle_file(&path) {
                subtitle_paths.push(path);
            } else {
                unrecognized.push(path);
            }
        }

        // Samples: tagged as such, or too small next to a real feature
        let has_full_size = videos
            .iter()
            .any(|(path, size)| *size >= self.min_primary_bytes && !is_sample(path));
        let (samples, videos): (Vec<_>, Vec<_>) = videos.into_iter().partition(|(path, size)| {
            kind == ItemKind::Directory
                && (is_sample(path) || (has_full_size && *size < self.min_primary_bytes))
        });
        unrecognized.extend(samples.into_iter().map(|(path, _)| path));

        if videos.is_empty() {
            return Err(PipelineError::Unclassifiable(format!(
                "no primary video found in {}",
                root.display()
            )));
        }

        let mut context = match kind {
            ItemKind::Directory => root_context,
            ItemKind::File => self.file_context(&videos[0].0),
        };
        let parsed_videos: Vec<ParsedName> = videos
            .iter()
            .map(|(path, _)| parse_name(&file_name(path)))
            .collect();

        if !context.has_title() {
            context.title = parsed_videos[0].title.clone();
        }
        if context.year.is_none() {
            context.year = parsed_videos.iter().find_map(|p| p.year);
        }
        if !context.has_title() {
            return Err(PipelineError::Unclassifiable(format!(
                "no title could be parsed for {}",
                root.display()
            )));
        }

        let media_type = if context.looks_episodic() || parsed_videos.iter().any(|p| p.looks_episodic()) {
            MediaType::Series
        } else {
            MediaType::Movie
        };

        let mut primaries: Vec<PrimaryFile> = Vec::new();
        for ((path, size), mut parsed) in videos.into_iter().zip(parsed_videos) {
            if media_type == MediaType::Series {
                if parsed.season.is_none() {
                    parsed.season = context.season.or(Some(1));
                }
                if parsed.episode.is_none() {
                    warn!(file = %path.display(), "Episode number missing, leaving file unrecognized");
                    unrecognized.push(path);
                    continue;
                }
            }
            let name = file_name(&path);
            primaries.push(PrimaryFile {
                edition: self.edition(&name),
                version: parse_quality(&name).label(),
                path,
                parsed,
                size,
            });
        }

        if media_type == MediaType::Series {
            dedupe_episodes(&mut primaries, &mut unrecognized);
        }

        if primaries.is_empty() {
            return Err(PipelineError::Unclassifiable(format!(
                "no episode numbers found in {}",
                root.display()
            )));
        }

        // A single movie primary inherits an edition named on the directory
        if media_type == MediaType::Movie && primaries.len() == 1 && primaries[0].edition.is_none() {
            primaries[0].edition = self.edition(&file_name(root));
        }

        let mut subtitles = Vec::new();
        for path in subtitle_paths {
            match pair_subtitle(&path, &primaries) {
                Some(subtitle) => subtitles.push(subtitle),
                None => {
                    warn!(file = %path.display(), "No matching video for subtitle");
                    unrecognized.push(path);
                }
            }
        }

        let bundle = Bundle {
            root: root.to_path_buf(),
            kind,
            media_type,
            context,
            primaries,
            extras,
            subtitles,
            unrecognized,
        };

        info!(
            item = %root.display(),
            media_type = %bundle.media_type,
            title = %bundle.context.title,
            primaries = bundle.primaries.len(),
            extras = bundle.extras.len(),
            subtitles = bundle.subtitles.len(),
            unrecognized = bundle.unrecognized.len(),
            "Classified bundle"
        );

        Ok(bundle)
    }

    /// Context for a loose file: its own name, then parent folders up to the source root
    fn file_context(&self, path: &Path) -> ParsedName {
        let mut parsed = parse_name(&file_name(path));
        if parsed.has_title() {
            return parsed;
        }

        for ancestor in path.ancestors().skip(1) {
            if self
                .source_root
                .as_deref()
                .is_none_or(|root| !ancestor.starts_with(root) || ancestor == root)
            {
                break;
            }
            let folder = parse_name(&file_name(ancestor));
            if folder.has_title() {
                debug!(folder = %ancestor.display(), "Using parent folder for context");
                parsed.title = folder.title;
                parsed.year = parsed.year.or(folder.year);
                parsed.season = parsed.season.or(folder.season);
                break;
            }
        }
        parsed
    }

    /// Extras kind from the filename (with the bundle title removed) or an enclosing folder
    fn extra_kind(&self, root: &Path, path: &Path, title: &str) -> Option<ExtraKind> {
        let title = normalize_extra_keyword(title);
        let stem = normalize_extra_keyword(&media_stem(path));
        let stem = if title.is_empty() {
            stem
        } else {
            stem.replace(&title, "")
        };

        if let Some(kind) = self.match_extra(&stem) {
            return Some(kind);
        }

        let relative = path.strip_prefix(root).ok()?;
        for folder in relative.parent()?.components() {
            let folder = normalize_extra_keyword(&folder.as_os_str().to_string_lossy());
            if let Some(kind) = self.match_extra(&folder) {
                return Some(kind);
            }
            if matches!(folder.as_str(), "extras" | "bonus" | "featurettes" | "specialfeatures") {
                return Some(ExtraKind::Other);
            }
        }
        None
    }

    fn match_extra(&self, normalized: &str) -> Option<ExtraKind> {
        self.vocabulary
            .extras
            .iter()
            .find(|(keyword, _)| normalized.contains(keyword.as_str()))
            .map(|(_, kind)| *kind)
    }

    fn edition(&self, name: &str) -> Option<String> {
        let lower = name.to_lowercase().replace(['.', '_'], " ");
        self.vocabulary
            .editions
            .iter()
            .find(|(keyword, _)| lower.contains(keyword.as_str()))
            .map(|(_, label)| label.clone())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn is_sample(path: &Path) -> bool {
    media_stem(path)
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == "sample")
}

/// Keep the largest file per episode; the rest are unrecognized
fn dedupe_episodes(primaries: &mut Vec<PrimaryFile>, unrecognized: &mut Vec<PathBuf>) {
    let mut best: BTreeMap<(Option<u32>, Option<u32>), usize> = BTreeMap::new();
    for (index, primary) in primaries.iter().enumerate() {
        let key = (primary.parsed.season, primary.parsed.episode);
        let larger = best
            .get(&key)
            .is_none_or(|&current| primaries[current].size < primary.size);
        if larger {
            best.insert(key, index);
        }
    }

    let keep: BTreeSet<usize> = best.into_values().collect();
    let mut index = 0;
    primaries.retain(|primary| {
        let kept = keep.contains(&index);
        index += 1;
        if !kept {
            warn!(file = %primary.path.display(), "Duplicate episode in bundle, leaving file unrecognized");
            unrecognized.push(primary.path.clone());
        }
        kept
    });
}

/// Pair a subtitle with a primary and parse its language tags.
///
/// The longest primary stem that prefixes the subtitle stem wins. Failing
/// that, a subtitle naming the same episode, or the sole primary, is used.
fn pair_subtitle(path: &Path, primaries: &[PrimaryFile]) -> Option<SubtitleFile> {
    let stem = media_stem(path);

    let by_prefix = primaries
        .iter()
        .enumerate()
        .filter(|(_, p)| stem.starts_with(&media_stem(&p.path)))
        .max_by_key(|(_, p)| media_stem(&p.path).len())
        .map(|(index, _)| index);

    let (primary, tags, allow_bare_codes) = match by_prefix {
        Some(index) => {
            let video_stem = media_stem(&primaries[index].path);
            (index, stem[video_stem.len()..].to_string(), true)
        }
        None => {
            let parsed = parse_name(&file_name(path));
            let by_episode = parsed.episode.and_then(|episode| {
                primaries.iter().position(|p| {
                    p.parsed.episode == Some(episode)
                        && (parsed.season.is_none() || p.parsed.season == parsed.season)
                })
            });
            let index = by_episode.or_else(|| (primaries.len() == 1).then_some(0))?;
            (index, stem, false)
        }
    };

    let (language, forced, sdh) = parse_subtitle_tags(&tags, allow_bare_codes);
    Some(SubtitleFile {
        path: path.to_path_buf(),
        primary,
        language,
        forced,
        sdh,
    })
}

/// Language and forced/SDH markers from dotted tags, read right to left.
///
/// Unknown two or three letter codes are accepted only when the tags are the
/// remainder after the video stem.
fn parse_subtitle_tags(tags: &str, allow_bare_codes: bool) -> (String, bool, bool) {
    let mut language: Option<String> = None;
    let mut forced = false;
    let mut sdh = false;

    let lower = tags.to_lowercase();
    for tag in lower
        .split(['.', '_', ' ', '-', '[', ']', '(', ')'])
        .rev()
        .filter(|t| !t.is_empty())
    {
        match tag {
            "forced" => forced = true,
            "sdh" | "cc" | "hi" => sdh = true,
            _ if language.is_some() => {}
            _ => {
                if let Some((_, code)) = LANG_CODE_MAP.iter().find(|(name, _)| *name == tag) {
                    language = Some(code.to_string());
                } else if allow_bare_codes
                    && (2..=3).contains(&tag.len())
                    && tag.chars().all(|c| c.is_ascii_alphabetic())
                {
                    language = Some(tag.to_string());
                }
            }
        }
    }

    (
        language.unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        forced,
        sdh,
    )
}
