//! Application configuration management

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::services::classifier::ExtraKind;
use crate::services::metadata::MediaType;
use crate::services::resolver::TieBreak;

/// Output format for the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("Unknown LOG_FORMAT '{}'", other),
        }
    }
}

/// Keyword vocabularies used by the bundle classifier.
///
/// Extras keywords are stored normalized (lowercase, no spaces, dashes or
/// underscores) and matched against normalized filenames. Edition keywords
/// are matched against lowercased names with dots and underscores turned
/// into spaces. Order matters: the first match wins.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    pub extras: Vec<(String, ExtraKind)>,
    pub editions: Vec<(String, String)>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        let extras = [
            ("behindthescenes", ExtraKind::BehindTheScenes),
            ("makingof", ExtraKind::BehindTheScenes),
            ("featurette", ExtraKind::Featurette),
            ("deletedscene", ExtraKind::DeletedScene),
            ("deleted", ExtraKind::DeletedScene),
            ("interview", ExtraKind::Interview),
            ("trailer", ExtraKind::Trailer),
            ("gagreel", ExtraKind::GagReel),
            ("blooper", ExtraKind::GagReel),
            ("gag", ExtraKind::GagReel),
            ("vfx", ExtraKind::Featurette),
            ("scene", ExtraKind::Scene),
            ("short", ExtraKind::Short),
        ];
        let editions = [
            ("director's cut", "Director's Cut"),
            ("directors cut", "Director's Cut"),
            ("extended", "Extended Cut"),
            ("superfan", "Superfan Cut"),
            ("theatrical", "Theatrical Cut"),
            ("uncut", "Uncut"),
            ("unrated", "Unrated"),
            ("remastered", "Remastered"),
            ("imax", "IMAX"),
        ];

        Self {
            extras: extras
                .into_iter()
                .map(|(k, kind)| (k.to_string(), kind))
                .collect(),
            editions: editions
                .into_iter()
                .map(|(k, label)| (k.to_string(), label.to_string()))
                .collect(),
        }
    }
}

impl Vocabulary {
    /// Parse an `EXTRAS_KEYWORDS` override: `keyword=kind,keyword=kind`
    pub fn parse_extras(list: &str) -> Result<Vec<(String, ExtraKind)>> {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (keyword, kind) = entry
                    .split_once('=')
                    .with_context(|| format!("Invalid extras keyword entry '{}'", entry))?;
                let kind = kind.trim().parse::<ExtraKind>()?;
                Ok((normalize_extra_keyword(keyword), kind))
            })
            .collect()
    }

    /// Parse an `EDITION_KEYWORDS` override: `keyword=Label,keyword=Label`
    pub fn parse_editions(list: &str) -> Result<Vec<(String, String)>> {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (keyword, label) = entry
                    .split_once('=')
                    .with_context(|| format!("Invalid edition keyword entry '{}'", entry))?;
                Ok((keyword.trim().to_lowercase(), label.trim().to_string()))
            })
            .collect()
    }
}

/// Normalize an extras keyword the same way filenames are normalized before matching
pub fn normalize_extra_keyword(keyword: &str) -> String {
    keyword
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '_' | '.'))
        .collect()
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// TheTVDB API key
    pub tvdb_api_key: Option<String>,

    /// TheTVDB subscriber PIN (only for user-supported keys)
    pub tvdb_pin: Option<String>,

    /// Watched source root
    pub source_dir: PathBuf,

    /// Destination base directory
    pub dest_base_dir: PathBuf,

    /// Root of the TV library
    pub tv_dir: PathBuf,

    /// Root of the movie library
    pub movies_dir: PathBuf,

    /// Failure-sink directory; when unset failures are only logged
    pub failure_dir: Option<PathBuf>,

    /// Minimum catalog match score (0-100)
    pub confidence_threshold: u8,

    /// Remove the source item after a fully successful placement
    pub delete_source_files: bool,

    /// Also remove the source when every primary was skipped
    pub delete_source_on_skip: bool,

    /// Debounce delay after the last filesystem event for an item
    pub process_delay: Duration,

    /// Give up tracking an item that keeps producing events for this long
    pub watch_max_tracking: Duration,

    /// Use a polling watcher with this interval instead of native events
    pub watch_poll_interval: Option<Duration>,

    /// Interval between stability samples
    pub stability_interval: Duration,

    /// Maximum wait for an item to become stable
    pub stability_timeout: Duration,

    /// Consecutive equal samples required (never fewer than 2)
    pub stability_samples: usize,

    /// Number of queue workers
    pub workers: usize,

    /// Bound on a single catalog request
    pub catalog_timeout: Duration,

    /// Bound on a single ffprobe run
    pub probe_timeout: Duration,

    /// Attempts for retryable failures (catalog unavailable, probe failure)
    pub retry_attempts: u32,

    /// Tie-break policy for equally scored catalog candidates
    pub tie_break: TieBreak,

    /// Videos smaller than this inside a directory bundle are treated as samples
    pub min_primary_bytes: u64,

    /// Extras and edition vocabularies
    pub vocabulary: Vocabulary,

    /// Path to the ffprobe executable
    pub ffprobe_path: String,

    /// Log output format
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let source_dir = PathBuf::from(get("SOURCE_DIR").unwrap_or_else(|| "/watch".to_string()));
        let dest_base_dir =
            PathBuf::from(get("DEST_BASE_DIR").unwrap_or_else(|| "/data".to_string()));
        let tv_dir = get("TV_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| dest_base_dir.join("tv"));
        let movies_dir = get("MOVIES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| dest_base_dir.join("movies"));

        let confidence_threshold: u8 = get("CONFIDENCE_THRESHOLD")
            .unwrap_or_else(|| "85".to_string())
            .trim()
            .parse()
            .context("Invalid CONFIDENCE_THRESHOLD")?;

        let secs = |key: &str, default: u64| -> Result<Duration> {
            match get(key) {
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("Invalid {}", key)),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let mut vocabulary = Vocabulary::default();
        if let Some(list) = get("EXTRAS_KEYWORDS") {
            vocabulary.extras = Vocabulary::parse_extras(&list)?;
        }
        if let Some(list) = get("EDITION_KEYWORDS") {
            vocabulary.editions = Vocabulary::parse_editions(&list)?;
        }

        let config = Self {
            tvdb_api_key: get("TVDB_API_KEY"),
            tvdb_pin: get("TVDB_PIN"),
            source_dir,
            dest_base_dir,
            tv_dir,
            movies_dir,
            failure_dir: get("FAILURE_DIR").map(PathBuf::from),
            confidence_threshold,
            delete_source_files: get("DELETE_SOURCE_FILES")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            delete_source_on_skip: get("DELETE_SOURCE_ON_SKIP")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            process_delay: secs("PROCESS_DELAY", 5)?,
            watch_max_tracking: secs("WATCH_MAX_TRACKING", 6 * 60 * 60)?,
            watch_poll_interval: match get("WATCH_POLL_INTERVAL") {
                Some(_) => Some(secs("WATCH_POLL_INTERVAL", 0)?),
                None => None,
            },
            stability_interval: secs("BUNDLE_STABILITY_CHECK_INTERVAL", 2)?,
            stability_timeout: secs("BUNDLE_STABILITY_TIMEOUT", 300)?,
            stability_samples: get("STABILITY_SAMPLES")
                .map(|v| v.trim().parse::<usize>())
                .transpose()
                .context("Invalid STABILITY_SAMPLES")?
                .unwrap_or(2)
                .max(2),
            workers: get("WORKERS")
                .map(|v| v.trim().parse::<usize>())
                .transpose()
                .context("Invalid WORKERS")?
                .unwrap_or(1),
            catalog_timeout: secs("CATALOG_TIMEOUT", 30)?,
            probe_timeout: secs("PROBE_TIMEOUT", 60)?,
            retry_attempts: get("RETRY_ATTEMPTS")
                .map(|v| v.trim().parse::<u32>())
                .transpose()
                .context("Invalid RETRY_ATTEMPTS")?
                .unwrap_or(3),
            tie_break: get("TIE_BREAK")
                .map(|v| v.parse::<TieBreak>())
                .transpose()?
                .unwrap_or_default(),
            min_primary_bytes: get("MIN_PRIMARY_SIZE_MB")
                .map(|v| v.trim().parse::<u64>())
                .transpose()
                .context("Invalid MIN_PRIMARY_SIZE_MB")?
                .unwrap_or(50)
                .checked_mul(1024 * 1024)
                .context("MIN_PRIMARY_SIZE_MB is too large")?,
            vocabulary,
            ffprobe_path: get("FFPROBE_PATH").unwrap_or_else(|| "ffprobe".to_string()),
            log_format: get("LOG_FORMAT")
                .map(|v| v.parse::<LogFormat>())
                .transpose()?
                .unwrap_or(LogFormat::Pretty),
        };

        config.validate()?;
        Ok(config)
    }

    /// Defaults rooted at the given source and destination directories
    pub fn with_roots(source_dir: impl Into<PathBuf>, dest_base_dir: impl Into<PathBuf>) -> Self {
        let source_dir = source_dir.into();
        let dest_base_dir = dest_base_dir.into();
        Self {
            tvdb_api_key: None,
            tvdb_pin: None,
            tv_dir: dest_base_dir.join("tv"),
            movies_dir: dest_base_dir.join("movies"),
            source_dir,
            dest_base_dir,
            failure_dir: None,
            confidence_threshold: 85,
            delete_source_files: false,
            delete_source_on_skip: false,
            process_delay: Duration::from_secs(5),
            watch_max_tracking: Duration::from_secs(6 * 60 * 60),
            watch_poll_interval: None,
            stability_interval: Duration::from_secs(2),
            stability_timeout: Duration::from_secs(300),
            stability_samples: 2,
            workers: 1,
            catalog_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(60),
            retry_attempts: 3,
            tie_break: TieBreak::default(),
            min_primary_bytes: 50 * 1024 * 1024,
            vocabulary: Vocabulary::default(),
            ffprobe_path: "ffprobe".to_string(),
            log_format: LogFormat::Pretty,
        }
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.confidence_threshold > 100 {
            anyhow::bail!(
                "CONFIDENCE_THRESHOLD must be between 0 and 100, got {}",
                self.confidence_threshold
            );
        }
        if self.workers == 0 {
            anyhow::bail!("WORKERS must be at least 1");
        }
        if self.retry_attempts == 0 {
            anyhow::bail!("RETRY_ATTEMPTS must be at least 1");
        }
        if self.stability_interval.is_zero() {
            anyhow::bail!("BUNDLE_STABILITY_CHECK_INTERVAL must be greater than zero");
        }
        for root in [&self.tv_dir, &self.movies_dir] {
            if root.starts_with(&self.source_dir) {
                anyhow::bail!(
                    "Library root {} must not live inside the watched source {}",
                    root.display(),
                    self.source_dir.display()
                );
            }
        }
        if let Some(failure_dir) = &self.failure_dir {
            if failure_dir.starts_with(&self.source_dir) {
                anyhow::bail!(
                    "FAILURE_DIR {} must not live inside the watched source {}",
                    failure_dir.display(),
                    self.source_dir.display()
                );
            }
        }
        Ok(())
    }

    /// Library root for a media type
    pub fn category_root(&self, media_type: MediaType) -> &Path {
        match media_type {
            MediaType::Movie => &self.movies_dir,
            MediaType::Series => &self.tv_dir,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "t" | "yes" | "y"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.source_dir, PathBuf::from("/watch"));
        assert_eq!(config.tv_dir, PathBuf::from("/data/tv"));
        assert_eq!(config.movies_dir, PathBuf::from("/data/movies"));
        assert_eq!(config.confidence_threshold, 85);
        assert!(!config.delete_source_files);
        assert_eq!(config.process_delay, Duration::from_secs(5));
        assert_eq!(config.stability_interval, Duration::from_secs(2));
        assert_eq!(config.stability_timeout, Duration::from_secs(300));
        assert_eq!(config.stability_samples, 2);
        assert_eq!(config.tie_break, TieBreak::YearThenCatalogOrder);
        assert!(config.failure_dir.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("SOURCE_DIR", "/downloads/complete"),
            ("DEST_BASE_DIR", "/library"),
            ("MOVIES_DIR", "/films"),
            ("CONFIDENCE_THRESHOLD", "90"),
            ("DELETE_SOURCE_FILES", "t"),
            ("PROCESS_DELAY", "12"),
            ("TIE_BREAK", "catalog"),
            ("FAILURE_DIR", "/library/.failed"),
        ]))
        .unwrap();

        assert_eq!(config.tv_dir, PathBuf::from("/library/tv"));
        assert_eq!(config.movies_dir, PathBuf::from("/films"));
        assert_eq!(config.confidence_threshold, 90);
        assert!(config.delete_source_files);
        assert_eq!(config.process_delay, Duration::from_secs(12));
        assert_eq!(config.tie_break, TieBreak::CatalogOrder);
        assert_eq!(config.failure_dir, Some(PathBuf::from("/library/.failed")));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        assert!(Config::from_lookup(lookup(&[("CONFIDENCE_THRESHOLD", "101")])).is_err());
        assert!(Config::from_lookup(lookup(&[("CONFIDENCE_THRESHOLD", "abc")])).is_err());
    }

    #[test]
    fn test_stability_samples_never_below_two() {
        let config = Config::from_lookup(lookup(&[("STABILITY_SAMPLES", "1")])).unwrap();
        assert_eq!(config.stability_samples, 2);
    }

    #[test]
    fn test_library_inside_source_rejected() {
        let result = Config::from_lookup(lookup(&[
            ("SOURCE_DIR", "/data"),
            ("DEST_BASE_DIR", "/data"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_failure_dir_inside_source_rejected() {
        let result = Config::from_lookup(lookup(&[
            ("SOURCE_DIR", "/downloads"),
            ("FAILURE_DIR", "/downloads/.failed"),
        ]));
        assert!(result.is_err());

        let config = Config::from_lookup(lookup(&[
            ("SOURCE_DIR", "/downloads"),
            ("FAILURE_DIR", "/downloads-failed"),
        ]))
        .unwrap();
        assert_eq!(config.failure_dir, Some(PathBuf::from("/downloads-failed")));
    }

    #[test]
    fn test_min_primary_size() {
        let config = Config::from_lookup(lookup(&[("MIN_PRIMARY_SIZE_MB", "200")])).unwrap();
        assert_eq!(config.min_primary_bytes, 200 * 1024 * 1024);

        let huge = (u64::MAX / 1024).to_string();
        let err = Config::from_lookup(lookup(&[("MIN_PRIMARY_SIZE_MB", huge.as_str())])).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_vocabulary_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("EXTRAS_KEYWORDS", "Making Of=behind-the-scenes, promo=trailer"),
            ("EDITION_KEYWORDS", "Final Cut=Final Cut"),
        ]))
        .unwrap();

        assert_eq!(
            config.vocabulary.extras,
            vec![
                ("makingof".to_string(), ExtraKind::BehindTheScenes),
                ("promo".to_string(), ExtraKind::Trailer),
            ]
        );
        assert_eq!(
            config.vocabulary.editions,
            vec![("final cut".to_string(), "Final Cut".to_string())]
        );
    }

    #[test]
    fn test_invalid_extras_kind_rejected() {
        assert!(Config::from_lookup(lookup(&[("EXTRAS_KEYWORDS", "promo=commercial")])).is_err());
    }
}
