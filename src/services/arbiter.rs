//! Quality arbiter
//!
//! Decides, per primary file, how an incoming file relates to the versions
//! already in the library for the same media identity. Decisions only; the
//! placement engine performs every filesystem change.

use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::ffmpeg::{MediaProbe, QualityRecord};
use super::file_utils::is_video_file;
use super::naming::{covers_episodes, is_version_of, stem_of};
use super::rate_limiter::{RetryConfig, retry_async};
use crate::config::Config;
use crate::error::{PipelineError, ProbeError};

/// Bytes hashed from each end of a file for duplicate detection
const DIGEST_SAMPLE_BYTES: u64 = 1024 * 1024;

/// What to do with one incoming primary file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PlacementDecision {
    /// No existing version of this identity
    New,
    /// Incoming is strictly better than these versions, which are superseded
    UpgradeReplace { replaces: Vec<PathBuf> },
    /// Quality equal or unknown; keep everything and add a new version
    UpgradeAddAlongside { existing: Vec<PathBuf> },
    /// An existing version is strictly better
    SkipLowerQuality { better: PathBuf },
    /// Byte-identical to an existing version
    DuplicateIgnore { existing: PathBuf },
}

impl PlacementDecision {
    /// Whether the incoming primary will be written to the library
    pub fn places_file(&self) -> bool {
        matches!(
            self,
            Self::New | Self::UpgradeReplace { .. } | Self::UpgradeAddAlongside { .. }
        )
    }
}

impl fmt::Display for PlacementDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::UpgradeReplace { .. } => "upgrade-replace",
            Self::UpgradeAddAlongside { .. } => "upgrade-add-alongside",
            Self::SkipLowerQuality { .. } => "skip-lower-quality",
            Self::DuplicateIgnore { .. } => "duplicate-ignore",
        };
        f.write_str(s)
    }
}

/// Combine per-version comparisons into one decision.
///
/// `comparisons` pairs each existing version with `incoming.compare(existing)`.
/// Versions the incoming file strictly exceeds are replaced; when it exceeds
/// none and some version is strictly better it is skipped; anything else is
/// added alongside.
pub fn decide(comparisons: &[(PathBuf, Option<Ordering>)]) -> PlacementDecision {
    if comparisons.is_empty() {
        return PlacementDecision::New;
    }

    let replaces: Vec<PathBuf> = comparisons
        .iter()
        .filter(|(_, ordering)| *ordering == Some(Ordering::Greater))
        .map(|(path, _)| path.clone())
        .collect();
    if !replaces.is_empty() {
        return PlacementDecision::UpgradeReplace { replaces };
    }

    if let Some((better, _)) = comparisons
        .iter()
        .find(|(_, ordering)| *ordering == Some(Ordering::Less))
    {
        return PlacementDecision::SkipLowerQuality {
            better: better.clone(),
        };
    }

    PlacementDecision::UpgradeAddAlongside {
        existing: comparisons.iter().map(|(path, _)| path.clone()).collect(),
    }
}

/// Existing library versions of a primary: videos in `dir` whose stem is
/// `base_stem` or `base_stem - Version`, plus episode files whose episode
/// range overlaps the one in `base_stem`
pub fn existing_versions(dir: &Path, base_stem: &str) -> io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut versions = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_video_file(&path) && is_version_of(&stem_of(&path), base_stem) {
            versions.push(path);
        }
    }
    versions.sort();
    Ok(versions)
}

/// Size plus SHA-256 over the first and last MiB
pub fn sampled_digest(path: &Path) -> io::Result<(u64, Vec<u8>)> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut hasher = Sha256::new();
    hasher.update(size.to_le_bytes());

    let mut buffer = Vec::with_capacity(DIGEST_SAMPLE_BYTES as usize);
    (&mut file).take(DIGEST_SAMPLE_BYTES).read_to_end(&mut buffer)?;
    hasher.update(&buffer);

    if size > DIGEST_SAMPLE_BYTES {
        let tail_start = size.saturating_sub(DIGEST_SAMPLE_BYTES).max(DIGEST_SAMPLE_BYTES);
        file.seek(SeekFrom::Start(tail_start))?;
        buffer.clear();
        file.take(DIGEST_SAMPLE_BYTES).read_to_end(&mut buffer)?;
        hasher.update(&buffer);
    }

    Ok((size, hasher.finalize().to_vec()))
}

/// Probe-backed arbiter
pub struct QualityArbiter {
    probe: Arc<dyn MediaProbe>,
    retry: RetryConfig,
}

impl QualityArbiter {
    pub fn new(probe: Arc<dyn MediaProbe>, config: &Config) -> Self {
        Self {
            probe,
            retry: RetryConfig::with_attempts(config.retry_attempts),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Decide how `incoming` relates to the versions of `base_stem` in `dest_dir`
    pub async fn arbitrate(
        &self,
        incoming: &Path,
        dest_dir: &Path,
        base_stem: &str,
    ) -> Result<PlacementDecision, PipelineError> {
        let existing = {
            let dir = dest_dir.to_path_buf();
            let base = base_stem.to_string();
            blocking(move || existing_versions(&dir, &base))
                .await
                .map_err(|e| PipelineError::placement(dest_dir, e))?
        };

        if existing.is_empty() {
            debug!(base = %base_stem, "No existing version");
            return Ok(PlacementDecision::New);
        }

        if let Some(duplicate) = self.find_duplicate(incoming, &existing).await {
            info!(
                file = %incoming.display(),
                existing = %duplicate.display(),
                "Identical file already in library"
            );
            return Ok(PlacementDecision::DuplicateIgnore { existing: duplicate });
        }

        let incoming_quality = self.probe_incoming(incoming).await?;

        let mut comparisons = Vec::with_capacity(existing.len());
        for path in existing {
            let ordering = match self.probe.probe(&path).await {
                Ok(existing_quality) => {
                    debug!(
                        existing = %path.display(),
                        incoming = %incoming_quality,
                        current = %existing_quality,
                        "Compared quality"
                    );
                    incoming_quality.compare(&existing_quality)
                }
                Err(e) => {
                    warn!(
                        existing = %path.display(),
                        error = %e,
                        "Could not probe existing version, quality undetermined"
                    );
                    None
                }
            };
            // A multi-episode file holds episodes the incoming file lacks
            let ordering = match ordering {
                Some(Ordering::Greater) if !covers_episodes(base_stem, &stem_of(&path)) => {
                    debug!(existing = %path.display(), "Existing version spans more episodes, keeping it");
                    None
                }
                other => other,
            };
            comparisons.push((path, ordering));
        }

        let decision = decide(&comparisons);
        info!(file = %incoming.display(), decision = %decision, "Quality decision");
        Ok(decision)
    }

    async fn probe_incoming(&self, incoming: &Path) -> Result<QualityRecord, PipelineError> {
        let probe = &self.probe;
        let (result, attempts) = retry_async(
            move || async move { probe.probe(incoming).await },
            &self.retry,
            "media probe",
            |e: &ProbeError| !matches!(e, ProbeError::NoVideoStream),
        )
        .await;

        result.map_err(|source| {
            warn!(file = %incoming.display(), attempts = attempts, error = %source, "Probe failed");
            PipelineError::Probe {
                path: incoming.to_path_buf(),
                source,
            }
        })
    }

    async fn find_duplicate(&self, incoming: &Path, existing: &[PathBuf]) -> Option<PathBuf> {
        let incoming_path = incoming.to_path_buf();
        let incoming_digest = match blocking(move || sampled_digest(&incoming_path)).await {
            Ok(digest) => digest,
            Err(e) => {
                warn!(file = %incoming.display(), error = %e, "Could not hash incoming file");
                return None;
            }
        };

        for path in existing {
            let candidate = path.clone();
            match blocking(move || sampled_digest(&candidate)).await {
                Ok(digest) if digest == incoming_digest => return Some(path.clone()),
                Ok(_) => {}
                Err(e) => warn!(existing = %path.display(), error = %e, "Could not hash existing file"),
            }
        }
        None
    }
}

/// Run blocking filesystem work off the runtime
async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}
