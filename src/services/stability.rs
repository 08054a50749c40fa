//! Bundle stability detection
//!
//! An item is stable once its aggregate size and latest modification time
//! stay unchanged for N consecutive samples taken `interval` apart. A
//! directory is sampled over every file beneath it, so a slow multi-file
//! copy keeps looking "active" until the last file stops growing.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Config;

/// Aggregate size and newest modification time of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilitySample {
    pub total_bytes: u64,
    pub latest_mtime: Option<SystemTime>,
    pub file_count: usize,
}

/// Result of waiting for an item to settle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityOutcome {
    Stable(StabilitySample),
    TimedOut { waited: Duration, samples: usize },
    /// The item disappeared while being sampled
    Vanished,
    Cancelled,
}

/// Take one sample of a file or directory tree
pub fn sample_path(path: &Path) -> io::Result<StabilitySample> {
    let metadata = std::fs::metadata(path)?;

    if metadata.is_file() {
        return Ok(StabilitySample {
            total_bytes: metadata.len(),
            latest_mtime: metadata.modified().ok(),
            file_count: 1,
        });
    }

    let mut sample = StabilitySample {
        total_bytes: 0,
        latest_mtime: None,
        file_count: 0,
    };

    for entry in WalkDir::new(path).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            // Files can be renamed away mid-walk by the downloader
            Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => {
                continue;
            }
            Err(e) => return Err(io::Error::other(e)),
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };

        sample.total_bytes += metadata.len();
        sample.file_count += 1;
        if let Ok(modified) = metadata.modified() {
            sample.latest_mtime = Some(match sample.latest_mtime {
                Some(latest) if latest >= modified => latest,
                _ => modified,
            });
        }
    }

    Ok(sample)
}

/// Repeatedly samples an item until it settles or the timeout elapses
#[derive(Debug, Clone)]
pub struct StabilityDetector {
    interval: Duration,
    timeout: Duration,
    required_samples: usize,
}

impl StabilityDetector {
    pub fn new(interval: Duration, timeout: Duration, required_samples: usize) -> Self {
        Self {
            interval,
            timeout,
            required_samples: required_samples.max(2),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.stability_interval,
            config.stability_timeout,
            config.stability_samples,
        )
    }

    pub fn required_samples(&self) -> usize {
        self.required_samples
    }

    /// Wait for `path` to settle, sampling the real filesystem
    pub async fn wait(&self, path: &Path, cancel: &CancellationToken) -> StabilityOutcome {
        self.wait_with(path, cancel, |p: PathBuf| async move {
            match tokio::task::spawn_blocking(move || sample_path(&p)).await {
                Ok(result) => result,
                Err(e) => Err(io::Error::other(e)),
            }
        })
        .await
    }

    /// Wait for `path` to settle using the given sampler
    pub async fn wait_with<F, Fut>(
        &self,
        path: &Path,
        cancel: &CancellationToken,
        mut sampler: F,
    ) -> StabilityOutcome
    where
        F: FnMut(PathBuf) -> Fut,
        Fut: Future<Output = io::Result<StabilitySample>>,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut previous: Option<StabilitySample> = None;
        let mut unchanged = 0usize;
        let mut samples = 0usize;

        loop {
            match sampler(path.to_path_buf()).await {
                Ok(sample) => {
                    samples += 1;
                    if sample.file_count == 0 {
                        // Nothing to move yet; an empty directory is never complete
                        previous = None;
                        unchanged = 0;
                    } else if previous == Some(sample) {
                        unchanged += 1;
                    } else {
                        previous = Some(sample);
                        unchanged = 1;
                    }

                    debug!(
                        item = %path.display(),
                        bytes = sample.total_bytes,
                        files = sample.file_count,
                        unchanged,
                        "Stability sample"
                    );

                    if unchanged >= self.required_samples {
                        info!(
                            item = %path.display(),
                            bytes = sample.total_bytes,
                            files = sample.file_count,
                            samples,
                            "Item is stable"
                        );
                        return StabilityOutcome::Stable(sample);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    info!(item = %path.display(), "Item vanished before it settled");
                    return StabilityOutcome::Vanished;
                }
                Err(e) => {
                    samples += 1;
                    warn!(item = %path.display(), error = %e, "Failed to sample item");
                    previous = None;
                    unchanged = 0;
                }
            }

            if Instant::now() >= deadline {
                let waited = started.elapsed();
                warn!(
                    item = %path.display(),
                    waited_secs = waited.as_secs(),
                    samples,
                    "Stability check timed out"
                );
                return StabilityOutcome::TimedOut { waited, samples };
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => return StabilityOutcome::Cancelled,
            }
        }
    }
}
