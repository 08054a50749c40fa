//! Error taxonomy for the ingestion pipeline
//!
//! Every failure a worker can hit after dequeuing an item is a
//! [`PipelineError`]. The worker converts it into a failure-sink record and
//! moves on; none of them stop the watcher or the queue.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::services::resolver::ScoredCandidate;

/// Failure modes of the metadata catalog collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("no catalog record found")]
    NotFound,

    #[error("catalog rate limit exceeded")]
    RateLimited,

    #[error("catalog unavailable: {0}")]
    Unavailable(String),

    #[error("catalog rejected the configured credentials")]
    Unauthorized,
}

impl CatalogError {
    /// Whether a later attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Unavailable(_))
    }
}

/// Failure modes of the media probe collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("failed to run probe: {0}")]
    Spawn(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe rejected the file: {0}")]
    Failed(String),

    #[error("file has no video stream")]
    NoVideoStream,
}

/// Why a catalog match could not be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionFailure {
    LowConfidence,
    NotFound,
    CatalogUnavailable,
    NoEpisodeMatch,
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LowConfidence => "low confidence",
            Self::NotFound => "not found",
            Self::CatalogUnavailable => "catalog unavailable",
            Self::NoEpisodeMatch => "no season/episode match",
        };
        f.write_str(s)
    }
}

/// Pipeline stage an item failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Stability,
    Classification,
    Resolution,
    Arbitration,
    Placement,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("item did not settle within {}s ({samples} samples)", waited.as_secs())]
    StabilityTimeout { waited: Duration, samples: usize },

    #[error("unclassifiable bundle: {0}")]
    Unclassifiable(String),

    #[error("resolution failed ({reason}): {detail}")]
    Resolution {
        reason: ResolutionFailure,
        detail: String,
        best: Option<ScoredCandidate>,
    },

    #[error("probe failed for {}: {source}", path.display())]
    Probe {
        path: PathBuf,
        #[source]
        source: ProbeError,
    },

    #[error("placement failed at {}: {source}", path.display())]
    Placement {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    pub fn resolution(
        reason: ResolutionFailure,
        detail: impl Into<String>,
        best: Option<ScoredCandidate>,
    ) -> Self {
        Self::Resolution {
            reason,
            detail: detail.into(),
            best,
        }
    }

    pub fn placement(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Placement {
            path: path.into(),
            source,
        }
    }

    /// Stable machine-readable name of the taxonomy member
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StabilityTimeout { .. } => "stability_timeout",
            Self::Unclassifiable(_) => "unclassifiable_bundle",
            Self::Resolution { .. } => "resolution_failure",
            Self::Probe { .. } => "probe_failure",
            Self::Placement { .. } => "placement_failure",
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::StabilityTimeout { .. } => Stage::Stability,
            Self::Unclassifiable(_) => Stage::Classification,
            Self::Resolution { .. } => Stage::Resolution,
            Self::Probe { .. } => Stage::Arbitration,
            Self::Placement { .. } => Stage::Placement,
        }
    }

    /// Only catalog outages and probe failures get a bounded retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Resolution {
                reason: ResolutionFailure::CatalogUnavailable,
                ..
            } | Self::Probe { .. }
        )
    }

    pub fn best_candidate(&self) -> Option<&ScoredCandidate> {
        match self {
            Self::Resolution { best, .. } => best.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_outages_and_probe_failures_are_retryable() {
        assert!(
            PipelineError::resolution(ResolutionFailure::CatalogUnavailable, "timeout", None)
                .is_retryable()
        );
        assert!(
            PipelineError::Probe {
                path: PathBuf::from("/in/a.mkv"),
                source: ProbeError::Timeout(Duration::from_secs(60)),
            }
            .is_retryable()
        );

        assert!(
            !PipelineError::resolution(ResolutionFailure::LowConfidence, "62 < 85", None)
                .is_retryable()
        );
        assert!(!PipelineError::Unclassifiable("no primary".into()).is_retryable());
        assert!(
            !PipelineError::placement("/lib/x", io::Error::other("disk full")).is_retryable()
        );
        assert!(
            !PipelineError::StabilityTimeout {
                waited: Duration::from_secs(300),
                samples: 150,
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_kind_and_stage() {
        let err = PipelineError::resolution(ResolutionFailure::NotFound, "no results", None);
        assert_eq!(err.kind(), "resolution_failure");
        assert_eq!(err.stage(), Stage::Resolution);
        assert_eq!(
            err.to_string(),
            "resolution failed (not found): no results"
        );
    }

    #[test]
    fn test_catalog_error_transience() {
        assert!(CatalogError::RateLimited.is_transient());
        assert!(CatalogError::Unavailable("503".into()).is_transient());
        assert!(!CatalogError::NotFound.is_transient());
        assert!(!CatalogError::Unauthorized.is_transient());
    }
}
