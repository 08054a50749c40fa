//! Failure sink
//!
//! Every item that fails after dequeue becomes a [`FailureRecord`]. With a
//! failure directory configured the record is written there as pretty JSON
//! (temp file, then rename); otherwise it is only logged. The source item is
//! never touched.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{PipelineError, ResolutionFailure, Stage};
use crate::services::resolver::ScoredCandidate;

/// Diagnostic record for manual review
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub item: PathBuf,
    pub stage: Stage,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_failure: Option<ResolutionFailure>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_candidate: Option<ScoredCandidate>,
}

impl FailureRecord {
    pub fn from_error(item: &Path, err: &PipelineError) -> Self {
        let resolution_failure = match err {
            PipelineError::Resolution { reason, .. } => Some(*reason),
            _ => None,
        };
        Self {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            item: item.to_path_buf(),
            stage: err.stage(),
            kind: err.kind(),
            resolution_failure,
            reason: err.to_string(),
            best_candidate: err.best_candidate().cloned(),
        }
    }

    /// File name of the record: `<timestamp>-<item name>-<id>.json`
    pub fn file_name(&self) -> String {
        let item = self
            .item
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "item".to_string());
        format!(
            "{}-{}-{}.json",
            self.recorded_at.format("%Y%m%dT%H%M%S"),
            sanitize_filename::sanitize(item),
            self.id.simple()
        )
    }
}

/// Where failure records go
#[derive(Debug, Clone)]
pub struct FailureSink {
    dir: Option<PathBuf>,
}

impl FailureSink {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// Log the record and persist it when a directory is configured.
    ///
    /// Returns the written path. Write failures are logged, never raised.
    pub async fn record(&self, record: &FailureRecord) -> Option<PathBuf> {
        error!(
            item = %record.item.display(),
            stage = ?record.stage,
            kind = record.kind,
            best_candidate = ?record.best_candidate.as_ref().map(|c| c.candidate.title.as_str()),
            best_score = ?record.best_candidate.as_ref().map(|c| c.score),
            reason = %record.reason,
            "Item routed to failure sink"
        );

        let dir = self.dir.as_ref()?;
        match write_record(dir, record).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to write failure record");
                None
            }
        }
    }
}

async fn write_record(dir: &Path, record: &FailureRecord) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let json = serde_json::to_vec_pretty(record)?;

    let path = dir.join(record.file_name());
    let temp = dir.join(format!(".{}.tmp", record.id.simple()));
    tokio::fs::write(&temp, json).await?;
    tokio::fs::rename(&temp, &path).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::metadata::{CatalogCandidate, MediaType};
    use std::time::Duration;
    use tempfile::TempDir;

    fn low_confidence() -> PipelineError {
        PipelineError::resolution(
            ResolutionFailure::LowConfidence,
            "best match scored 60.0",
            Some(ScoredCandidate {
                candidate: CatalogCandidate {
                    id: "42".into(),
                    title: "Something Else".into(),
                    alternate_titles: Vec::new(),
                    year: Some(1999),
                    media_type: MediaType::Movie,
                },
                score: 60.0,
                matched_title: "Something Else".into(),
            }),
        )
    }

    #[test]
    fn test_record_carries_best_candidate() {
        let record = FailureRecord::from_error(Path::new("/watch/Movie.2020.mkv"), &low_confidence());
        assert_eq!(record.stage, Stage::Resolution);
        assert_eq!(record.kind, "resolution_failure");
        assert_eq!(record.resolution_failure, Some(ResolutionFailure::LowConfidence));
        assert_eq!(record.best_candidate.as_ref().unwrap().candidate.id, "42");
        assert!(record.file_name().contains("Movie.2020.mkv"));
    }

    #[tokio::test]
    async fn test_record_is_written_as_json() {
        let dir = TempDir::new().unwrap();
        let sink = FailureSink::new(Some(dir.path().join("failed")));
        let record = FailureRecord::from_error(Path::new("/watch/Movie.2020.mkv"), &low_confidence());

        let path = sink.record(&record).await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();

        assert_eq!(json["stage"], "resolution");
        assert_eq!(json["resolution_failure"], "low_confidence");
        assert_eq!(json["best_candidate"]["score"], 60.0);
        assert_eq!(json["best_candidate"]["candidate"]["title"], "Something Else");
        assert_eq!(std::fs::read_dir(dir.path().join("failed")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_without_directory_only_logs() {
        let sink = FailureSink::new(None);
        let err = PipelineError::StabilityTimeout {
            waited: Duration::from_secs(300),
            samples: 150,
        };
        let record = FailureRecord::from_error(Path::new("/watch/slow"), &err);
        assert!(record.best_candidate.is_none());
        assert!(sink.record(&record).await.is_none());
    }
}
