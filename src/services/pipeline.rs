//! Ingestion pipeline
//!
//! A worker takes one settled item at a time through
//! stability → classification → resolution → arbitration → placement.
//! Each stage returns `Result<next stage input, PipelineError>`; the first
//! error ends the attempt and becomes a failure-sink record. Nothing here
//! stops the watcher or the queue.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::arbiter::{PlacementDecision, QualityArbiter};
use super::classifier::{Bundle, BundleClassifier};
use super::failure_sink::{FailureRecord, FailureSink};
use super::ffmpeg::MediaProbe;
use super::file_utils::extension_of;
use super::metadata::{MediaIdentity, MediaType, MetadataCatalog};
use super::naming::{MediaTarget, PathFormatter, PlexPathFormatter, stem_of};
use super::placement::{self, PlacementPlan, PlacementReport, PrimaryAssignment, SkippedPrimary};
use super::queues::{IdentityLocks, WorkQueue};
use super::rate_limiter::RetryConfig;
use super::resolver::{MetadataResolver, ScoredCandidate};
use super::stability::{StabilityDetector, StabilityOutcome};
use crate::config::Config;
use crate::error::PipelineError;

/// How one item's processing ended
#[derive(Debug)]
pub enum ItemOutcome {
    /// Files were committed to the library
    Placed {
        report: PlacementReport,
        skipped: Vec<SkippedPrimary>,
        source_removed: bool,
    },
    /// Every primary was skipped (lower quality or duplicate)
    Skipped {
        skipped: Vec<SkippedPrimary>,
        source_removed: bool,
    },
    /// Dry run: what would have been done
    Planned(PlacementPlan),
    /// Routed to the failure sink
    Failed(Box<FailureRecord>),
    /// The item disappeared before it settled
    Vanished,
    Cancelled,
}

impl ItemOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// A bundle with its accepted catalog match
struct Resolved {
    bundle: Bundle,
    matched: ScoredCandidate,
}

pub struct Pipeline {
    config: Arc<Config>,
    stability: StabilityDetector,
    classifier: Arc<BundleClassifier>,
    resolver: MetadataResolver,
    arbiter: QualityArbiter,
    formatter: Arc<dyn PathFormatter>,
    failures: FailureSink,
    locks: Arc<IdentityLocks>,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        catalog: Arc<dyn MetadataCatalog>,
        probe: Arc<dyn MediaProbe>,
    ) -> Self {
        Self {
            stability: StabilityDetector::from_config(&config),
            classifier: Arc::new(BundleClassifier::from_config(&config)),
            resolver: MetadataResolver::new(catalog, &config),
            arbiter: QualityArbiter::new(probe, &config),
            formatter: Arc::new(PlexPathFormatter),
            failures: FailureSink::new(config.failure_dir.clone()),
            locks: IdentityLocks::new(),
            config,
        }
    }

    /// Override the retry policy for catalog lookups and probes
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.resolver = self.resolver.with_retry(retry.clone());
        self.arbiter = self.arbiter.with_retry(retry);
        self
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn PathFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Wait for the item to settle, then process it
    pub async fn process(&self, item: &Path, cancel: &CancellationToken) -> ItemOutcome {
        info!(item = %item.display(), "Waiting for item to settle");

        match self.stability.wait(item, cancel).await {
            StabilityOutcome::Stable(sample) => {
                debug!(
                    item = %item.display(),
                    files = sample.file_count,
                    bytes = sample.total_bytes,
                    "Item settled"
                );
                self.process_now(item, false).await
            }
            StabilityOutcome::TimedOut { waited, samples } => {
                self.fail(item, PipelineError::StabilityTimeout { waited, samples })
                    .await
            }
            StabilityOutcome::Vanished => {
                info!(item = %item.display(), "Item vanished before settling");
                ItemOutcome::Vanished
            }
            StabilityOutcome::Cancelled => ItemOutcome::Cancelled,
        }
    }

    /// Process an item immediately, skipping the stability wait
    pub async fn process_now(&self, item: &Path, dry_run: bool) -> ItemOutcome {
        match self.run_stages(item, dry_run).await {
            Ok(outcome) => outcome,
            Err(err) => self.fail(item, err).await,
        }
    }

    async fn run_stages(&self, item: &Path, dry_run: bool) -> Result<ItemOutcome, PipelineError> {
        let bundle = self.classify(item).await?;
        let resolved = self.resolve(bundle).await?;
        let targets = self.targets(&resolved);

        if dry_run {
            let assignments = self.arbitrate(&resolved.bundle, targets).await?;
            let plan = self.plan(&resolved.bundle, &assignments);
            return Ok(ItemOutcome::Planned(plan));
        }

        // Held from the existing-version lookup until the commit is done
        let identities: BTreeSet<MediaIdentity> =
            targets.iter().flat_map(MediaTarget::identities).collect();
        let _guard = self.locks.acquire_all(identities).await;

        let assignments = self.arbitrate(&resolved.bundle, targets).await?;
        let plan = self.plan(&resolved.bundle, &assignments);
        self.place(&resolved.bundle, plan).await
    }

    async fn classify(&self, item: &Path) -> Result<Bundle, PipelineError> {
        let classifier = Arc::clone(&self.classifier);
        let path = item.to_path_buf();
        tokio::task::spawn_blocking(move || classifier.classify(&path))
            .await
            .map_err(|e| PipelineError::Unclassifiable(format!("classifier task failed: {}", e)))?
    }

    async fn resolve(&self, bundle: Bundle) -> Result<Resolved, PipelineError> {
        let query = bundle.query();
        let matched = self.resolver.resolve(&query).await?;

        if bundle.media_type == MediaType::Series {
            self.resolver
                .validate_episodes(&matched, &bundle.episodes())
                .await?;
        }

        Ok(Resolved { bundle, matched })
    }

    /// Destination identity of every primary, in primary order
    fn targets(&self, resolved: &Resolved) -> Vec<MediaTarget> {
        let candidate = &resolved.matched.candidate;
        resolved
            .bundle
            .primaries
            .iter()
            .map(|primary| {
                let series = resolved.bundle.media_type == MediaType::Series;
                MediaTarget {
                    media_type: resolved.bundle.media_type,
                    catalog_id: candidate.id.clone(),
                    title: candidate.title.clone(),
                    year: candidate.year.or(resolved.bundle.context.year),
                    season: primary.parsed.season.filter(|_| series),
                    episode: primary.parsed.episode.filter(|_| series),
                    end_episode: primary.parsed.end_episode.filter(|_| series),
                    edition: primary.edition.clone(),
                }
            })
            .collect()
    }

    async fn arbitrate(
        &self,
        bundle: &Bundle,
        targets: Vec<MediaTarget>,
    ) -> Result<Vec<PrimaryAssignment>, PipelineError> {
        let root = self.config.category_root(bundle.media_type);
        let mut assignments = Vec::with_capacity(targets.len());

        for (index, target) in targets.into_iter().enumerate() {
            let primary = &bundle.primaries[index];
            let extension = extension_of(&primary.path).unwrap_or_else(|| "mkv".to_string());
            let base = placement::primary_base(self.formatter.as_ref(), &target, &extension);
            let dest_dir = base
                .parent()
                .map(|p| root.join(p))
                .unwrap_or_else(|| root.to_path_buf());

            let decision = self
                .arbiter
                .arbitrate(&primary.path, &dest_dir, &stem_of(&base))
                .await?;
            assignments.push(PrimaryAssignment {
                index,
                target,
                decision,
            });
        }
        Ok(assignments)
    }

    fn plan(&self, bundle: &Bundle, assignments: &[PrimaryAssignment]) -> PlacementPlan {
        placement::plan(
            bundle,
            assignments,
            self.config.category_root(bundle.media_type),
            self.formatter.as_ref(),
        )
    }

    async fn place(&self, bundle: &Bundle, plan: PlacementPlan) -> Result<ItemOutcome, PipelineError> {
        let all_skipped = plan.all_primaries_skipped();
        let report = placement::execute(&plan).await?;

        let remove = if all_skipped {
            self.config.delete_source_files && self.config.delete_source_on_skip
        } else {
            self.config.delete_source_files
        };
        let source_removed = remove && self.remove_source(bundle).await;

        if all_skipped {
            for skipped in &plan.skipped {
                info!(
                    file = %skipped.source.display(),
                    decision = %skipped.decision,
                    "Primary not placed"
                );
            }
            return Ok(ItemOutcome::Skipped {
                skipped: plan.skipped,
                source_removed,
            });
        }

        info!(
            item = %bundle.root.display(),
            placed = report.placed.len(),
            superseded = report.superseded.len(),
            skipped = plan.skipped.len(),
            "Bundle placed"
        );
        Ok(ItemOutcome::Placed {
            report,
            skipped: plan.skipped,
            source_removed,
        })
    }

    async fn remove_source(&self, bundle: &Bundle) -> bool {
        match placement::remove_source(bundle).await {
            Ok(()) => true,
            Err(e) => {
                warn!(item = %bundle.root.display(), error = %e, "Failed to remove source item");
                false
            }
        }
    }

    async fn fail(&self, item: &Path, err: PipelineError) -> ItemOutcome {
        let record = FailureRecord::from_error(item, &err);
        self.failures.record(&record).await;
        ItemOutcome::Failed(Box::new(record))
    }
}

/// Drain the queue one item at a time until cancelled
pub async fn run_worker(
    id: usize,
    pipeline: Arc<Pipeline>,
    queue: Arc<WorkQueue>,
    cancel: CancellationToken,
) {
    info!(worker = id, "Worker started");

    while let Some(lease) = queue.dequeue(&cancel).await {
        let item: PathBuf = lease.path().to_path_buf();
        info!(worker = id, item = %item.display(), "Processing item");

        let outcome = pipeline.process(&item, &cancel).await;
        match &outcome {
            ItemOutcome::Placed { report, .. } => {
                info!(worker = id, item = %item.display(), files = report.placed.len(), "Item done")
            }
            ItemOutcome::Skipped { skipped, .. } => {
                let reasons: Vec<String> = skipped.iter().map(|s| s.decision.to_string()).collect();
                info!(worker = id, item = %item.display(), reasons = ?reasons, "Item skipped")
            }
            ItemOutcome::Failed(record) => {
                warn!(worker = id, item = %item.display(), kind = record.kind, "Item failed")
            }
            ItemOutcome::Vanished | ItemOutcome::Planned(_) => {}
            ItemOutcome::Cancelled => {
                info!(worker = id, item = %item.display(), "Item abandoned on shutdown")
            }
        }
        drop(lease);
    }

    info!(worker = id, "Worker stopped");
}

/// Human-readable summary line for a decision, used by the organize command
pub fn describe_decision(decision: &PlacementDecision) -> String {
    match decision {
        PlacementDecision::New => "new".to_string(),
        PlacementDecision::UpgradeReplace { replaces } => format!(
            "upgrade-replace ({})",
            replaces
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        PlacementDecision::UpgradeAddAlongside { existing } => {
            format!("upgrade-add-alongside ({} existing)", existing.len())
        }
        PlacementDecision::SkipLowerQuality { better } => {
            format!("skip-lower-quality (kept {})", better.display())
        }
        PlacementDecision::DuplicateIgnore { existing } => {
            format!("duplicate-ignore (same as {})", existing.display())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_decision() {
        assert_eq!(describe_decision(&PlacementDecision::New), "new");
        assert_eq!(
            describe_decision(&PlacementDecision::UpgradeAddAlongside {
                existing: vec![PathBuf::from("a"), PathBuf::from("b")]
            }),
            "upgrade-add-alongside (2 existing)"
        );
    }

    #[test]
    fn test_failed_outcome_is_failure() {
        let record = FailureRecord::from_error(
            Path::new("/watch/x"),
            &PipelineError::Unclassifiable("no primary".into()),
        );
        assert!(ItemOutcome::Failed(Box::new(record)).is_failure());
        assert!(!ItemOutcome::Vanished.is_failure());
    }
}
