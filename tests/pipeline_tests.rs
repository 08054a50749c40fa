//! End-to-end pipeline tests
//!
//! Real files in temporary source and library directories, with an
//! in-memory catalog and a probe that reads quality off the file name.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use shelver::config::Config;
use shelver::error::{CatalogError, ProbeError, ResolutionFailure};
use shelver::services::arbiter::PlacementDecision;
use shelver::services::ffmpeg::{MediaProbe, QualityRecord};
use shelver::services::metadata::{CatalogCandidate, CatalogQuery, MediaType, MetadataCatalog};
use shelver::services::pipeline::{ItemOutcome, Pipeline, run_worker};
use shelver::services::queues::WorkQueue;
use shelver::services::rate_limiter::RetryConfig;

// ============================================================================
// Fakes
// ============================================================================

/// Two known titles; any query containing "Broken" hits an outage
#[derive(Default)]
struct FakeCatalog {
    searches: AtomicU32,
    outages: AtomicU32,
}

#[async_trait]
impl MetadataCatalog for FakeCatalog {
    fn name(&self) -> &str {
        "fake"
    }

    async fn search(&self, query: &CatalogQuery) -> Result<Vec<CatalogCandidate>, CatalogError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if query.title.contains("Broken") {
            self.outages.fetch_add(1, Ordering::SeqCst);
            return Err(CatalogError::Unavailable("503 Service Unavailable".into()));
        }

        let candidates = match query.media_type {
            MediaType::Movie => vec![CatalogCandidate {
                id: "27205".into(),
                title: "Inception".into(),
                alternate_titles: Vec::new(),
                year: Some(2010),
                media_type: MediaType::Movie,
            }],
            MediaType::Series => vec![CatalogCandidate {
                id: "999".into(),
                title: "Show Name".into(),
                alternate_titles: Vec::new(),
                year: Some(2019),
                media_type: MediaType::Series,
            }],
        };
        Ok(candidates)
    }

    async fn has_episode(
        &self,
        series_id: &str,
        season: u32,
        episode: u32,
    ) -> Result<bool, CatalogError> {
        Ok(series_id == "999" && season == 1 && (1..=10).contains(&episode))
    }
}

/// Height from the resolution tag in the file name
struct NameProbe;

#[async_trait]
impl MediaProbe for NameProbe {
    async fn probe(&self, path: &Path) -> Result<QualityRecord, ProbeError> {
        let name = path.to_string_lossy();
        let height = if name.contains("2160p") {
            2160
        } else if name.contains("1080p") {
            1080
        } else if name.contains("720p") {
            720
        } else {
            480
        };
        Ok(QualityRecord {
            width: None,
            height: Some(height),
            bitrate: Some(4_000_000),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct Fixture {
    _dir: TempDir,
    config: Arc<Config>,
    catalog: Arc<FakeCatalog>,
}

impl Fixture {
    fn new() -> Self {
        Self::with(|_| {})
    }

    fn with(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::with_roots(dir.path().join("watch"), dir.path().join("library"));
        config.min_primary_bytes = 0;
        config.failure_dir = Some(dir.path().join("failed"));
        config.stability_interval = Duration::from_millis(20);
        config.stability_samples = 2;
        config.stability_timeout = Duration::from_secs(5);
        adjust(&mut config);

        std::fs::create_dir_all(&config.source_dir).unwrap();
        Self {
            _dir: dir,
            config: Arc::new(config),
            catalog: Arc::new(FakeCatalog::default()),
        }
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.config.clone(), self.catalog.clone(), Arc::new(NameProbe)).with_retry(
            RetryConfig {
                max_retries: 3,
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(5),
                multiplier: 1.5,
            },
        )
    }

    fn source(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.config.source_dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn movies(&self) -> &Path {
        &self.config.movies_dir
    }

    fn tv(&self) -> &Path {
        &self.config.tv_dir
    }
}

fn names_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

// ============================================================================
// Movies
// ============================================================================

#[tokio::test]
async fn test_new_movie_is_placed() {
    let fx = Fixture::new();
    let item = fx.source("Inception.2010.1080p.BluRay.mkv", b"inception in 1080p");

    let outcome = fx.pipeline().process_now(&item, false).await;

    let report = assert_matches!(outcome, ItemOutcome::Placed { report, .. } => report);
    let expected = fx
        .movies()
        .join("Inception (2010) {tvdb-27205}")
        .join("Inception (2010) - 1080p - BluRay.mkv");
    assert_eq!(report.placed, vec![expected.clone()]);
    assert_eq!(std::fs::read(&expected).unwrap(), b"inception in 1080p");
    assert!(item.exists(), "source kept when deletion is disabled");
}

#[tokio::test]
async fn test_lower_quality_copy_is_skipped_and_source_kept() {
    let fx = Fixture::with(|c| c.delete_source_files = true);
    let title_dir = fx.movies().join("Inception (2010) {tvdb-27205}");
    std::fs::create_dir_all(&title_dir).unwrap();
    let existing = title_dir.join("Inception (2010) - 1080p - BluRay.mkv");
    std::fs::write(&existing, b"the existing 1080p encode").unwrap();

    let item = fx.source("Inception.2010.720p.WEB-DL.mkv", b"a 720p copy");
    let outcome = fx.pipeline().process_now(&item, false).await;

    let (skipped, source_removed) = assert_matches!(
        outcome,
        ItemOutcome::Skipped { skipped, source_removed } => (skipped, source_removed)
    );
    assert_eq!(skipped.len(), 1);
    assert_matches!(
        &skipped[0].decision,
        PlacementDecision::SkipLowerQuality { better } if *better == existing
    );
    assert!(!source_removed);
    assert!(item.exists());
    assert_eq!(names_in(&title_dir), vec!["Inception (2010) - 1080p - BluRay.mkv"]);
}

#[tokio::test]
async fn test_higher_quality_replaces_existing_version() {
    let fx = Fixture::with(|c| c.delete_source_files = true);
    let title_dir = fx.movies().join("Inception (2010) {tvdb-27205}");
    std::fs::create_dir_all(&title_dir).unwrap();
    std::fs::write(title_dir.join("Inception (2010) - 720p.mkv"), b"old").unwrap();
    std::fs::write(title_dir.join("Inception (2010) - 720p.en.srt"), b"old subs").unwrap();

    let item = fx.source("Inception.2010.2160p.mkv", b"the 4k encode");
    let outcome = fx.pipeline().process_now(&item, false).await;

    let (report, source_removed) = assert_matches!(
        outcome,
        ItemOutcome::Placed { report, source_removed, .. } => (report, source_removed)
    );
    assert_eq!(report.superseded.len(), 2);
    assert!(source_removed);
    assert!(!item.exists());
    assert_eq!(names_in(&title_dir), vec!["Inception (2010) - 4K.mkv"]);
}

#[tokio::test]
async fn test_identical_file_is_a_duplicate() {
    let fx = Fixture::new();
    let title_dir = fx.movies().join("Inception (2010) {tvdb-27205}");
    std::fs::create_dir_all(&title_dir).unwrap();
    std::fs::write(title_dir.join("Inception (2010) - 1080p.mkv"), b"same bytes").unwrap();

    let item = fx.source("Inception.2010.1080p.mkv", b"same bytes");
    let outcome = fx.pipeline().process_now(&item, false).await;

    let skipped = assert_matches!(outcome, ItemOutcome::Skipped { skipped, .. } => skipped);
    assert_matches!(skipped[0].decision, PlacementDecision::DuplicateIgnore { .. });
}

#[tokio::test]
async fn test_multi_part_movie_places_every_part() {
    let fx = Fixture::new();
    fx.source("Inception.2010.1080p/Inception.2010.1080p.CD1.mkv", b"first half");
    fx.source("Inception.2010.1080p/Inception.2010.1080p.CD2.mkv", b"second half");
    let item = fx.config.source_dir.join("Inception.2010.1080p");

    let outcome = fx.pipeline().process_now(&item, false).await;

    let report = assert_matches!(outcome, ItemOutcome::Placed { report, .. } => report);
    assert_eq!(report.placed.len(), 2);
    assert_eq!(
        names_in(&fx.movies().join("Inception (2010) {tvdb-27205}")),
        vec!["Inception (2010) - 1080p (2).mkv", "Inception (2010) - 1080p.mkv"]
    );
}

#[tokio::test]
async fn test_dry_run_plans_without_writing() {
    let fx = Fixture::new();
    let item = fx.source("Inception.2010.1080p.BluRay.mkv", b"inception");

    let outcome = fx.pipeline().process_now(&item, true).await;

    let plan = assert_matches!(outcome, ItemOutcome::Planned(plan) => plan);
    assert_eq!(plan.files.len(), 1);
    assert!(plan.files[0].destination.starts_with(fx.movies()));
    assert!(!fx.movies().exists());
}

// ============================================================================
// Series
// ============================================================================

#[tokio::test]
async fn test_season_bundle_lands_in_one_season_folder() {
    let fx = Fixture::new();
    let bundle = "Show.Name.S01.1080p.WEB-DL";
    for episode in 1..=10 {
        fx.source(
            &format!("{}/Show.Name.S01E{:02}.1080p.WEB-DL.mkv", bundle, episode),
            format!("episode {}", episode).as_bytes(),
        );
    }
    fx.source(&format!("{}/Show.Name.S01.Deleted.Scene.1.mkv", bundle), b"ds1");
    fx.source(&format!("{}/Show.Name.S01.Deleted.Scene.2.mkv", bundle), b"ds2");
    fx.source(&format!("{}/Show.Name.S01E01.1080p.WEB-DL.en.srt", bundle), b"1");
    fx.source(&format!("{}/Show.Name.S01E02.1080p.WEB-DL.spa.forced.srt", bundle), b"2");
    fx.source(&format!("{}/Show.Name.S01E03.1080p.WEB-DL.sdh.srt", bundle), b"3");
    let item = fx.config.source_dir.join(bundle);

    let outcome = fx.pipeline().process_now(&item, false).await;

    let report = assert_matches!(outcome, ItemOutcome::Placed { report, .. } => report);
    assert_eq!(report.placed.len(), 15);

    let show_dir = fx.tv().join("Show Name (2019) {tvdb-999}");
    assert_eq!(names_in(&show_dir), vec!["Season 01"]);

    let season = show_dir.join("Season 01");
    let names = names_in(&season);
    assert!(names.contains(&"Show Name (2019) - s01e01.mkv".to_string()));
    assert!(names.contains(&"Show Name (2019) - s01e10.mkv".to_string()));
    assert!(names.contains(&"Show Name (2019) - s01e01.en.srt".to_string()));
    assert!(names.contains(&"Show Name (2019) - s01e02.es.forced.srt".to_string()));
    assert!(names.contains(&"Show Name (2019) - s01e03.en.sdh.srt".to_string()));
    assert_eq!(names_in(&season.join("Deleted Scenes")).len(), 2);
}

#[tokio::test]
async fn test_unknown_episode_fails_resolution() {
    let fx = Fixture::new();
    let item = fx.source("Show.Name.S03E01.1080p.mkv", b"not in the catalog");

    let outcome = fx.pipeline().process_now(&item, false).await;

    let record = assert_matches!(outcome, ItemOutcome::Failed(record) => record);
    assert_eq!(record.resolution_failure, Some(ResolutionFailure::NoEpisodeMatch));
    assert!(item.exists());
    assert!(!fx.tv().exists());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_catalog_outage_is_retried_then_recorded() {
    let fx = Fixture::new();
    let pipeline = fx.pipeline();
    let broken = fx.source("Broken.Movie.2001.1080p.mkv", b"broken");

    let outcome = pipeline.process_now(&broken, false).await;

    let record = assert_matches!(outcome, ItemOutcome::Failed(record) => record);
    assert_eq!(record.kind, "resolution_failure");
    assert_eq!(record.resolution_failure, Some(ResolutionFailure::CatalogUnavailable));
    assert_eq!(fx.catalog.outages.load(Ordering::SeqCst), 3);
    assert!(broken.exists());

    let failed_dir = fx.config.failure_dir.clone().unwrap();
    assert_eq!(names_in(&failed_dir).len(), 1);

    // The pipeline keeps going for the next item
    let item = fx.source("Inception.2010.1080p.mkv", b"inception");
    let outcome = pipeline.process_now(&item, false).await;
    assert_matches!(outcome, ItemOutcome::Placed { .. });
}

#[tokio::test]
async fn test_non_video_item_is_unclassifiable() {
    let fx = Fixture::new();
    let item = fx.source("notes/readme.txt", b"hello");
    let item = item.parent().unwrap().to_path_buf();

    let outcome = fx.pipeline().process_now(&item, false).await;

    let record = assert_matches!(outcome, ItemOutcome::Failed(record) => record);
    assert_eq!(record.kind, "unclassifiable_bundle");
    assert_eq!(fx.catalog.searches.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Worker
// ============================================================================

#[tokio::test]
async fn test_worker_processes_queued_item_after_it_settles() {
    let fx = Fixture::new();
    let pipeline = Arc::new(fx.pipeline());
    let queue = WorkQueue::new();
    let cancel = CancellationToken::new();

    let worker = tokio::spawn(run_worker(0, pipeline, queue.clone(), cancel.clone()));

    let item = fx.source("Inception.2010.1080p.mkv", b"inception");
    queue.enqueue(item.clone());

    let expected = fx
        .movies()
        .join("Inception (2010) {tvdb-27205}")
        .join("Inception (2010) - 1080p.mkv");
    let placed = tokio::time::timeout(Duration::from_secs(10), async {
        while !expected.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(placed.is_ok(), "item was not placed in time");

    cancel.cancel();
    queue.close();
    worker.await.unwrap();
}
