//! Pipeline services

pub mod arbiter;
pub mod classifier;
pub mod failure_sink;
pub mod ffmpeg;
pub mod file_utils;
pub mod filename_parser;
pub mod logging;
pub mod metadata;
pub mod naming;
pub mod pipeline;
pub mod placement;
pub mod queues;
pub mod rate_limiter;
pub mod resolver;
pub mod stability;
pub mod text_utils;
pub mod tvdb;
pub mod watcher;

pub use arbiter::{PlacementDecision, QualityArbiter};
pub use classifier::{Bundle, BundleClassifier, ExtraKind, ItemKind};
pub use failure_sink::{FailureRecord, FailureSink};
pub use ffmpeg::{FfmpegService, MediaProbe, QualityRecord};
pub use metadata::{CatalogCandidate, CatalogQuery, MediaIdentity, MediaType, MetadataCatalog};
pub use naming::{MediaTarget, PathFormatter, PlexPathFormatter};
pub use pipeline::{ItemOutcome, Pipeline, describe_decision, run_worker};
pub use placement::{PlacementPlan, PlacementReport};
pub use queues::{IdentityLocks, WorkQueue};
pub use rate_limiter::{RateLimitedClient, RetryConfig};
pub use resolver::{MetadataResolver, ScoredCandidate, TieBreak};
pub use stability::{StabilityDetector, StabilityOutcome};
pub use tvdb::TvdbClient;
pub use watcher::{CollectorSettings, EventCollector};
