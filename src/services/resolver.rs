//! Metadata resolver
//!
//! Queries the catalog for a bundle, scores every candidate against the
//! parsed title with a pluggable [`TitleScorer`], and accepts the best one
//! only when it meets the confidence threshold. Series matches are then
//! checked for the parsed season/episode numbers.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::metadata::{CatalogCandidate, CatalogQuery, MetadataCatalog};
use super::rate_limiter::{RetryConfig, retry_async};
use super::text_utils::title_similarity;
use crate::config::Config;
use crate::error::{CatalogError, PipelineError, ResolutionFailure};

/// Similarity function between a parsed title and a catalog title, 0-100
pub trait TitleScorer: Send + Sync {
    fn score(&self, query: &str, candidate: &str) -> f64;
}

/// Default scorer: best of edit-distance ratio and token sort/set ratios
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenSetScorer;

impl TitleScorer for TokenSetScorer {
    fn score(&self, query: &str, candidate: &str) -> f64 {
        title_similarity(query, candidate)
    }
}

/// How equal scores are ordered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TieBreak {
    /// Prefer an exact year match, then catalog order
    #[default]
    YearThenCatalogOrder,
    /// Catalog order only
    CatalogOrder,
}

impl FromStr for TieBreak {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "year" => Ok(Self::YearThenCatalogOrder),
            "catalog" => Ok(Self::CatalogOrder),
            other => anyhow::bail!("Unknown TIE_BREAK '{}' (expected 'year' or 'catalog')", other),
        }
    }
}

/// A candidate with its similarity score for one resolution attempt
#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    pub candidate: CatalogCandidate,
    pub score: f64,
    /// The canonical or alternate title that produced the score
    pub matched_title: String,
}

/// Score a candidate on its canonical title and every alternate title
pub fn score_candidate(
    scorer: &dyn TitleScorer,
    title: &str,
    candidate: CatalogCandidate,
) -> ScoredCandidate {
    let mut best_title = candidate.title.clone();
    let mut best_score = scorer.score(title, &candidate.title);

    for alternate in &candidate.alternate_titles {
        let score = scorer.score(title, alternate);
        if score > best_score {
            best_score = score;
            best_title = alternate.clone();
        }
    }

    ScoredCandidate {
        candidate,
        score: best_score,
        matched_title: best_title,
    }
}

/// Pick the highest-scoring candidate and apply the threshold.
///
/// Candidates are expected in catalog order. Equal scores are ordered by
/// `tie_break`.
pub fn select(
    query: &CatalogQuery,
    candidates: Vec<CatalogCandidate>,
    scorer: &dyn TitleScorer,
    threshold: u8,
    tie_break: TieBreak,
) -> Result<ScoredCandidate, PipelineError> {
    if candidates.is_empty() {
        return Err(PipelineError::resolution(
            ResolutionFailure::NotFound,
            format!("catalog returned no {} candidates for '{}'", query.media_type, query.title),
            None,
        ));
    }

    let year_matches = |c: &ScoredCandidate| {
        tie_break == TieBreak::YearThenCatalogOrder
            && query.year.is_some()
            && c.candidate.year == query.year
    };

    let mut best: Option<ScoredCandidate> = None;
    for scored in candidates
        .into_iter()
        .map(|c| score_candidate(scorer, &query.title, c))
    {
        debug!(
            id = %scored.candidate.id,
            title = %scored.candidate.title,
            matched = %scored.matched_title,
            score = scored.score,
            "Scored candidate"
        );

        let replace = match &best {
            None => true,
            Some(current) => match scored.score.total_cmp(&current.score) {
                Ordering::Greater => true,
                // Earlier catalog entries win remaining ties
                Ordering::Equal => year_matches(&scored) && !year_matches(current),
                Ordering::Less => false,
            },
        };
        if replace {
            best = Some(scored);
        }
    }

    let Some(best) = best else {
        return Err(PipelineError::resolution(
            ResolutionFailure::NotFound,
            "no scorable candidates",
            None,
        ));
    };

    if best.score < f64::from(threshold) {
        return Err(PipelineError::resolution(
            ResolutionFailure::LowConfidence,
            format!(
                "best match '{}' scored {:.1}, below threshold {}",
                best.candidate.title, best.score, threshold
            ),
            Some(best),
        ));
    }

    Ok(best)
}

/// Catalog-backed resolver with bounded timeouts and retries
pub struct MetadataResolver {
    catalog: Arc<dyn MetadataCatalog>,
    scorer: Arc<dyn TitleScorer>,
    threshold: u8,
    tie_break: TieBreak,
    timeout: Duration,
    retry: RetryConfig,
}

impl MetadataResolver {
    pub fn new(catalog: Arc<dyn MetadataCatalog>, config: &Config) -> Self {
        Self {
            catalog,
            scorer: Arc::new(TokenSetScorer),
            threshold: config.confidence_threshold,
            tie_break: config.tie_break,
            timeout: config.catalog_timeout,
            retry: RetryConfig::with_attempts(config.retry_attempts),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn TitleScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Search the catalog and select a match for `query`
    pub async fn resolve(&self, query: &CatalogQuery) -> Result<ScoredCandidate, PipelineError> {
        let catalog = &self.catalog;
        let timeout = self.timeout;
        let (result, attempts) = retry_async(
            move || async move {
                tokio::time::timeout(timeout, catalog.search(query))
                    .await
                    .unwrap_or_else(|_| {
                        Err(CatalogError::Unavailable(format!(
                            "search timed out after {}s",
                            timeout.as_secs()
                        )))
                    })
            },
            &self.retry,
            "catalog search",
            CatalogError::is_transient,
        )
        .await;

        let candidates = result.map_err(|e| catalog_failure(e, attempts, None))?;
        let best = select(query, candidates, self.scorer.as_ref(), self.threshold, self.tie_break)?;

        info!(
            catalog = %self.catalog.name(),
            id = %best.candidate.id,
            title = %best.candidate.title,
            year = ?best.candidate.year,
            score = best.score,
            "Resolved match"
        );
        Ok(best)
    }

    /// Confirm the matched series has every parsed episode
    pub async fn validate_episodes(
        &self,
        series: &ScoredCandidate,
        episodes: &BTreeSet<(u32, u32)>,
    ) -> Result<(), PipelineError> {
        let catalog = &self.catalog;
        let timeout = self.timeout;
        let series_id = series.candidate.id.as_str();

        for &(season, episode) in episodes {
            let (result, attempts) = retry_async(
                move || async move {
                    tokio::time::timeout(timeout, catalog.has_episode(series_id, season, episode))
                        .await
                        .unwrap_or_else(|_| {
                            Err(CatalogError::Unavailable(format!(
                                "episode lookup timed out after {}s",
                                timeout.as_secs()
                            )))
                        })
                },
                &self.retry,
                "catalog episode lookup",
                CatalogError::is_transient,
            )
            .await;

            let found = match result {
                Ok(found) => found,
                Err(CatalogError::NotFound) => false,
                Err(e) => return Err(catalog_failure(e, attempts, Some(series.clone()))),
            };

            if !found {
                warn!(
                    series = %series.candidate.title,
                    season = season,
                    episode = episode,
                    "Episode not found in catalog"
                );
                return Err(PipelineError::resolution(
                    ResolutionFailure::NoEpisodeMatch,
                    format!(
                        "'{}' has no season {} episode {}",
                        series.candidate.title, season, episode
                    ),
                    Some(series.clone()),
                ));
            }
        }

        Ok(())
    }
}

fn catalog_failure(error: CatalogError, attempts: u32, best: Option<ScoredCandidate>) -> PipelineError {
    let reason = match error {
        CatalogError::NotFound => ResolutionFailure::NotFound,
        _ => ResolutionFailure::CatalogUnavailable,
    };
    PipelineError::resolution(
        reason,
        format!("{} (after {} attempt(s))", error, attempts),
        best,
    )
}
