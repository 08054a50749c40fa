//! TheTVDB v4 API client
//!
//! Base URL: https://api4.thetvdb.com/v4
//!
//! Authentication is a bearer token obtained from `/login` with the API key
//! (and subscriber PIN for user-supported keys). Tokens last a month; a 401
//! triggers one re-login before the request is reported as unauthorized.
//!
//! The client makes single attempts. Retrying transient failures is left to
//! the caller so that the retry budget is applied once per lookup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Response;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::metadata::{CatalogCandidate, CatalogQuery, MediaType, MetadataCatalog};
use super::rate_limiter::{RateLimitedClient, ResponseExt};
use crate::error::CatalogError;

const DEFAULT_BASE_URL: &str = "https://api4.thetvdb.com/v4";
/// Upper bound on episode pages walked for one lookup
const MAX_EPISODE_PAGES: u32 = 20;

/// TheTVDB client with rate limiting
pub struct TvdbClient {
    client: Arc<RateLimitedClient>,
    base_url: String,
    api_key: Option<String>,
    pin: Option<String>,
    token: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct TvdbEnvelope<T> {
    data: Option<T>,
    #[serde(default)]
    links: Option<TvdbLinks>,
}

#[derive(Debug, Deserialize)]
struct TvdbLinks {
    next: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TvdbLoginData {
    token: String,
}

/// One hit from `/search`
#[derive(Debug, Clone, Deserialize)]
pub struct TvdbSearchResult {
    pub tvdb_id: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub year: Option<String>,
    #[serde(default)]
    pub translations: HashMap<String, String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TvdbEpisodesPage {
    #[serde(default)]
    episodes: Vec<TvdbEpisode>,
}

#[derive(Debug, Deserialize)]
struct TvdbEpisode {
    #[serde(rename = "seasonNumber")]
    season_number: Option<u32>,
    number: Option<u32>,
}

impl TvdbSearchResult {
    /// Convert to a catalog candidate.
    ///
    /// The English translation becomes the canonical title when present;
    /// the original name and aliases are kept as alternates for scoring.
    pub fn into_candidate(self) -> Option<CatalogCandidate> {
        let media_type = match self.kind.as_deref() {
            Some("series") => MediaType::Series,
            Some("movie") => MediaType::Movie,
            _ => return None,
        };

        let id = self.tvdb_id.or_else(|| {
            self.id.map(|id| {
                id.trim_start_matches("series-")
                    .trim_start_matches("movie-")
                    .to_string()
            })
        })?;

        let english = self.translations.get("eng").cloned();
        let name = self.name.filter(|n| !n.is_empty());
        let title = english.clone().or_else(|| name.clone())?;

        let mut alternate_titles: Vec<String> = Vec::new();
        for alt in name.into_iter().chain(self.aliases) {
            if alt != title && !alternate_titles.contains(&alt) {
                alternate_titles.push(alt);
            }
        }

        Some(CatalogCandidate {
            id,
            title,
            alternate_titles,
            year: self.year.as_deref().and_then(|y| y.trim().parse().ok()),
            media_type,
        })
    }
}

fn status_error(response: &Response) -> CatalogError {
    if response.is_rate_limited() {
        CatalogError::RateLimited
    } else if response.is_transient_error() {
        CatalogError::Unavailable(format!("status {}", response.status()))
    } else if response.status().as_u16() == 401 {
        CatalogError::Unauthorized
    } else if response.status().as_u16() == 404 {
        CatalogError::NotFound
    } else {
        CatalogError::Unavailable(format!("unexpected status {}", response.status()))
    }
}

fn transport_error(e: reqwest::Error) -> CatalogError {
    CatalogError::Unavailable(e.to_string())
}

impl TvdbClient {
    pub fn new(
        client: Arc<RateLimitedClient>,
        api_key: Option<String>,
        pin: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            pin,
            token: RwLock::new(None),
        }
    }

    /// Check if the client has an API key configured
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn login(&self) -> Result<String, CatalogError> {
        let Some(api_key) = self.api_key.as_deref().filter(|k| !k.is_empty()) else {
            warn!("TVDB_API_KEY not configured, catalog lookups are disabled");
            return Err(CatalogError::Unauthorized);
        };

        let mut body = HashMap::from([("apikey", api_key)]);
        if let Some(pin) = self.pin.as_deref() {
            body.insert("pin", pin);
        }

        let url = format!("{}/login", self.base_url);
        let response = self
            .client
            .post_json(&url, &body)
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(status_error(&response));
        }

        let envelope: TvdbEnvelope<TvdbLoginData> = response
            .json()
            .await
            .map_err(|e| CatalogError::Unavailable(format!("invalid login response: {}", e)))?;
        let token = envelope
            .data
            .map(|d| d.token)
            .ok_or_else(|| CatalogError::Unavailable("login response without token".into()))?;

        info!("Authenticated with TheTVDB");
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn bearer(&self) -> Result<String, CatalogError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.login().await
    }

    /// Authenticated GET, re-authenticating once on 401
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<TvdbEnvelope<T>, CatalogError> {
        let url = format!("{}{}", self.base_url, path);
        let mut relogged = false;

        loop {
            let token = self.bearer().await?;
            let auth = format!("Bearer {}", token);
            let response = self
                .client
                .get_with_headers_and_query(&url, &[("Authorization", auth.as_str())], query)
                .await
                .map_err(transport_error)?;

            if response.status().as_u16() == 401 && !relogged {
                debug!("TVDB token rejected, logging in again");
                *self.token.write().await = None;
                relogged = true;
                continue;
            }

            if !response.status().is_success() {
                return Err(status_error(&response));
            }

            return response
                .json::<TvdbEnvelope<T>>()
                .await
                .map_err(|e| CatalogError::Unavailable(format!("invalid response: {}", e)));
        }
    }
}

#[async_trait]
impl MetadataCatalog for TvdbClient {
    fn name(&self) -> &str {
        "tvdb"
    }

    async fn search(&self, query: &CatalogQuery) -> Result<Vec<CatalogCandidate>, CatalogError> {
        let mut params: Vec<(&str, String)> = vec![
            ("query", query.title.clone()),
            ("type", query.media_type.to_string()),
            ("limit", "10".to_string()),
        ];
        if let Some(year) = query.year {
            params.push(("year", year.to_string()));
        }

        info!(
            query = %query.title,
            year = ?query.year,
            media_type = %query.media_type,
            "Searching TVDB"
        );

        let envelope: TvdbEnvelope<Vec<TvdbSearchResult>> =
            self.get_json("/search", &params).await?;

        let candidates: Vec<CatalogCandidate> = envelope
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(TvdbSearchResult::into_candidate)
            .filter(|c| c.media_type == query.media_type)
            .collect();

        debug!(count = candidates.len(), "TVDB search returned results");
        Ok(candidates)
    }

    async fn has_episode(
        &self,
        series_id: &str,
        season: u32,
        episode: u32,
    ) -> Result<bool, CatalogError> {
        let path = format!("/series/{}/episodes/default", series_id);

        for page in 0..MAX_EPISODE_PAGES {
            let params = [("season", season.to_string()), ("page", page.to_string())];
            let envelope: TvdbEnvelope<TvdbEpisodesPage> = match self.get_json(&path, &params).await
            {
                Ok(envelope) => envelope,
                Err(CatalogError::NotFound) => return Ok(false),
                Err(e) => return Err(e),
            };

            let found = envelope.data.is_some_and(|page| {
                page.episodes
                    .iter()
                    .any(|e| e.season_number == Some(season) && e.number == Some(episode))
            });
            if found {
                return Ok(true);
            }

            let has_next = envelope
                .links
                .and_then(|l| l.next)
                .is_some_and(|next| !next.is_null());
            if !has_next {
                break;
            }
        }

        Ok(false)
    }
}
