//! Metadata catalog types and the catalog collaborator trait

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// Kind of catalog record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Series,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Movie => f.write_str("movie"),
            Self::Series => f.write_str("series"),
        }
    }
}

/// Search request sent to the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogQuery {
    pub title: String,
    pub year: Option<u32>,
    pub media_type: MediaType,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

/// A catalog record returned by a search, in catalog order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogCandidate {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternate_titles: Vec<String>,
    pub year: Option<u32>,
    pub media_type: MediaType,
}

/// The destination media unit a primary file resolves to.
///
/// Two source items with the same identity must never be placed
/// concurrently. Editions are separate identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MediaIdentity {
    pub catalog_id: String,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub edition: Option<String>,
}

impl fmt::Display for MediaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.catalog_id)?;
        if let (Some(season), Some(episode)) = (self.season, self.episode) {
            write!(f, " s{:02}e{:02}", season, episode)?;
        }
        if let Some(edition) = &self.edition {
            write!(f, " [{}]", edition)?;
        }
        Ok(())
    }
}

/// External metadata catalog
#[async_trait]
pub trait MetadataCatalog: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &str;

    /// Search for candidates of the query's media type, most relevant first
    async fn search(&self, query: &CatalogQuery) -> Result<Vec<CatalogCandidate>, CatalogError>;

    /// Whether a series has the given season/episode
    async fn has_episode(
        &self,
        series_id: &str,
        season: u32,
        episode: u32,
    ) -> Result<bool, CatalogError>;
}
