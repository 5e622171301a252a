//! Chart service contracts, upstream parsers and cross-service entity resolution.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use kchart_core::{EntityKind, MusicService, NewChart, NewMusicService, ServiceLocalId, Song};
use kchart_storage::{CatalogRepository, FetchError, HttpFetcher, RepositoryError};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod genie;
pub mod matching;
pub mod melon;
pub mod resolver;

pub use genie::GenieService;
pub use matching::{compare_artist_sets, is_instrumental, ArtistSetMatch};
pub use melon::{MelonConfig, MelonService};
pub use resolver::{import_reference_song, EntityResolver};

pub const CRATE_NAME: &str = "kchart-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no {kind} search results for {query:?}")]
    NoSearchResults { kind: EntityKind, query: String },
    #[error("ambiguous reference match for song {song:?}")]
    AmbiguousMatch { song: String },
    #[error("no reference match for song {song:?}")]
    NoMatch { song: String },
    #[error("unexpected upstream format: {0}")]
    UpstreamFormat(String),
    #[error("unexpected number of chart entries: expected {expected}, got {actual}")]
    UnexpectedChartSize { expected: usize, actual: usize },
    #[error("{service} only serves the live chart; historical hours cannot be fetched")]
    HistoricalUnsupported { service: &'static str },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    /// Per-song resolution failures; these never abort a chart fetch.
    pub fn is_resolution_failure(&self) -> bool {
        matches!(
            self,
            AdapterError::NoSearchResults { .. } | AdapterError::AmbiguousMatch { .. } | AdapterError::NoMatch { .. }
        )
    }
}

/// How a deviation from the expected chart size is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizePolicy {
    Strict,
    Warn,
}

/// Static facts about one upstream music service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    pub name: &'static str,
    pub slug: &'static str,
    pub url: &'static str,
    pub artist_url: &'static str,
    pub album_url: &'static str,
    pub song_url: &'static str,
    pub chart_name: &'static str,
    pub chart_url: &'static str,
    pub default_weight: f64,
    pub expected_size: usize,
    pub size_policy: SizePolicy,
    pub supports_historical: bool,
}

impl ServiceDescriptor {
    pub fn new_service(&self) -> NewMusicService {
        NewMusicService {
            name: self.name.to_string(),
            slug: self.slug.to_string(),
            url: self.url.to_string(),
            artist_url: self.artist_url.to_string(),
            album_url: self.album_url.to_string(),
            song_url: self.song_url.to_string(),
        }
    }

    pub fn new_chart(&self) -> NewChart {
        NewChart {
            name: self.chart_name.to_string(),
            url: self.chart_url.to_string(),
            weight: self.default_weight,
        }
    }

    pub fn check_chart_size(&self, actual: usize) -> Result<(), AdapterError> {
        if actual == self.expected_size {
            return Ok(());
        }
        match self.size_policy {
            SizePolicy::Strict => Err(AdapterError::UnexpectedChartSize {
                expected: self.expected_size,
                actual,
            }),
            SizePolicy::Warn => {
                warn!(
                    service = self.slug,
                    expected = self.expected_size,
                    actual,
                    "unexpected number of chart entries"
                );
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawArtist {
    pub id: ServiceLocalId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAlbum {
    pub id: ServiceLocalId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSong {
    pub id: ServiceLocalId,
    pub name: String,
}

/// One row of an upstream chart, in the service's own ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChartEntry {
    pub position: u32,
    pub song: RawSong,
    pub album: RawAlbum,
    pub artists: Vec<RawArtist>,
    /// Only services that publish it inline (the reference service) fill this.
    pub release_date: Option<NaiveDate>,
}

/// Raw upstream payload kept for the artifact archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub extension: &'static str,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedChart {
    pub hour: DateTime<Utc>,
    pub entries: Vec<RawChartEntry>,
    pub pages: Vec<FetchedPage>,
}

/// One page of search results; `next_page` is `None` on the last page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage<T> {
    pub results: Vec<T>,
    pub next_page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongCandidate {
    pub id: ServiceLocalId,
    pub name: String,
    pub album_id: ServiceLocalId,
    pub album_name: String,
    pub issue_date: NaiveDate,
    pub artists: Vec<RawArtist>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumCandidate {
    pub id: ServiceLocalId,
    pub name: String,
    pub artists: Vec<RawArtist>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistCandidate {
    pub id: ServiceLocalId,
    pub name: String,
}

/// Capability every upstream chart service provides.
#[async_trait]
pub trait ChartService: Send + Sync {
    fn descriptor(&self) -> &ServiceDescriptor;

    /// Fetch the chart for `hour`, or the live chart when `hour` is `None`.
    async fn fetch_hourly(&self, hour: Option<DateTime<Utc>>) -> Result<FetchedChart, AdapterError>;

    /// Map one raw entry of this service's chart to its canonical song.
    async fn resolve(
        &self,
        repo: &dyn CatalogRepository,
        service: &MusicService,
        entry: &RawChartEntry,
    ) -> Result<Song, AdapterError>;
}

/// Search capability of the reference service, used as ground truth.
#[async_trait]
pub trait ReferenceCatalog: Send + Sync {
    fn descriptor(&self) -> &ServiceDescriptor;

    async fn search_songs(&self, query: &str, page: u32) -> Result<SearchPage<SongCandidate>, AdapterError>;
    async fn search_albums(&self, query: &str, page: u32) -> Result<SearchPage<AlbumCandidate>, AdapterError>;
    async fn search_artists(&self, query: &str, page: u32) -> Result<SearchPage<ArtistCandidate>, AdapterError>;

    /// Debut date from the artist's detail page, when it lists one.
    async fn artist_debut_date(&self, artist_id: ServiceLocalId) -> Result<Option<NaiveDate>, AdapterError>;
}

/// Services in processing order: the reference service first.
pub fn default_services(http: Arc<HttpFetcher>, melon: MelonConfig) -> Vec<Arc<dyn ChartService>> {
    let melon = Arc::new(MelonService::new(http.clone(), melon));
    let genie = GenieService::new(http, EntityResolver::new(melon.clone()));
    vec![melon as Arc<dyn ChartService>, Arc::new(genie)]
}

pub fn service_for_slug<'a>(services: &'a [Arc<dyn ChartService>], slug: &str) -> Option<&'a Arc<dyn ChartService>> {
    services.iter().find(|s| s.descriptor().slug == slug)
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::UpstreamFormat(format!("bad selector {selector}: {e}")))
}

pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

pub(crate) fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).next().and_then(element_text))
}

/// Parse the numeric argument of a `name(123)` javascript handler.
pub(crate) fn handler_argument(handler: &str, name: &str) -> Option<ServiceLocalId> {
    let rest = handler.trim().strip_prefix(name)?.strip_prefix('(')?;
    let end = rest.find(')')?;
    rest[..end].trim().trim_matches(|c| c == '\'' || c == '"').parse().ok()
}

/// Lowercased search keyword: the name followed by any artist names.
pub(crate) fn search_keyword(name: &str, artist_names: &[&str]) -> String {
    let mut keyword = name.trim().to_string();
    for artist in artist_names {
        keyword.push(' ');
        keyword.push_str(artist.trim());
    }
    keyword.to_lowercase()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    pub fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .and_then(|p| p.parent())
            .map(|p| p.to_path_buf())
            .expect("workspace root")
    }

    pub fn read_fixture(relative: &str) -> String {
        let path = workspace_root().join("fixtures").join(relative);
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }
}
