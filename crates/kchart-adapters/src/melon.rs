//! Melon, the reference service: realtime chart, search API and artist pages.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use kchart_core::{kst_hour, MusicService, ServiceLocalId, Song};
use kchart_storage::{CatalogRepository, FetchRequest, HttpFetcher};
use scraper::{ElementRef, Html};
use serde::{Deserialize, Deserializer};
use tracing::{debug, info, warn};

use crate::{
    element_text, import_reference_song, selector, AdapterError, AlbumCandidate, ArtistCandidate,
    ChartService, FetchedChart, FetchedPage, RawAlbum, RawArtist, RawChartEntry, RawSong,
    ReferenceCatalog, SearchPage, ServiceDescriptor, SizePolicy, SongCandidate,
};

pub static MELON: ServiceDescriptor = ServiceDescriptor {
    name: "Melon",
    slug: "melon",
    url: "http://www.melon.com",
    artist_url: "http://www.melon.com/artist/detail.htm?artistId={artist_id}",
    album_url: "http://www.melon.com/album/detail.htm?albumId={album_id}",
    song_url: "http://www.melon.com/song/detail.htm?songId={song_id}",
    chart_name: "Melon realtime top 100",
    chart_url: "http://www.melon.com/chart/index.htm",
    default_weight: 0.5,
    expected_size: 100,
    size_policy: SizePolicy::Strict,
    supports_historical: false,
};

pub const DEFAULT_API_BASE: &str = "http://apis.skplanetx.com";
const SEARCH_PAGE_SIZE: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MelonConfig {
    pub api_base: String,
    pub app_key: Option<String>,
}

impl Default for MelonConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            app_key: None,
        }
    }
}

pub struct MelonService {
    http: Arc<HttpFetcher>,
    config: MelonConfig,
}

impl MelonService {
    pub fn new(http: Arc<HttpFetcher>, config: MelonConfig) -> Self {
        Self { http, config }
    }

    fn api_request(&self, path: &str) -> FetchRequest {
        let url = format!("{}/melon/{path}", self.config.api_base.trim_end_matches('/'));
        let request = FetchRequest::get(url)
            .header("Accept", "application/json")
            .query("version", 1);
        match &self.config.app_key {
            Some(key) => request.header("appKey", key),
            None => request,
        }
    }

    async fn search(&self, path: &str, query: &str, page: u32) -> Result<Vec<u8>, AdapterError> {
        let request = self
            .api_request(path)
            .query("page", page)
            .query("count", SEARCH_PAGE_SIZE)
            .query("searchKeyword", query.to_lowercase());
        let response = self.http.fetch(MELON.slug, &request).await?;
        debug!(path, query, page, "melon search");
        Ok(response.body)
    }
}

#[async_trait]
impl ChartService for MelonService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &MELON
    }

    async fn fetch_hourly(&self, hour: Option<DateTime<Utc>>) -> Result<FetchedChart, AdapterError> {
        if hour.is_some() {
            return Err(AdapterError::HistoricalUnsupported { service: MELON.name });
        }
        let request = self
            .api_request("charts/realtime")
            .query("page", 1)
            .query("count", MELON.expected_size);
        let response = self.http.fetch(MELON.slug, &request).await?;
        let parsed = parse_chart(&response.body)?;
        MELON.check_chart_size(parsed.count)?;
        info!(hour = %parsed.hour, entries = parsed.entries.len(), "fetched melon realtime chart");

        Ok(FetchedChart {
            hour: parsed.hour,
            entries: parsed.entries,
            pages: vec![FetchedPage {
                url: response.final_url,
                extension: "json",
                body: response.body,
            }],
        })
    }

    async fn resolve(
        &self,
        repo: &dyn CatalogRepository,
        service: &MusicService,
        entry: &RawChartEntry,
    ) -> Result<Song, AdapterError> {
        let issue_date = entry.release_date.ok_or_else(|| {
            AdapterError::UpstreamFormat(format!("melon song {} has no issue date", entry.song.id))
        })?;
        let candidate = SongCandidate {
            id: entry.song.id,
            name: entry.song.name.clone(),
            album_id: entry.album.id,
            album_name: entry.album.name.clone(),
            issue_date,
            artists: entry.artists.clone(),
        };
        import_reference_song(repo, self, service, &candidate).await
    }
}

#[async_trait]
impl ReferenceCatalog for MelonService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &MELON
    }

    async fn search_songs(&self, query: &str, page: u32) -> Result<SearchPage<SongCandidate>, AdapterError> {
        let body = self.search("songs", query, page).await?;
        parse_song_search(&body)
    }

    async fn search_albums(&self, query: &str, page: u32) -> Result<SearchPage<AlbumCandidate>, AdapterError> {
        let body = self.search("albums", query, page).await?;
        parse_album_search(&body)
    }

    async fn search_artists(&self, query: &str, page: u32) -> Result<SearchPage<ArtistCandidate>, AdapterError> {
        let body = self.search("artists", query, page).await?;
        parse_artist_search(&body)
    }

    async fn artist_debut_date(&self, artist_id: ServiceLocalId) -> Result<Option<NaiveDate>, AdapterError> {
        let url = MELON.artist_url.replace("{artist_id}", &artist_id.to_string());
        let response = self.http.fetch(MELON.slug, &FetchRequest::get(url)).await?;
        parse_debut_date(&response.text())
    }
}

fn from_str_or_number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    let text = match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    };
    text.trim().parse::<T>().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    melon: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartBody {
    #[serde(deserialize_with = "from_str_or_number")]
    count: usize,
    #[serde(deserialize_with = "from_str_or_number")]
    rank_day: u32,
    #[serde(deserialize_with = "from_str_or_number")]
    rank_hour: u32,
    #[serde(default)]
    songs: Option<SongList>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchBody {
    #[serde(deserialize_with = "from_str_or_number")]
    count: usize,
    #[serde(deserialize_with = "from_str_or_number")]
    page: u32,
    #[serde(deserialize_with = "from_str_or_number")]
    total_pages: u32,
    #[serde(default)]
    songs: Option<SongList>,
    #[serde(default)]
    albums: Option<AlbumList>,
    #[serde(default)]
    artists: Option<ArtistList>,
}

impl SearchBody {
    fn next_page(&self) -> Option<u32> {
        (self.total_pages > self.page).then_some(self.page + 1)
    }
}

#[derive(Debug, Default, Deserialize)]
struct SongList {
    #[serde(default)]
    song: Vec<SongRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct AlbumList {
    #[serde(default)]
    album: Vec<AlbumRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct ArtistList {
    #[serde(default)]
    artist: Vec<ArtistRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SongRecord {
    #[serde(deserialize_with = "from_str_or_number")]
    song_id: ServiceLocalId,
    song_name: String,
    #[serde(deserialize_with = "from_str_or_number")]
    album_id: ServiceLocalId,
    album_name: String,
    issue_date: String,
    #[serde(default, deserialize_with = "optional_rank")]
    current_rank: Option<u32>,
    #[serde(default)]
    artists: ArtistList,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlbumRecord {
    #[serde(deserialize_with = "from_str_or_number")]
    album_id: ServiceLocalId,
    album_name: String,
    #[serde(default)]
    artists: ArtistList,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtistRecord {
    #[serde(deserialize_with = "from_str_or_number")]
    artist_id: ServiceLocalId,
    artist_name: String,
}

fn optional_rank<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    from_str_or_number(deserializer).map(Some)
}

impl ArtistList {
    fn into_raw(self) -> Vec<RawArtist> {
        self.artist
            .into_iter()
            .map(|a| RawArtist {
                id: a.artist_id,
                name: a.artist_name.trim().to_string(),
            })
            .collect()
    }
}

impl SongRecord {
    fn issue_date(&self) -> Result<NaiveDate, AdapterError> {
        NaiveDate::parse_from_str(self.issue_date.trim(), "%Y%m%d").map_err(|e| {
            AdapterError::UpstreamFormat(format!("song {} issue date {:?}: {e}", self.song_id, self.issue_date))
        })
    }

    fn into_candidate(self) -> Result<SongCandidate, AdapterError> {
        let issue_date = self.issue_date()?;
        Ok(SongCandidate {
            id: self.song_id,
            name: self.song_name.trim().to_string(),
            album_id: self.album_id,
            album_name: self.album_name.trim().to_string(),
            issue_date,
            artists: self.artists.into_raw(),
        })
    }
}

fn decode<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, AdapterError> {
    serde_json::from_slice::<Envelope<T>>(body)
        .map(|envelope| envelope.melon)
        .map_err(|e| AdapterError::UpstreamFormat(format!("melon json: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChart {
    pub hour: DateTime<Utc>,
    /// Entry count reported by the API.
    pub count: usize,
    pub entries: Vec<RawChartEntry>,
}

/// Parse the realtime chart; its hour is `rankDay`/`rankHour` in KST.
pub fn parse_chart(body: &[u8]) -> Result<ParsedChart, AdapterError> {
    let chart: ChartBody = decode(body)?;
    let hour = kst_hour(&chart.rank_day.to_string(), &format!("{:02}", chart.rank_hour)).map_err(|e| {
        AdapterError::UpstreamFormat(format!("rank hour {} {}: {e}", chart.rank_day, chart.rank_hour))
    })?;

    let songs = chart.songs.unwrap_or_default().song;
    let mut entries = Vec::with_capacity(songs.len());
    for record in songs {
        let position = record.current_rank.ok_or_else(|| {
            AdapterError::UpstreamFormat(format!("song {} has no currentRank", record.song_id))
        })?;
        let release_date = record.issue_date()?;
        entries.push(RawChartEntry {
            position,
            song: RawSong {
                id: record.song_id,
                name: record.song_name.trim().to_string(),
            },
            album: RawAlbum {
                id: record.album_id,
                name: record.album_name.trim().to_string(),
            },
            artists: record.artists.into_raw(),
            release_date: Some(release_date),
        });
    }
    if entries.len() != chart.count {
        return Err(AdapterError::UpstreamFormat(format!(
            "chart reports {} entries but lists {}",
            chart.count,
            entries.len()
        )));
    }

    Ok(ParsedChart {
        hour,
        count: chart.count,
        entries,
    })
}

pub fn parse_song_search(body: &[u8]) -> Result<SearchPage<SongCandidate>, AdapterError> {
    let mut search: SearchBody = decode(body)?;
    if search.count == 0 {
        return Ok(SearchPage {
            results: Vec::new(),
            next_page: search.next_page(),
        });
    }
    // One malformed candidate must not hide the rest of the page.
    let results = search
        .songs
        .take()
        .unwrap_or_default()
        .song
        .into_iter()
        .filter_map(|record| match record.into_candidate() {
            Ok(candidate) => Some(candidate),
            Err(err) => {
                warn!(error = %err, "skipping unreadable song candidate");
                None
            }
        })
        .collect();
    Ok(SearchPage {
        results,
        next_page: search.next_page(),
    })
}

pub fn parse_album_search(body: &[u8]) -> Result<SearchPage<AlbumCandidate>, AdapterError> {
    let mut search: SearchBody = decode(body)?;
    let records = if search.count == 0 {
        Vec::new()
    } else {
        search.albums.take().unwrap_or_default().album
    };
    Ok(SearchPage {
        results: records
            .into_iter()
            .map(|a| AlbumCandidate {
                id: a.album_id,
                name: a.album_name.trim().to_string(),
                artists: a.artists.into_raw(),
            })
            .collect(),
        next_page: search.next_page(),
    })
}

pub fn parse_artist_search(body: &[u8]) -> Result<SearchPage<ArtistCandidate>, AdapterError> {
    let mut search: SearchBody = decode(body)?;
    let records = if search.count == 0 {
        Vec::new()
    } else {
        search.artists.take().unwrap_or_default().into_raw()
    };
    Ok(SearchPage {
        results: records
            .into_iter()
            .map(|a| ArtistCandidate { id: a.id, name: a.name })
            .collect(),
        next_page: search.next_page(),
    })
}

/// `YYYY[.MM[.DD]]`; missing month or day count as 1.
pub fn parse_partial_date(text: &str) -> Option<NaiveDate> {
    let mut parts = text.trim().split('.').map(str::trim).filter(|p| !p.is_empty());
    let year = parts.next()?.parse().ok()?;
    let month = parts.next().map(str::parse).transpose().ok()?.unwrap_or(1);
    let day = parts.next().map(str::parse).transpose().ok()?.unwrap_or(1);
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Debut date from a Melon artist detail page.
pub fn parse_debut_date(html: &str) -> Result<Option<NaiveDate>, AdapterError> {
    let document = Html::parse_document(html);
    let section_sel = selector(".section_atistinfo03")?;
    let mut sections = document.select(&section_sel);
    let (Some(section), None) = (sections.next(), sections.next()) else {
        return Err(AdapterError::UpstreamFormat(
            "melon artist page lacks a single info section".to_string(),
        ));
    };

    let list_sel = selector(".list_define")?;
    let Some(list) = section.select(&list_sel).next() else {
        return Ok(None);
    };
    let items = list.children().filter_map(ElementRef::wrap).collect::<Vec<_>>();
    let [term, definition, ..] = items.as_slice() else {
        return Ok(None);
    };
    if element_text(*term).as_deref() != Some("데뷔") || definition.value().name() != "dd" {
        return Ok(None);
    }

    let text = element_text(*definition).unwrap_or_default();
    let debut = if definition.value().classes().any(|c| c == "debut_song") {
        text.split('|').next().unwrap_or_default().to_string()
    } else {
        text
    };
    Ok(parse_partial_date(&debut))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::read_fixture;
    use chrono::TimeZone;

    #[test]
    fn realtime_chart_fixture_parses() {
        let body = read_fixture("melon/charts_realtime.json");
        let chart = parse_chart(body.as_bytes()).unwrap();
        assert_eq!(chart.hour, Utc.with_ymd_and_hms(2022, 4, 14, 4, 0, 0).single().unwrap());
        assert_eq!(chart.count, 3);
        assert_eq!(chart.entries.len(), 3);

        let first = &chart.entries[0];
        assert_eq!(first.position, 1);
        assert_eq!(first.song, RawSong { id: 34847378, name: "LOVE DIVE".into() });
        assert_eq!(first.album.id, 10902584);
        assert_eq!(first.artists, vec![RawArtist { id: 3055146, name: "IVE (아이브)".into() }]);
        assert_eq!(first.release_date, NaiveDate::from_ymd_opt(2022, 4, 5));

        let collab = &chart.entries[2];
        assert_eq!(collab.artists.len(), 2);

        // The fixture is a truncated chart, which the reference service never accepts.
        assert!(matches!(
            MELON.check_chart_size(chart.count),
            Err(AdapterError::UnexpectedChartSize { expected: 100, actual: 3 })
        ));
    }

    #[test]
    fn count_mismatch_is_a_format_error() {
        let body = br#"{"melon":{"count":2,"rankDay":"20220414","rankHour":"13","songs":{"song":[]}}}"#;
        assert!(matches!(parse_chart(body), Err(AdapterError::UpstreamFormat(_))));
    }

    #[test]
    fn song_search_fixture_parses_with_next_page() {
        let body = read_fixture("melon/search_songs.json");
        let page = parse_song_search(body.as_bytes()).unwrap();
        assert_eq!(page.next_page, Some(2));
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.results[1].name, "LOVE DIVE (Inst.)");
        assert_eq!(page.results[0].album_id, 10902584);
    }

    #[test]
    fn song_candidate_with_bad_issue_date_is_skipped() {
        let body = br#"{"melon":{"count":2,"page":1,"totalPages":1,"songs":{"song":[
            {"songId":1,"songName":"LOVE DIVE","albumId":10,"albumName":"LOVE DIVE","issueDate":"20220405",
             "artists":{"artist":[{"artistId":3055146,"artistName":"IVE"}]}},
            {"songId":2,"songName":"LOVE DIVE","albumId":11,"albumName":"LOVE DIVE","issueDate":"",
             "artists":{"artist":[{"artistId":3055146,"artistName":"IVE"}]}}
        ]}}}"#;
        let page = parse_song_search(body).unwrap();
        assert_eq!(page.results.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(page.results[0].issue_date, NaiveDate::from_ymd_opt(2022, 4, 5).unwrap());
    }

    #[test]
    fn empty_search_has_no_results() {
        let body = br#"{"melon":{"count":0,"page":1,"totalPages":0}}"#;
        let page = parse_artist_search(body).unwrap();
        assert!(page.results.is_empty());
        assert_eq!(page.next_page, None);
    }

    #[test]
    fn album_search_keeps_album_artists() {
        let body = br#"{"melon":{"count":1,"page":"1","totalPages":"1","albums":{"album":[
            {"albumId":10902584,"albumName":"LOVE DIVE","artists":{"artist":[{"artistId":3055146,"artistName":"IVE"}]}}
        ]}}}"#;
        let page = parse_album_search(body).unwrap();
        assert_eq!(page.next_page, None);
        assert_eq!(page.results[0].artists[0].id, 3055146);
    }

    #[test]
    fn debut_date_from_artist_page() {
        let html = read_fixture("melon/artist_detail.html");
        assert_eq!(parse_debut_date(&html).unwrap(), NaiveDate::from_ymd_opt(2021, 12, 1));
    }

    #[test]
    fn debut_song_definition_keeps_date_part() {
        let html = r#"<div class="section_atistinfo03"><dl class="list_define">
            <dt>데뷔</dt><dd class="debut_song">2016.08 | <a>Debut Song</a></dd></dl></div>"#;
        assert_eq!(parse_debut_date(html).unwrap(), NaiveDate::from_ymd_opt(2016, 8, 1));
    }

    #[test]
    fn partial_dates_default_to_first() {
        assert_eq!(parse_partial_date("2014"), NaiveDate::from_ymd_opt(2014, 1, 1));
        assert_eq!(parse_partial_date("2014.05.20"), NaiveDate::from_ymd_opt(2014, 5, 20));
        assert_eq!(parse_partial_date(""), None);
        assert_eq!(parse_partial_date("soon"), None);
    }
}
