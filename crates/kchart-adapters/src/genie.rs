//! Genie, a secondary service scraped from its hourly chart pages.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kchart_core::{current_hour, kst_day_and_hour, strip_to_hour, MusicService, ServiceLocalId, Song};
use kchart_storage::{CatalogRepository, FetchRequest, HttpFetcher};
use scraper::{ElementRef, Html};
use tracing::{debug, info};

use crate::{
    element_text, handler_argument, select_first_text, selector, AdapterError, ChartService, EntityResolver,
    FetchedChart, FetchedPage, RawAlbum, RawArtist, RawChartEntry, RawSong, ServiceDescriptor, SizePolicy,
};

pub static GENIE: ServiceDescriptor = ServiceDescriptor {
    name: "Genie",
    slug: "genie",
    url: "http://www.genie.co.kr",
    artist_url: "http://www.genie.co.kr/detail/artistInfo?xxnm={artist_id}",
    album_url: "http://www.genie.co.kr/detail/albumInfo?axnm={album_id}",
    song_url: "http://www.genie.co.kr/detail/songInfo?xgnm={song_id}",
    chart_name: "Genie hourly top 100",
    chart_url: "http://www.genie.co.kr/chart/top100",
    default_weight: 0.25,
    expected_size: 100,
    size_policy: SizePolicy::Warn,
    supports_historical: true,
};

const CHART_PAGES: [u32; 2] = [1, 2];
const PROJECT_MARKER: &str = "프로젝트";

/// One chart row before collaboration artists are split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartRow {
    pub position: u32,
    pub song: RawSong,
    pub album: RawAlbum,
    pub artist: RawArtist,
}

pub struct GenieService {
    http: Arc<HttpFetcher>,
    resolver: EntityResolver,
}

impl GenieService {
    pub fn new(http: Arc<HttpFetcher>, resolver: EntityResolver) -> Self {
        Self { http, resolver }
    }

    /// Expand a `A & B` artist into its members when Genie lists it as a project.
    async fn split_artist(&self, artist: &RawArtist) -> Result<Vec<RawArtist>, AdapterError> {
        if !artist.name.contains('&') {
            return Ok(vec![artist.clone()]);
        }
        let url = GENIE.artist_url.replace("{artist_id}", &artist.id.to_string());
        let response = self.http.fetch(GENIE.slug, &FetchRequest::get(url)).await?;
        match parse_project_members(&response.text())? {
            Some(members) if !members.is_empty() => {
                debug!(artist = %artist.name, members = members.len(), "split project artist");
                Ok(members)
            }
            _ => Ok(vec![artist.clone()]),
        }
    }
}

#[async_trait]
impl ChartService for GenieService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &GENIE
    }

    async fn fetch_hourly(&self, hour: Option<DateTime<Utc>>) -> Result<FetchedChart, AdapterError> {
        let hour = hour.map(strip_to_hour).unwrap_or_else(current_hour);
        let (ymd, hh) = kst_day_and_hour(hour);

        let mut rows = Vec::new();
        let mut pages = Vec::new();
        for page in CHART_PAGES {
            let request = FetchRequest::get(GENIE.chart_url)
                .query("ditc", "D")
                .query("rtm", "Y")
                .query("ymd", &ymd)
                .query("hh", &hh)
                .query("pg", page);
            let response = self.http.fetch(GENIE.slug, &request).await?;
            rows.extend(parse_chart_page(&response.text())?);
            pages.push(FetchedPage {
                url: response.final_url,
                extension: "html",
                body: response.body,
            });
        }
        GENIE.check_chart_size(rows.len())?;

        let mut members: HashMap<ServiceLocalId, Vec<RawArtist>> = HashMap::new();
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let artists = match members.get(&row.artist.id) {
                Some(cached) => cached.clone(),
                None => {
                    let split = self.split_artist(&row.artist).await?;
                    members.insert(row.artist.id, split.clone());
                    split
                }
            };
            entries.push(RawChartEntry {
                position: row.position,
                song: row.song,
                album: row.album,
                artists,
                release_date: None,
            });
        }
        info!(%hour, entries = entries.len(), "fetched genie hourly chart");

        Ok(FetchedChart { hour, entries, pages })
    }

    async fn resolve(
        &self,
        repo: &dyn CatalogRepository,
        service: &MusicService,
        entry: &RawChartEntry,
    ) -> Result<Song, AdapterError> {
        self.resolver.resolve(repo, service, entry).await
    }
}

fn format_error(message: impl Into<String>) -> AdapterError {
    AdapterError::UpstreamFormat(format!("genie chart: {}", message.into()))
}

fn rank_from_classes(row: ElementRef<'_>) -> Option<u32> {
    row.value()
        .classes()
        .find_map(|class| class.strip_prefix("rank-").and_then(|n| n.parse().ok()))
}

fn linked_id(row: ElementRef<'_>, css: &str, handler: &str) -> Result<(ServiceLocalId, String), AdapterError> {
    let sel = selector(css)?;
    let link = row
        .select(&sel)
        .next()
        .ok_or_else(|| format_error(format!("row lacks {css}")))?;
    let id = link
        .value()
        .attr("onclick")
        .and_then(|onclick| handler_argument(onclick, handler))
        .ok_or_else(|| format_error(format!("{css} has no {handler} handler")))?;
    let name = element_text(link).ok_or_else(|| format_error(format!("{css} has no text")))?;
    Ok((id, name))
}

fn parse_row(row: ElementRef<'_>) -> Result<ChartRow, AdapterError> {
    let position = rank_from_classes(row).ok_or_else(|| format_error("row without rank class"))?;
    let song_id = row
        .value()
        .attr("songid")
        .and_then(|id| id.trim().parse().ok())
        .ok_or_else(|| format_error(format!("rank {position} without songid")))?;

    let title_sel = selector(".music-info .music a.title")?;
    let song_name = row
        .select(&title_sel)
        .next()
        .and_then(element_text)
        .ok_or_else(|| format_error(format!("rank {position} without title")))?;
    let (artist_id, artist_name) = linked_id(row, ".music-info .music .meta a.artist", "fnViewArtist")?;
    let (album_id, album_name) = linked_id(row, ".music-info .music .meta a.albumtitle", "fnViewAlbumLayer")?;

    Ok(ChartRow {
        position,
        song: RawSong {
            id: song_id,
            name: song_name,
        },
        album: RawAlbum {
            id: album_id,
            name: album_name,
        },
        artist: RawArtist {
            id: artist_id,
            name: artist_name,
        },
    })
}

/// Rows of one hourly chart page; the page must contain exactly one `.list-wrap`.
pub fn parse_chart_page(html: &str) -> Result<Vec<ChartRow>, AdapterError> {
    let document = Html::parse_document(html);
    let list_sel = selector(".list-wrap")?;
    let mut lists = document.select(&list_sel);
    let (Some(list), None) = (lists.next(), lists.next()) else {
        return Err(format_error("expected exactly one .list-wrap"));
    };

    // Rows may sit directly under the list or inside a tbody.
    let row_sel = selector("[songid]")?;
    list.select(&row_sel).map(parse_row).collect()
}

/// Member artists of a project artist page, or `None` when the page is not a project.
pub fn parse_project_members(html: &str) -> Result<Option<Vec<RawArtist>>, AdapterError> {
    let document = Html::parse_document(html);
    let artist_type = select_first_text(&document, ".artist-main-infos .info-zone ul.info-data li")?;
    if !artist_type.is_some_and(|t| t.contains(PROJECT_MARKER)) {
        return Ok(None);
    }

    let member_sel = selector(".artist-member-list ul li")?;
    let link_sel = selector("a")?;
    let mut members = Vec::new();
    for li in document.select(&member_sel) {
        let Some(name) = element_text(li) else {
            continue;
        };
        let id = li
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("onclick"))
            .and_then(|onclick| handler_argument(onclick, "fnViewArtist"))
            .ok_or_else(|| AdapterError::UpstreamFormat(format!("member {name} without artist id")))?;
        members.push(RawArtist { id, name });
    }
    Ok(Some(members))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::read_fixture;

    #[test]
    fn chart_page_fixture_parses_rows() {
        let html = read_fixture("genie/chart_page.html");
        let rows = parse_chart_page(&html).unwrap();
        assert_eq!(rows.len(), 3);

        assert_eq!(
            rows[0],
            ChartRow {
                position: 1,
                song: RawSong { id: 97590412, name: "LOVE DIVE".into() },
                album: RawAlbum { id: 82648213, name: "LOVE DIVE".into() },
                artist: RawArtist { id: 81484418, name: "IVE (아이브)".into() },
            }
        );
        assert_eq!(rows[2].position, 3);
        assert_eq!(rows[2].artist.name, "멜로망스 & Guest");
    }

    #[test]
    fn chart_page_requires_single_list() {
        let err = parse_chart_page("<html><body><p>maintenance</p></body></html>").unwrap_err();
        assert!(matches!(err, AdapterError::UpstreamFormat(_)));

        let twice = r#"<div class="list-wrap"></div><div class="list-wrap"></div>"#;
        assert!(parse_chart_page(twice).is_err());
    }

    #[test]
    fn row_without_rank_is_rejected() {
        let html = r#"<table class="list-wrap"><tbody><tr class="list" songid="1"></tr></tbody></table>"#;
        assert!(matches!(parse_chart_page(html), Err(AdapterError::UpstreamFormat(_))));
    }

    #[test]
    fn project_page_lists_members() {
        let html = read_fixture("genie/artist_project.html");
        let members = parse_project_members(&html).unwrap().unwrap();
        assert_eq!(
            members,
            vec![
                RawArtist { id: 80180463, name: "멜로망스".into() },
                RawArtist { id: 80999001, name: "Guest".into() },
            ]
        );
    }

    #[test]
    fn non_project_page_is_not_split() {
        let html = r#"<div class="artist-main-infos"><div class="info-zone">
            <ul class="info-data"><li><span>그룹</span> | 남성</li></ul></div></div>"#;
        assert_eq!(parse_project_members(html).unwrap(), None);
    }
}
