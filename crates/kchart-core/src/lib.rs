//! Canonical catalog and chart model for kchart.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod history;

pub use aggregate::{aggregate, WeightedChart};
pub use history::{presentable_prev_position, RealtimeDetails};

pub const CRATE_NAME: &str = "kchart-core";

/// Number of chart positions every tracked chart publishes.
pub const TRACKED_POSITIONS: u32 = 100;

/// Canonical entity id (artist, album or song).
pub type EntityId = i64;

/// Numeric id an upstream service uses for its own artists/albums/songs.
pub type ServiceLocalId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Artist,
    Album,
    Song,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Artist => "artist",
            EntityKind::Album => "album",
            EntityKind::Song => "song",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub id: EntityId,
    pub name: String,
    pub debut_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewArtist {
    pub name: String,
    pub debut_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub id: EntityId,
    pub name: String,
    pub release_date: NaiveDate,
    pub artist_ids: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAlbum {
    pub name: String,
    pub release_date: NaiveDate,
    pub artist_ids: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    pub id: EntityId,
    pub name: String,
    pub release_date: NaiveDate,
    pub album_id: EntityId,
    pub artist_ids: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSong {
    pub name: String,
    pub release_date: NaiveDate,
    pub album_id: EntityId,
    pub artist_ids: Vec<EntityId>,
}

/// A Korean digital music service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicService {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub url: String,
    pub artist_url: String,
    pub album_url: String,
    pub song_url: String,
}

impl MusicService {
    pub fn artist_url(&self, artist_id: ServiceLocalId) -> String {
        self.artist_url.replace("{artist_id}", &artist_id.to_string())
    }

    pub fn album_url(&self, album_id: ServiceLocalId) -> String {
        self.album_url.replace("{album_id}", &album_id.to_string())
    }

    pub fn song_url(&self, song_id: ServiceLocalId) -> String {
        self.song_url.replace("{song_id}", &song_id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMusicService {
    pub name: String,
    pub slug: String,
    pub url: String,
    pub artist_url: String,
    pub album_url: String,
    pub song_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub id: i64,
    pub service_id: i64,
    pub name: String,
    pub url: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChart {
    pub name: String,
    pub url: String,
    pub weight: f64,
}

impl Default for NewChart {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartEntry {
    pub song_id: EntityId,
    pub position: u32,
}

/// One service's ranked snapshot for a truncated hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlySongChart {
    pub id: i64,
    pub chart_id: i64,
    pub hour: DateTime<Utc>,
    pub entries: Vec<ChartEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub song_id: EntityId,
    pub position: u32,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateHourlySongChart {
    pub id: i64,
    pub hour: DateTime<Utc>,
    /// Ids of the `HourlySongChart` rows this aggregate was computed from.
    pub component_chart_ids: Vec<i64>,
    pub entries: Vec<AggregateEntry>,
}

/// Which chart family a position lookup refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChartScope {
    Aggregate,
    Chart(i64),
}

/// Result of a typed get-or-create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOrCreate<T> {
    pub value: T,
    pub created: bool,
}

impl<T> GetOrCreate<T> {
    pub fn existing(value: T) -> Self {
        Self {
            value,
            created: false,
        }
    }

    pub fn created(value: T) -> Self {
        Self {
            value,
            created: true,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Korea Standard Time (UTC+9, no daylight saving).
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("+09:00 is a valid offset")
}

/// Truncate a timestamp to the start of its clock hour.
pub fn strip_to_hour(time: DateTime<Utc>) -> DateTime<Utc> {
    time.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(time)
}

pub fn current_hour() -> DateTime<Utc> {
    strip_to_hour(Utc::now())
}

/// Parse a KST `YYYYMMDD` day plus `HH` hour into a UTC hour.
pub fn kst_hour(day: &str, hour: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let naive = NaiveDateTime::parse_from_str(&format!("{day}{hour}0000"), "%Y%m%d%H%M%S")?;
    Ok(kst_naive_to_utc(naive))
}

/// Parse a compact KST `YYYYMMDDHH` stamp into a UTC hour.
pub fn parse_kst_stamp(stamp: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let naive = NaiveDateTime::parse_from_str(&format!("{stamp}0000"), "%Y%m%d%H%M%S")?;
    Ok(kst_naive_to_utc(naive))
}

fn kst_naive_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    // A fixed offset has exactly one mapping for every local time.
    kst()
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// KST `YYYYMMDD` and `HH` components of a UTC hour, as upstream requests expect.
pub fn kst_day_and_hour(hour: DateTime<Utc>) -> (String, String) {
    let local = hour.with_timezone(&kst());
    (local.format("%Y%m%d").to_string(), local.format("%H").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_to_hour_drops_minutes_and_seconds() {
        let t = Utc.with_ymd_and_hms(2016, 6, 14, 13, 47, 12).single().unwrap();
        assert_eq!(
            strip_to_hour(t),
            Utc.with_ymd_and_hms(2016, 6, 14, 13, 0, 0).single().unwrap()
        );
    }

    #[test]
    fn kst_hour_converts_to_utc() {
        let hour = kst_hour("20160614", "23").unwrap();
        assert_eq!(hour, Utc.with_ymd_and_hms(2016, 6, 14, 14, 0, 0).single().unwrap());
        assert_eq!(parse_kst_stamp("2016061423").unwrap(), hour);
    }

    #[test]
    fn kst_day_and_hour_crosses_midnight() {
        let hour = Utc.with_ymd_and_hms(2016, 6, 14, 20, 0, 0).single().unwrap();
        assert_eq!(kst_day_and_hour(hour), ("20160615".to_string(), "05".to_string()));
    }

    #[test]
    fn service_urls_render_local_ids() {
        let service = MusicService {
            id: 1,
            name: "testservice".into(),
            slug: "test".into(),
            url: "http:///".into(),
            artist_url: "/artists/{artist_id}/".into(),
            album_url: "/albums/{album_id}/".into(),
            song_url: "/songs/{song_id}/".into(),
        };
        assert_eq!(service.artist_url(1), "/artists/1/");
        assert_eq!(service.album_url(1), "/albums/1/");
        assert_eq!(service.song_url(1), "/songs/1/");
    }
}
