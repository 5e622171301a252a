//! Catalog/chart repository contract and an in-memory implementation.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kchart_core::{
    AggregateEntry, AggregateHourlySongChart, Album, Artist, Chart, ChartEntry, ChartScope,
    EntityId, EntityKind, GetOrCreate, HourlySongChart, MusicService, NewAlbum, NewArtist,
    NewChart, NewMusicService, NewSong, ServiceLocalId, Song,
};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{kind} mapping already exists for service {service_id} (local id {local_id})")]
    Conflict {
        kind: EntityKind,
        service_id: i64,
        local_id: ServiceLocalId,
    },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl RepositoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepositoryError::Conflict { .. })
    }
}

pub type RepoResult<T> = Result<T, RepositoryError>;

/// Persistent store for canonical entities, service mappings and charts.
///
/// Multi-row writes (`insert_*`, `replace_*`) must be atomic. Mapping
/// uniqueness holds on both `(service, local id)` and `(service, canonical id)`;
/// violating either yields [`RepositoryError::Conflict`].
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn get_or_create_service(&self, new: &NewMusicService) -> RepoResult<GetOrCreate<MusicService>>;
    async fn service_by_slug(&self, slug: &str) -> RepoResult<Option<MusicService>>;
    async fn get_or_create_chart(&self, service_id: i64, new: &NewChart) -> RepoResult<GetOrCreate<Chart>>;
    async fn set_chart_weight(&self, chart_id: i64, weight: f64) -> RepoResult<()>;

    async fn get_mapping(
        &self,
        kind: EntityKind,
        service_id: i64,
        local_id: ServiceLocalId,
    ) -> RepoResult<Option<EntityId>>;
    async fn get_local_id(
        &self,
        kind: EntityKind,
        service_id: i64,
        canonical_id: EntityId,
    ) -> RepoResult<Option<ServiceLocalId>>;
    async fn create_mapping(
        &self,
        kind: EntityKind,
        service_id: i64,
        local_id: ServiceLocalId,
        canonical_id: EntityId,
    ) -> RepoResult<()>;

    /// Create a canonical artist together with its mapping for `service_id`.
    async fn insert_artist(&self, service_id: i64, local_id: ServiceLocalId, new: &NewArtist) -> RepoResult<Artist>;
    async fn insert_album(&self, service_id: i64, local_id: ServiceLocalId, new: &NewAlbum) -> RepoResult<Album>;
    async fn insert_song(&self, service_id: i64, local_id: ServiceLocalId, new: &NewSong) -> RepoResult<Song>;

    async fn artist(&self, id: EntityId) -> RepoResult<Option<Artist>>;
    async fn album(&self, id: EntityId) -> RepoResult<Option<Album>>;
    async fn song(&self, id: EntityId) -> RepoResult<Option<Song>>;

    /// Returns `true` when the pair was not recorded before.
    async fn record_unmatched(&self, service_id: i64, local_song_id: ServiceLocalId) -> RepoResult<bool>;
    async fn is_unmatched(&self, service_id: i64, local_song_id: ServiceLocalId) -> RepoResult<bool>;

    async fn hourly_chart(&self, chart_id: i64, hour: DateTime<Utc>) -> RepoResult<Option<HourlySongChart>>;
    async fn hourly_charts_at(&self, hour: DateTime<Utc>) -> RepoResult<Vec<(Chart, HourlySongChart)>>;
    /// Get-or-create the `(chart, hour)` row and replace all of its entries.
    async fn replace_hourly_chart(
        &self,
        chart_id: i64,
        hour: DateTime<Utc>,
        entries: &[ChartEntry],
    ) -> RepoResult<HourlySongChart>;

    async fn aggregate_chart(&self, hour: DateTime<Utc>) -> RepoResult<Option<AggregateHourlySongChart>>;
    /// Get-or-create the aggregate row for `hour`, replace its entries and reset
    /// its component set to exactly `component_chart_ids`.
    async fn replace_aggregate_chart(
        &self,
        hour: DateTime<Utc>,
        component_chart_ids: &[i64],
        entries: &[AggregateEntry],
    ) -> RepoResult<AggregateHourlySongChart>;

    async fn position_at(&self, scope: ChartScope, hour: DateTime<Utc>, song_id: EntityId) -> RepoResult<Option<u32>>;
    /// Every `(hour, position)` the song holds in `scope`, oldest first.
    async fn song_history(&self, scope: ChartScope, song_id: EntityId) -> RepoResult<Vec<(DateTime<Utc>, u32)>>;

    /// Create a mapping unless one already exists; `Ok(false)` when it did.
    async fn ensure_mapping(
        &self,
        kind: EntityKind,
        service_id: i64,
        local_id: ServiceLocalId,
        canonical_id: EntityId,
    ) -> RepoResult<bool> {
        match self.create_mapping(kind, service_id, local_id, canonical_id).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_conflict() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn get_or_create_artist(
        &self,
        service_id: i64,
        local_id: ServiceLocalId,
        new: NewArtist,
    ) -> RepoResult<GetOrCreate<Artist>> {
        if let Some(artist) = self.mapped_artist(service_id, local_id).await? {
            return Ok(GetOrCreate::existing(artist));
        }
        match self.insert_artist(service_id, local_id, &new).await {
            Ok(artist) => Ok(GetOrCreate::created(artist)),
            Err(err) if err.is_conflict() => self
                .mapped_artist(service_id, local_id)
                .await?
                .map(GetOrCreate::existing)
                .ok_or(err),
            Err(err) => Err(err),
        }
    }

    async fn get_or_create_album(
        &self,
        service_id: i64,
        local_id: ServiceLocalId,
        new: NewAlbum,
    ) -> RepoResult<GetOrCreate<Album>> {
        if let Some(album) = self.mapped_album(service_id, local_id).await? {
            return Ok(GetOrCreate::existing(album));
        }
        match self.insert_album(service_id, local_id, &new).await {
            Ok(album) => Ok(GetOrCreate::created(album)),
            Err(err) if err.is_conflict() => self
                .mapped_album(service_id, local_id)
                .await?
                .map(GetOrCreate::existing)
                .ok_or(err),
            Err(err) => Err(err),
        }
    }

    async fn get_or_create_song(
        &self,
        service_id: i64,
        local_id: ServiceLocalId,
        new: NewSong,
    ) -> RepoResult<GetOrCreate<Song>> {
        if let Some(song) = self.mapped_song(service_id, local_id).await? {
            return Ok(GetOrCreate::existing(song));
        }
        match self.insert_song(service_id, local_id, &new).await {
            Ok(song) => Ok(GetOrCreate::created(song)),
            Err(err) if err.is_conflict() => self
                .mapped_song(service_id, local_id)
                .await?
                .map(GetOrCreate::existing)
                .ok_or(err),
            Err(err) => Err(err),
        }
    }

    async fn mapped_artist(&self, service_id: i64, local_id: ServiceLocalId) -> RepoResult<Option<Artist>> {
        match self.get_mapping(EntityKind::Artist, service_id, local_id).await? {
            Some(id) => self.artist(id).await,
            None => Ok(None),
        }
    }

    async fn mapped_album(&self, service_id: i64, local_id: ServiceLocalId) -> RepoResult<Option<Album>> {
        match self.get_mapping(EntityKind::Album, service_id, local_id).await? {
            Some(id) => self.album(id).await,
            None => Ok(None),
        }
    }

    async fn mapped_song(&self, service_id: i64, local_id: ServiceLocalId) -> RepoResult<Option<Song>> {
        match self.get_mapping(EntityKind::Song, service_id, local_id).await? {
            Some(id) => self.song(id).await,
            None => Ok(None),
        }
    }
}

/// Validate the `(chart, song)` and `(chart, position)` uniqueness of a chart body.
pub fn check_entry_uniqueness<I>(entries: I) -> RepoResult<()>
where
    I: IntoIterator<Item = (EntityId, u32)>,
{
    let mut songs = HashSet::new();
    let mut positions = HashSet::new();
    for (song_id, position) in entries {
        if position == 0 {
            return Err(RepositoryError::Constraint(format!(
                "song {song_id} has non-positive position"
            )));
        }
        if !songs.insert(song_id) {
            return Err(RepositoryError::Constraint(format!("song {song_id} listed twice")));
        }
        if !positions.insert(position) {
            return Err(RepositoryError::Constraint(format!("position {position} listed twice")));
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    services: BTreeMap<i64, MusicService>,
    charts: BTreeMap<i64, Chart>,
    artists: BTreeMap<EntityId, Artist>,
    albums: BTreeMap<EntityId, Album>,
    songs: BTreeMap<EntityId, Song>,
    mappings: BTreeMap<(EntityKind, i64, ServiceLocalId), EntityId>,
    reverse_mappings: BTreeMap<(EntityKind, i64, EntityId), ServiceLocalId>,
    unmatched: BTreeSet<(i64, ServiceLocalId)>,
    hourly: BTreeMap<(i64, DateTime<Utc>), HourlySongChart>,
    aggregates: BTreeMap<DateTime<Utc>, AggregateHourlySongChart>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_mapping_free(
        &self,
        kind: EntityKind,
        service_id: i64,
        local_id: ServiceLocalId,
        canonical_id: Option<EntityId>,
    ) -> RepoResult<()> {
        let local_taken = self.mappings.contains_key(&(kind, service_id, local_id));
        let canonical_taken = canonical_id
            .map(|id| self.reverse_mappings.contains_key(&(kind, service_id, id)))
            .unwrap_or(false);
        if local_taken || canonical_taken {
            return Err(RepositoryError::Conflict {
                kind,
                service_id,
                local_id,
            });
        }
        Ok(())
    }

    fn put_mapping(&mut self, kind: EntityKind, service_id: i64, local_id: ServiceLocalId, canonical_id: EntityId) {
        self.mappings.insert((kind, service_id, local_id), canonical_id);
        self.reverse_mappings.insert((kind, service_id, canonical_id), local_id);
    }

    fn check_artists_exist(&self, artist_ids: &[EntityId]) -> RepoResult<()> {
        match artist_ids.iter().find(|id| !self.artists.contains_key(id)) {
            Some(&id) => Err(RepositoryError::NotFound { kind: "artist", id }),
            None => Ok(()),
        }
    }
}

/// Process-local repository; every operation runs under one lock, which makes
/// each call atomic.
#[derive(Debug, Default)]
pub struct MemoryCatalogRepository {
    state: Mutex<MemoryState>,
}

impl MemoryCatalogRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogRepository for MemoryCatalogRepository {
    async fn get_or_create_service(&self, new: &NewMusicService) -> RepoResult<GetOrCreate<MusicService>> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.services.values().find(|s| s.name == new.name) {
            return Ok(GetOrCreate::existing(existing.clone()));
        }
        let service = MusicService {
            id: state.allocate_id(),
            name: new.name.clone(),
            slug: new.slug.clone(),
            url: new.url.clone(),
            artist_url: new.artist_url.clone(),
            album_url: new.album_url.clone(),
            song_url: new.song_url.clone(),
        };
        state.services.insert(service.id, service.clone());
        Ok(GetOrCreate::created(service))
    }

    async fn service_by_slug(&self, slug: &str) -> RepoResult<Option<MusicService>> {
        let state = self.state.lock().await;
        Ok(state.services.values().find(|s| s.slug == slug).cloned())
    }

    async fn get_or_create_chart(&self, service_id: i64, new: &NewChart) -> RepoResult<GetOrCreate<Chart>> {
        let mut state = self.state.lock().await;
        if !state.services.contains_key(&service_id) {
            return Err(RepositoryError::NotFound {
                kind: "service",
                id: service_id,
            });
        }
        if let Some(existing) = state.charts.values().find(|c| c.service_id == service_id) {
            return Ok(GetOrCreate::existing(existing.clone()));
        }
        let chart = Chart {
            id: state.allocate_id(),
            service_id,
            name: new.name.clone(),
            url: new.url.clone(),
            weight: new.weight,
        };
        state.charts.insert(chart.id, chart.clone());
        Ok(GetOrCreate::created(chart))
    }

    async fn set_chart_weight(&self, chart_id: i64, weight: f64) -> RepoResult<()> {
        let mut state = self.state.lock().await;
        let chart = state.charts.get_mut(&chart_id).ok_or(RepositoryError::NotFound {
            kind: "chart",
            id: chart_id,
        })?;
        chart.weight = weight;
        Ok(())
    }

    async fn get_mapping(
        &self,
        kind: EntityKind,
        service_id: i64,
        local_id: ServiceLocalId,
    ) -> RepoResult<Option<EntityId>> {
        let state = self.state.lock().await;
        Ok(state.mappings.get(&(kind, service_id, local_id)).copied())
    }

    async fn get_local_id(
        &self,
        kind: EntityKind,
        service_id: i64,
        canonical_id: EntityId,
    ) -> RepoResult<Option<ServiceLocalId>> {
        let state = self.state.lock().await;
        Ok(state.reverse_mappings.get(&(kind, service_id, canonical_id)).copied())
    }

    async fn create_mapping(
        &self,
        kind: EntityKind,
        service_id: i64,
        local_id: ServiceLocalId,
        canonical_id: EntityId,
    ) -> RepoResult<()> {
        let mut state = self.state.lock().await;
        let exists = match kind {
            EntityKind::Artist => state.artists.contains_key(&canonical_id),
            EntityKind::Album => state.albums.contains_key(&canonical_id),
            EntityKind::Song => state.songs.contains_key(&canonical_id),
        };
        if !exists {
            return Err(RepositoryError::NotFound {
                kind: kind.as_str(),
                id: canonical_id,
            });
        }
        state.check_mapping_free(kind, service_id, local_id, Some(canonical_id))?;
        state.put_mapping(kind, service_id, local_id, canonical_id);
        Ok(())
    }

    async fn insert_artist(&self, service_id: i64, local_id: ServiceLocalId, new: &NewArtist) -> RepoResult<Artist> {
        let mut state = self.state.lock().await;
        state.check_mapping_free(EntityKind::Artist, service_id, local_id, None)?;
        let artist = Artist {
            id: state.allocate_id(),
            name: new.name.clone(),
            debut_date: new.debut_date,
        };
        state.artists.insert(artist.id, artist.clone());
        state.put_mapping(EntityKind::Artist, service_id, local_id, artist.id);
        Ok(artist)
    }

    async fn insert_album(&self, service_id: i64, local_id: ServiceLocalId, new: &NewAlbum) -> RepoResult<Album> {
        let mut state = self.state.lock().await;
        state.check_mapping_free(EntityKind::Album, service_id, local_id, None)?;
        state.check_artists_exist(&new.artist_ids)?;
        let album = Album {
            id: state.allocate_id(),
            name: new.name.clone(),
            release_date: new.release_date,
            artist_ids: new.artist_ids.clone(),
        };
        state.albums.insert(album.id, album.clone());
        state.put_mapping(EntityKind::Album, service_id, local_id, album.id);
        Ok(album)
    }

    async fn insert_song(&self, service_id: i64, local_id: ServiceLocalId, new: &NewSong) -> RepoResult<Song> {
        let mut state = self.state.lock().await;
        state.check_mapping_free(EntityKind::Song, service_id, local_id, None)?;
        state.check_artists_exist(&new.artist_ids)?;
        if !state.albums.contains_key(&new.album_id) {
            return Err(RepositoryError::NotFound {
                kind: "album",
                id: new.album_id,
            });
        }
        let song = Song {
            id: state.allocate_id(),
            name: new.name.clone(),
            release_date: new.release_date,
            album_id: new.album_id,
            artist_ids: new.artist_ids.clone(),
        };
        state.songs.insert(song.id, song.clone());
        state.put_mapping(EntityKind::Song, service_id, local_id, song.id);
        Ok(song)
    }

    async fn artist(&self, id: EntityId) -> RepoResult<Option<Artist>> {
        Ok(self.state.lock().await.artists.get(&id).cloned())
    }

    async fn album(&self, id: EntityId) -> RepoResult<Option<Album>> {
        Ok(self.state.lock().await.albums.get(&id).cloned())
    }

    async fn song(&self, id: EntityId) -> RepoResult<Option<Song>> {
        Ok(self.state.lock().await.songs.get(&id).cloned())
    }

    async fn record_unmatched(&self, service_id: i64, local_song_id: ServiceLocalId) -> RepoResult<bool> {
        Ok(self.state.lock().await.unmatched.insert((service_id, local_song_id)))
    }

    async fn is_unmatched(&self, service_id: i64, local_song_id: ServiceLocalId) -> RepoResult<bool> {
        Ok(self.state.lock().await.unmatched.contains(&(service_id, local_song_id)))
    }

    async fn hourly_chart(&self, chart_id: i64, hour: DateTime<Utc>) -> RepoResult<Option<HourlySongChart>> {
        Ok(self.state.lock().await.hourly.get(&(chart_id, hour)).cloned())
    }

    async fn hourly_charts_at(&self, hour: DateTime<Utc>) -> RepoResult<Vec<(Chart, HourlySongChart)>> {
        let state = self.state.lock().await;
        Ok(state
            .hourly
            .values()
            .filter(|h| h.hour == hour)
            .filter_map(|h| state.charts.get(&h.chart_id).map(|c| (c.clone(), h.clone())))
            .collect())
    }

    async fn replace_hourly_chart(
        &self,
        chart_id: i64,
        hour: DateTime<Utc>,
        entries: &[ChartEntry],
    ) -> RepoResult<HourlySongChart> {
        check_entry_uniqueness(entries.iter().map(|e| (e.song_id, e.position)))?;
        let mut state = self.state.lock().await;
        if !state.charts.contains_key(&chart_id) {
            return Err(RepositoryError::NotFound {
                kind: "chart",
                id: chart_id,
            });
        }
        if let Some(missing) = entries.iter().find(|e| !state.songs.contains_key(&e.song_id)) {
            return Err(RepositoryError::NotFound {
                kind: "song",
                id: missing.song_id,
            });
        }
        let id = match state.hourly.get(&(chart_id, hour)) {
            Some(existing) => existing.id,
            None => state.allocate_id(),
        };
        let mut sorted = entries.to_vec();
        sorted.sort_by_key(|e| e.position);
        let chart = HourlySongChart {
            id,
            chart_id,
            hour,
            entries: sorted,
        };
        state.hourly.insert((chart_id, hour), chart.clone());
        Ok(chart)
    }

    async fn aggregate_chart(&self, hour: DateTime<Utc>) -> RepoResult<Option<AggregateHourlySongChart>> {
        Ok(self.state.lock().await.aggregates.get(&hour).cloned())
    }

    async fn replace_aggregate_chart(
        &self,
        hour: DateTime<Utc>,
        component_chart_ids: &[i64],
        entries: &[AggregateEntry],
    ) -> RepoResult<AggregateHourlySongChart> {
        check_entry_uniqueness(entries.iter().map(|e| (e.song_id, e.position)))?;
        let mut state = self.state.lock().await;
        let known_components = state.hourly.values().map(|h| h.id).collect::<HashSet<_>>();
        if let Some(&missing) = component_chart_ids.iter().find(|id| !known_components.contains(id)) {
            return Err(RepositoryError::NotFound {
                kind: "hourly chart",
                id: missing,
            });
        }
        let id = match state.aggregates.get(&hour) {
            Some(existing) => existing.id,
            None => state.allocate_id(),
        };
        let mut sorted = entries.to_vec();
        sorted.sort_by_key(|e| e.position);
        let mut components = component_chart_ids.to_vec();
        components.sort_unstable();
        components.dedup();
        let chart = AggregateHourlySongChart {
            id,
            hour,
            component_chart_ids: components,
            entries: sorted,
        };
        state.aggregates.insert(hour, chart.clone());
        Ok(chart)
    }

    async fn position_at(&self, scope: ChartScope, hour: DateTime<Utc>, song_id: EntityId) -> RepoResult<Option<u32>> {
        let state = self.state.lock().await;
        Ok(match scope {
            ChartScope::Aggregate => state
                .aggregates
                .get(&hour)
                .and_then(|c| c.entries.iter().find(|e| e.song_id == song_id))
                .map(|e| e.position),
            ChartScope::Chart(chart_id) => state
                .hourly
                .get(&(chart_id, hour))
                .and_then(|c| c.entries.iter().find(|e| e.song_id == song_id))
                .map(|e| e.position),
        })
    }

    async fn song_history(&self, scope: ChartScope, song_id: EntityId) -> RepoResult<Vec<(DateTime<Utc>, u32)>> {
        let state = self.state.lock().await;
        let history = match scope {
            ChartScope::Aggregate => state
                .aggregates
                .values()
                .filter_map(|c| {
                    c.entries
                        .iter()
                        .find(|e| e.song_id == song_id)
                        .map(|e| (c.hour, e.position))
                })
                .collect(),
            ChartScope::Chart(chart_id) => state
                .hourly
                .values()
                .filter(|c| c.chart_id == chart_id)
                .filter_map(|c| {
                    c.entries
                        .iter()
                        .find(|e| e.song_id == song_id)
                        .map(|e| (c.hour, e.position))
                })
                .collect(),
        };
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn new_service(name: &str) -> NewMusicService {
        NewMusicService {
            name: name.to_string(),
            slug: name.to_ascii_lowercase(),
            url: String::new(),
            artist_url: "{artist_id}".into(),
            album_url: "{album_id}".into(),
            song_url: "{song_id}".into(),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 4, 5).unwrap()
    }

    async fn seeded_song(repo: &MemoryCatalogRepository, service_id: i64, local_id: i64) -> Song {
        let artist = repo
            .get_or_create_artist(service_id, local_id, NewArtist { name: format!("artist {local_id}"), debut_date: None })
            .await
            .unwrap()
            .value;
        let album = repo
            .get_or_create_album(
                service_id,
                local_id,
                NewAlbum { name: format!("album {local_id}"), release_date: date(), artist_ids: vec![artist.id] },
            )
            .await
            .unwrap()
            .value;
        repo.get_or_create_song(
            service_id,
            local_id,
            NewSong {
                name: format!("song {local_id}"),
                release_date: date(),
                album_id: album.id,
                artist_ids: vec![artist.id],
            },
        )
        .await
        .unwrap()
        .value
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_per_local_id() {
        let repo = MemoryCatalogRepository::new();
        let service = repo.get_or_create_service(&new_service("Melon")).await.unwrap();
        assert!(service.created);
        let again = repo.get_or_create_service(&new_service("Melon")).await.unwrap();
        assert!(!again.created);
        assert_eq!(service.value.id, again.value.id);

        let new = NewArtist { name: "IVE".into(), debut_date: None };
        let first = repo.get_or_create_artist(service.value.id, 10, new.clone()).await.unwrap();
        let second = repo.get_or_create_artist(service.value.id, 10, new).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.value, second.value);
    }

    #[tokio::test]
    async fn mapping_is_unique_on_both_local_and_canonical_side() {
        let repo = MemoryCatalogRepository::new();
        let melon = repo.get_or_create_service(&new_service("Melon")).await.unwrap().value;
        let genie = repo.get_or_create_service(&new_service("Genie")).await.unwrap().value;
        let song = seeded_song(&repo, melon.id, 1).await;

        repo.create_mapping(EntityKind::Song, genie.id, 77, song.id).await.unwrap();
        let same_local = repo.create_mapping(EntityKind::Song, genie.id, 77, song.id).await;
        assert!(same_local.unwrap_err().is_conflict());
        let same_canonical = repo.create_mapping(EntityKind::Song, genie.id, 78, song.id).await;
        assert!(same_canonical.unwrap_err().is_conflict());
        assert!(!repo.ensure_mapping(EntityKind::Song, genie.id, 77, song.id).await.unwrap());

        assert_eq!(repo.get_mapping(EntityKind::Song, genie.id, 77).await.unwrap(), Some(song.id));
        assert_eq!(repo.get_local_id(EntityKind::Song, genie.id, song.id).await.unwrap(), Some(77));
    }

    #[tokio::test]
    async fn album_requires_existing_artists() {
        let repo = MemoryCatalogRepository::new();
        let melon = repo.get_or_create_service(&new_service("Melon")).await.unwrap().value;
        let err = repo
            .insert_album(melon.id, 1, &NewAlbum { name: "x".into(), release_date: date(), artist_ids: vec![999] })
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound { kind: "artist", id: 999 }));
    }

    #[tokio::test]
    async fn hourly_chart_rejects_duplicate_positions() {
        let repo = MemoryCatalogRepository::new();
        let melon = repo.get_or_create_service(&new_service("Melon")).await.unwrap().value;
        let chart = repo.get_or_create_chart(melon.id, &NewChart::default()).await.unwrap().value;
        let a = seeded_song(&repo, melon.id, 1).await;
        let b = seeded_song(&repo, melon.id, 2).await;
        let hour = Utc.with_ymd_and_hms(2022, 4, 5, 3, 0, 0).single().unwrap();

        let err = repo
            .replace_hourly_chart(
                chart.id,
                hour,
                &[ChartEntry { song_id: a.id, position: 1 }, ChartEntry { song_id: b.id, position: 1 }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Constraint(_)));
        assert!(repo.hourly_chart(chart.id, hour).await.unwrap().is_none());

        let written = repo
            .replace_hourly_chart(
                chart.id,
                hour,
                &[ChartEntry { song_id: b.id, position: 2 }, ChartEntry { song_id: a.id, position: 1 }],
            )
            .await
            .unwrap();
        assert_eq!(written.entries[0].song_id, a.id);
        assert_eq!(repo.position_at(ChartScope::Chart(chart.id), hour, b.id).await.unwrap(), Some(2));
        assert_eq!(repo.song_history(ChartScope::Chart(chart.id), a.id).await.unwrap(), vec![(hour, 1)]);
    }

    #[tokio::test]
    async fn unmatched_songs_are_recorded_once() {
        let repo = MemoryCatalogRepository::new();
        assert!(repo.record_unmatched(1, 500).await.unwrap());
        assert!(!repo.record_unmatched(1, 500).await.unwrap());
        assert!(repo.is_unmatched(1, 500).await.unwrap());
        assert!(!repo.is_unmatched(2, 500).await.unwrap());
    }
}
