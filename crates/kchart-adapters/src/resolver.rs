//! Cross-service entity resolution against the reference catalog.

use std::collections::HashSet;
use std::sync::Arc;

use kchart_core::{
    Artist, EntityId, EntityKind, MusicService, NewAlbum, NewArtist, NewSong, ServiceLocalId, Song,
};
use kchart_storage::CatalogRepository;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::matching::{compare_artist_sets, is_instrumental, ArtistSetMatch};
use crate::{
    search_keyword, AdapterError, AlbumCandidate, ArtistCandidate, RawArtist, RawChartEntry,
    ReferenceCatalog, SongCandidate,
};

/// What is known about one source artist on the reference service.
#[derive(Debug, Clone)]
enum ArtistLookup {
    Known(ServiceLocalId),
    Candidates(Vec<ArtistCandidate>),
}

impl ArtistLookup {
    fn id_set(&self) -> HashSet<ServiceLocalId> {
        match self {
            ArtistLookup::Known(id) => HashSet::from([*id]),
            ArtistLookup::Candidates(candidates) => candidates.iter().map(|c| c.id).collect(),
        }
    }
}

#[derive(Debug, Clone)]
enum AlbumLookup {
    Known(ServiceLocalId),
    Candidates(Vec<AlbumCandidate>),
}

/// A reference song chosen for a source entry, plus any artists that were
/// pinned to reference ids while choosing it.
#[derive(Debug)]
struct Matched<'a> {
    song: &'a SongCandidate,
    artists: Vec<(usize, ServiceLocalId)>,
}

/// Resolves songs from a secondary service to canonical songs, using the
/// reference service's catalog as ground truth.
pub struct EntityResolver {
    reference: Arc<dyn ReferenceCatalog>,
    reference_service: OnceCell<MusicService>,
}

impl EntityResolver {
    pub fn new(reference: Arc<dyn ReferenceCatalog>) -> Self {
        Self {
            reference,
            reference_service: OnceCell::new(),
        }
    }

    pub fn reference(&self) -> &Arc<dyn ReferenceCatalog> {
        &self.reference
    }

    async fn reference_service(&self, repo: &dyn CatalogRepository) -> Result<&MusicService, AdapterError> {
        self.reference_service
            .get_or_try_init(|| async {
                let service = repo
                    .get_or_create_service(&self.reference.descriptor().new_service())
                    .await?;
                Ok::<_, AdapterError>(service.into_inner())
            })
            .await
    }

    /// Map `entry` from `service` to a canonical song.
    ///
    /// Already-mapped songs return without any search. Otherwise nothing is
    /// written unless a single reference song is identified.
    pub async fn resolve(
        &self,
        repo: &dyn CatalogRepository,
        service: &MusicService,
        entry: &RawChartEntry,
    ) -> Result<Song, AdapterError> {
        if let Some(song) = repo.mapped_song(service.id, entry.song.id).await? {
            return Ok(song);
        }

        let reference = self.reference_service(repo).await?;
        let artist_names = entry.artists.iter().map(|a| a.name.as_str()).collect::<Vec<_>>();

        let song_query = search_keyword(&entry.song.name, &artist_names);
        let song_candidates = self.reference.search_songs(&song_query, 1).await?.results;
        if song_candidates.is_empty() {
            return Err(no_results(EntityKind::Song, song_query));
        }

        let mut artists = Vec::with_capacity(entry.artists.len());
        for artist in &entry.artists {
            let known = self
                .known_reference_id(repo, EntityKind::Artist, service, reference, artist.id)
                .await?;
            let lookup = match known {
                Some(id) => ArtistLookup::Known(id),
                None => {
                    let candidates = self.reference.search_artists(&artist.name.to_lowercase(), 1).await?.results;
                    if candidates.is_empty() {
                        return Err(no_results(EntityKind::Artist, artist.name.clone()));
                    }
                    ArtistLookup::Candidates(candidates)
                }
            };
            artists.push(lookup);
        }

        let known_album = self
            .known_reference_id(repo, EntityKind::Album, service, reference, entry.album.id)
            .await?;
        let album = match known_album {
            Some(id) => AlbumLookup::Known(id),
            None => {
                let album_query = search_keyword(&entry.album.name, &artist_names);
                let candidates = self.reference.search_albums(&album_query, 1).await?.results;
                if candidates.is_empty() {
                    return Err(no_results(EntityKind::Album, album_query));
                }
                AlbumLookup::Candidates(candidates)
            }
        };

        let Some(matched) = select_candidate(entry, &song_candidates, &artists, &album)? else {
            info!(song = %entry.song.name, song_id = entry.song.id, "no reference match");
            return Err(AdapterError::NoMatch {
                song: entry.song.name.clone(),
            });
        };
        info!(
            song = %entry.song.name,
            reference_song_id = matched.song.id,
            "matched song to reference catalog"
        );

        let song = import_reference_song(repo, self.reference.as_ref(), reference, matched.song).await?;
        self.link(repo, service, entry, &song, reference, &artists, &matched.artists)
            .await?;
        Ok(song)
    }

    /// Reference-service id of an entity the source service has already mapped.
    async fn known_reference_id(
        &self,
        repo: &dyn CatalogRepository,
        kind: EntityKind,
        service: &MusicService,
        reference: &MusicService,
        local_id: ServiceLocalId,
    ) -> Result<Option<ServiceLocalId>, AdapterError> {
        let Some(canonical) = repo.get_mapping(kind, service.id, local_id).await? else {
            return Ok(None);
        };
        Ok(repo.get_local_id(kind, reference.id, canonical).await?)
    }

    /// Record the source service's ids against the canonical entities.
    #[allow(clippy::too_many_arguments)]
    async fn link(
        &self,
        repo: &dyn CatalogRepository,
        service: &MusicService,
        entry: &RawChartEntry,
        song: &Song,
        reference: &MusicService,
        artists: &[ArtistLookup],
        pinned: &[(usize, ServiceLocalId)],
    ) -> Result<(), AdapterError> {
        ensure_link(repo, EntityKind::Song, service, entry.song.id, song.id).await?;
        ensure_link(repo, EntityKind::Album, service, entry.album.id, song.album_id).await?;

        for (idx, (raw, lookup)) in entry.artists.iter().zip(artists).enumerate() {
            let reference_id = match lookup {
                ArtistLookup::Known(id) => Some(*id),
                ArtistLookup::Candidates(_) => pinned.iter().find(|(i, _)| *i == idx).map(|(_, id)| *id),
            };
            let Some(reference_id) = reference_id else {
                continue;
            };
            let canonical = self
                .reference_artist(repo, reference, lookup, reference_id)
                .await?;
            ensure_link(repo, EntityKind::Artist, service, raw.id, canonical.id).await?;
        }
        Ok(())
    }

    async fn reference_artist(
        &self,
        repo: &dyn CatalogRepository,
        reference: &MusicService,
        lookup: &ArtistLookup,
        reference_id: ServiceLocalId,
    ) -> Result<Artist, AdapterError> {
        if let Some(artist) = repo.mapped_artist(reference.id, reference_id).await? {
            return Ok(artist);
        }
        let name = match lookup {
            ArtistLookup::Candidates(candidates) => candidates
                .iter()
                .find(|c| c.id == reference_id)
                .map(|c| c.name.clone()),
            ArtistLookup::Known(_) => None,
        }
        .ok_or_else(|| AdapterError::UpstreamFormat(format!("reference artist {reference_id} has no name")))?;
        let artist = RawArtist { id: reference_id, name };
        import_reference_artist(repo, self.reference.as_ref(), reference, &artist).await
    }
}

fn no_results(kind: EntityKind, query: String) -> AdapterError {
    info!(%kind, query = %query, "0 search results");
    AdapterError::NoSearchResults { kind, query }
}

/// Map `local_id` to `canonical_id`; on conflict the stored mapping is re-read
/// and kept. Returns what `local_id` maps to afterwards.
async fn ensure_link(
    repo: &dyn CatalogRepository,
    kind: EntityKind,
    service: &MusicService,
    local_id: ServiceLocalId,
    canonical_id: EntityId,
) -> Result<Option<EntityId>, AdapterError> {
    if repo.ensure_mapping(kind, service.id, local_id, canonical_id).await? {
        return Ok(Some(canonical_id));
    }
    let mapped = repo.get_mapping(kind, service.id, local_id).await?;
    if mapped == Some(canonical_id) {
        debug!(%kind, service = %service.slug, local_id, canonical_id, "mapping already present");
    } else {
        let held_by = repo.get_local_id(kind, service.id, canonical_id).await?;
        warn!(
            %kind,
            service = %service.slug,
            local_id,
            canonical_id,
            mapped_to = ?mapped,
            held_by = ?held_by,
            "conflicting mapping kept"
        );
    }
    Ok(mapped)
}

/// Pick the first song candidate that survives the instrumental filter and the
/// album/artist checks. An ambiguous artist comparison does not stop the scan,
/// but if nothing else matches the failure is reported as ambiguous.
fn select_candidate<'a>(
    entry: &RawChartEntry,
    song_candidates: &'a [SongCandidate],
    artists: &[ArtistLookup],
    album: &AlbumLookup,
) -> Result<Option<Matched<'a>>, AdapterError> {
    let instrumental = is_instrumental(&entry.song.name);
    let artist_sets = artists.iter().map(ArtistLookup::id_set).collect::<Vec<_>>();
    let mut saw_ambiguous = false;

    for candidate in song_candidates {
        if is_instrumental(&candidate.name) != instrumental {
            continue;
        }
        match album {
            AlbumLookup::Known(album_id) => {
                if candidate.album_id == *album_id {
                    return Ok(Some(Matched {
                        song: candidate,
                        artists: Vec::new(),
                    }));
                }
            }
            AlbumLookup::Candidates(albums) => {
                for potential in albums.iter().filter(|a| a.id == candidate.album_id) {
                    let album_artists = potential.artists.iter().map(|a| a.id).collect::<HashSet<_>>();
                    match compare_artist_sets(&album_artists, &artist_sets) {
                        ArtistSetMatch::Unique(pinned) => {
                            return Ok(Some(Matched {
                                song: candidate,
                                artists: pinned,
                            }));
                        }
                        ArtistSetMatch::Ambiguous => saw_ambiguous = true,
                        ArtistSetMatch::None => {}
                    }
                }
            }
        }
    }

    if saw_ambiguous {
        info!(song = %entry.song.name, "ambiguous reference candidates");
        return Err(AdapterError::AmbiguousMatch {
            song: entry.song.name.clone(),
        });
    }
    Ok(None)
}

async fn import_reference_artist(
    repo: &dyn CatalogRepository,
    catalog: &dyn ReferenceCatalog,
    reference: &MusicService,
    artist: &RawArtist,
) -> Result<Artist, AdapterError> {
    if let Some(existing) = repo.mapped_artist(reference.id, artist.id).await? {
        return Ok(existing);
    }
    let debut_date = match catalog.artist_debut_date(artist.id).await {
        Ok(date) => date,
        Err(err) => {
            warn!(artist_id = artist.id, error = %err, "artist detail unavailable; storing without debut date");
            None
        }
    };
    let new = NewArtist {
        name: artist.name.clone(),
        debut_date,
    };
    Ok(repo.get_or_create_artist(reference.id, artist.id, new).await?.into_inner())
}

/// Get-or-create the canonical artists, album and song behind a reference
/// service song, keyed by the reference service's own ids.
pub async fn import_reference_song(
    repo: &dyn CatalogRepository,
    catalog: &dyn ReferenceCatalog,
    reference: &MusicService,
    song: &SongCandidate,
) -> Result<Song, AdapterError> {
    if let Some(existing) = repo.mapped_song(reference.id, song.id).await? {
        return Ok(existing);
    }

    let mut artist_ids = Vec::with_capacity(song.artists.len());
    for artist in &song.artists {
        let canonical = import_reference_artist(repo, catalog, reference, artist).await?;
        if !artist_ids.contains(&canonical.id) {
            artist_ids.push(canonical.id);
        }
    }

    let album = repo
        .get_or_create_album(
            reference.id,
            song.album_id,
            NewAlbum {
                name: song.album_name.clone(),
                release_date: song.issue_date,
                artist_ids: artist_ids.clone(),
            },
        )
        .await?
        .into_inner();

    let created = repo
        .get_or_create_song(
            reference.id,
            song.id,
            NewSong {
                name: song.name.clone(),
                release_date: song.issue_date,
                album_id: album.id,
                artist_ids,
            },
        )
        .await?;
    if created.created {
        debug!(song = %song.name, reference_song_id = song.id, "created canonical song");
    }
    Ok(created.into_inner())
}
