use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use kchart_adapters::genie::{parse_chart_page, GENIE};
use kchart_adapters::melon::{parse_album_search, parse_artist_search, parse_song_search, MELON};
use kchart_adapters::{
    AdapterError, AlbumCandidate, ArtistCandidate, EntityResolver, RawChartEntry, ReferenceCatalog, SearchPage,
    ServiceDescriptor, SongCandidate,
};
use kchart_core::{EntityKind, ServiceLocalId};
use kchart_storage::{CatalogRepository, MemoryCatalogRepository};

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture(relative: &str) -> String {
    std::fs::read_to_string(workspace_root().join("fixtures").join(relative)).expect("read fixture")
}

const ALBUM_SEARCH: &str = r#"{"melon":{"count":1,"page":1,"totalPages":1,"albums":{"album":[
    {"albumId":10902584,"albumName":"LOVE DIVE","artists":{"artist":[{"artistId":3055146,"artistName":"IVE (아이브)"}]}}
]}}}"#;

const ARTIST_SEARCH: &str = r#"{"melon":{"count":2,"page":1,"totalPages":1,"artists":{"artist":[
    {"artistId":3055146,"artistName":"IVE (아이브)"},
    {"artistId":700123,"artistName":"Ive Band"}
]}}}"#;

/// Serves recorded Melon search payloads regardless of the query.
struct RecordedMelon {
    searches: AtomicUsize,
}

#[async_trait]
impl ReferenceCatalog for RecordedMelon {
    fn descriptor(&self) -> &ServiceDescriptor {
        &MELON
    }

    async fn search_songs(&self, _query: &str, _page: u32) -> Result<SearchPage<SongCandidate>, AdapterError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        parse_song_search(fixture("melon/search_songs.json").as_bytes())
    }

    async fn search_albums(&self, _query: &str, _page: u32) -> Result<SearchPage<AlbumCandidate>, AdapterError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        parse_album_search(ALBUM_SEARCH.as_bytes())
    }

    async fn search_artists(&self, _query: &str, _page: u32) -> Result<SearchPage<ArtistCandidate>, AdapterError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        parse_artist_search(ARTIST_SEARCH.as_bytes())
    }

    async fn artist_debut_date(&self, _artist_id: ServiceLocalId) -> Result<Option<NaiveDate>, AdapterError> {
        Err(AdapterError::UpstreamFormat("artist pages are not recorded".into()))
    }
}

#[tokio::test]
async fn genie_chart_row_resolves_against_recorded_melon_search() {
    let rows = parse_chart_page(&fixture("genie/chart_page.html")).unwrap();
    let row = rows.into_iter().next().unwrap();
    let entry = RawChartEntry {
        position: row.position,
        song: row.song,
        album: row.album,
        artists: vec![row.artist],
        release_date: None,
    };

    let catalog = std::sync::Arc::new(RecordedMelon {
        searches: AtomicUsize::new(0),
    });
    let resolver = EntityResolver::new(catalog.clone());
    let repo = MemoryCatalogRepository::new();
    let genie = repo
        .get_or_create_service(&GENIE.new_service())
        .await
        .unwrap()
        .into_inner();

    let song = resolver.resolve(&repo, &genie, &entry).await.unwrap();
    assert_eq!(song.name, "LOVE DIVE");
    assert_eq!(song.release_date, NaiveDate::from_ymd_opt(2022, 4, 5).unwrap());
    assert_eq!(catalog.searches.load(Ordering::SeqCst), 3);

    // Missing artist pages only cost the debut date.
    let artist = repo.artist(song.artist_ids[0]).await.unwrap().unwrap();
    assert_eq!(artist.name, "IVE (아이브)");
    assert_eq!(artist.debut_date, None);

    let melon = repo.service_by_slug("melon").await.unwrap().unwrap();
    assert_eq!(
        repo.get_local_id(EntityKind::Song, melon.id, song.id).await.unwrap(),
        Some(34847378)
    );
    assert_eq!(
        repo.get_mapping(EntityKind::Artist, genie.id, 81484418).await.unwrap(),
        Some(artist.id)
    );

    let again = resolver.resolve(&repo, &genie, &entry).await.unwrap();
    assert_eq!(again, song);
    assert_eq!(catalog.searches.load(Ordering::SeqCst), 3);
}
