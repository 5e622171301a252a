//! PostgreSQL implementation of [`CatalogRepository`].

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use kchart_core::{
    AggregateEntry, AggregateHourlySongChart, Album, Artist, Chart, ChartEntry, ChartScope, EntityId, EntityKind,
    GetOrCreate, HourlySongChart, MusicService, NewAlbum, NewArtist, NewChart, NewMusicService, NewSong,
    ServiceLocalId, Song,
};
use kchart_storage::repository::{check_entry_uniqueness, RepoResult};
use kchart_storage::{CatalogRepository, RepositoryError};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const SERVICE_COLUMNS: &str = "id, name, slug, url, artist_url, album_url, song_url";
const CHART_COLUMNS: &str = "id, service_id, name, url, weight";

#[derive(Debug, Clone)]
pub struct PgCatalogRepository {
    pool: PgPool,
}

impl PgCatalogRepository {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        MIGRATOR.run(&self.pool).await.context("running migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    async fn begin(&self) -> RepoResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(backend)
    }

    async fn load_song(&self, id: EntityId) -> RepoResult<Option<Song>> {
        let row = sqlx::query(
            "SELECT s.id, s.name, s.release_date, s.album_id,
                    COALESCE(array_agg(sa.artist_id ORDER BY sa.position)
                             FILTER (WHERE sa.artist_id IS NOT NULL), '{}') AS artist_ids
             FROM songs s
             LEFT JOIN song_artists sa ON sa.song_id = s.id
             WHERE s.id = $1
             GROUP BY s.id",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(|row| song_from_row(&row)).transpose()
    }

    async fn load_hourly_entries(&self, hourly_chart_id: i64) -> RepoResult<Vec<ChartEntry>> {
        let rows = sqlx::query(
            "SELECT song_id, position FROM hourly_song_chart_entries
             WHERE hourly_chart_id = $1 ORDER BY position",
        )
        .bind(hourly_chart_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter()
            .map(|row| {
                Ok(ChartEntry {
                    song_id: row.try_get("song_id").map_err(backend)?,
                    position: position_from_row(row)?,
                })
            })
            .collect()
    }

    async fn load_aggregate(&self, row: &PgRow) -> RepoResult<AggregateHourlySongChart> {
        let id: i64 = row.try_get("id").map_err(backend)?;
        let hour: DateTime<Utc> = row.try_get("hour").map_err(backend)?;

        let component_chart_ids = sqlx::query(
            "SELECT hourly_chart_id FROM aggregate_chart_components
             WHERE aggregate_chart_id = $1 ORDER BY hourly_chart_id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?
        .iter()
        .map(|r| r.try_get("hourly_chart_id").map_err(backend))
        .collect::<RepoResult<Vec<i64>>>()?;

        let entries = sqlx::query(
            "SELECT song_id, position, score FROM aggregate_hourly_song_chart_entries
             WHERE aggregate_chart_id = $1 ORDER BY position",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?
        .iter()
        .map(|r| {
            Ok(AggregateEntry {
                song_id: r.try_get("song_id").map_err(backend)?,
                position: position_from_row(r)?,
                score: r.try_get("score").map_err(backend)?,
            })
        })
        .collect::<RepoResult<Vec<_>>>()?;

        Ok(AggregateHourlySongChart {
            id,
            hour,
            component_chart_ids,
            entries,
        })
    }
}

/// Table and column names of the per-kind service mapping tables.
fn mapping_table(kind: EntityKind) -> (&'static str, &'static str, &'static str) {
    match kind {
        EntityKind::Artist => ("service_artists", "service_artist_id", "artist_id"),
        EntityKind::Album => ("service_albums", "service_album_id", "album_id"),
        EntityKind::Song => ("service_songs", "service_song_id", "song_id"),
    }
}

fn backend(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Backend(err.into())
}

/// Map a failed mapping insert: unique violations are races another writer won.
fn mapping_error(err: sqlx::Error, kind: EntityKind, service_id: i64, local_id: ServiceLocalId) -> RepositoryError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return RepositoryError::Conflict {
                kind,
                service_id,
                local_id,
            };
        }
    }
    write_error(err)
}

fn write_error(err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() || db.is_foreign_key_violation() {
            return RepositoryError::Constraint(db.message().to_string());
        }
    }
    backend(err)
}

fn position_from_row(row: &PgRow) -> RepoResult<u32> {
    stored_position(row.try_get("position").map_err(backend)?)
}

fn stored_position(position: i32) -> RepoResult<u32> {
    u32::try_from(position).map_err(|_| RepositoryError::Constraint(format!("negative position {position}")))
}

fn service_from_row(row: &PgRow) -> RepoResult<MusicService> {
    Ok(MusicService {
        id: row.try_get("id").map_err(backend)?,
        name: row.try_get("name").map_err(backend)?,
        slug: row.try_get("slug").map_err(backend)?,
        url: row.try_get("url").map_err(backend)?,
        artist_url: row.try_get("artist_url").map_err(backend)?,
        album_url: row.try_get("album_url").map_err(backend)?,
        song_url: row.try_get("song_url").map_err(backend)?,
    })
}

fn chart_from_row(row: &PgRow) -> RepoResult<Chart> {
    Ok(Chart {
        id: row.try_get("id").map_err(backend)?,
        service_id: row.try_get("service_id").map_err(backend)?,
        name: row.try_get("name").map_err(backend)?,
        url: row.try_get("url").map_err(backend)?,
        weight: row.try_get("weight").map_err(backend)?,
    })
}

fn song_from_row(row: &PgRow) -> RepoResult<Song> {
    Ok(Song {
        id: row.try_get("id").map_err(backend)?,
        name: row.try_get("name").map_err(backend)?,
        release_date: row.try_get("release_date").map_err(backend)?,
        album_id: row.try_get("album_id").map_err(backend)?,
        artist_ids: row.try_get("artist_ids").map_err(backend)?,
    })
}

async fn link_artists(
    tx: &mut Transaction<'static, Postgres>,
    table: &str,
    owner_column: &str,
    owner_id: EntityId,
    artist_ids: &[EntityId],
) -> RepoResult<()> {
    let positions = (0..artist_ids.len() as i32).collect::<Vec<_>>();
    sqlx::query(&format!(
        "INSERT INTO {table} ({owner_column}, artist_id, position)
         SELECT $1, artist_id, position FROM UNNEST($2::bigint[], $3::int[]) AS t (artist_id, position)"
    ))
    .bind(owner_id)
    .bind(artist_ids)
    .bind(&positions)
    .execute(&mut **tx)
    .await
    .map_err(write_error)?;
    Ok(())
}

async fn insert_mapping(
    tx: &mut Transaction<'static, Postgres>,
    kind: EntityKind,
    service_id: i64,
    local_id: ServiceLocalId,
    canonical_id: EntityId,
) -> RepoResult<()> {
    let (table, local_column, canonical_column) = mapping_table(kind);
    sqlx::query(&format!(
        "INSERT INTO {table} (service_id, {local_column}, {canonical_column}) VALUES ($1, $2, $3)"
    ))
    .bind(service_id)
    .bind(local_id)
    .bind(canonical_id)
    .execute(&mut **tx)
    .await
    .map_err(|err| mapping_error(err, kind, service_id, local_id))?;
    Ok(())
}

async fn commit(tx: Transaction<'static, Postgres>) -> RepoResult<()> {
    tx.commit().await.map_err(backend)
}

#[async_trait]
impl CatalogRepository for PgCatalogRepository {
    async fn get_or_create_service(&self, new: &NewMusicService) -> RepoResult<GetOrCreate<MusicService>> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO music_services (name, slug, url, artist_url, album_url, song_url)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (name) DO NOTHING
             RETURNING {SERVICE_COLUMNS}"
        ))
        .bind(&new.name)
        .bind(&new.slug)
        .bind(&new.url)
        .bind(&new.artist_url)
        .bind(&new.album_url)
        .bind(&new.song_url)
        .fetch_optional(&self.pool)
        .await
        .map_err(write_error)?;
        if let Some(row) = inserted {
            return Ok(GetOrCreate::created(service_from_row(&row)?));
        }

        let row = sqlx::query(&format!("SELECT {SERVICE_COLUMNS} FROM music_services WHERE name = $1"))
            .bind(&new.name)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(GetOrCreate::existing(service_from_row(&row)?))
    }

    async fn service_by_slug(&self, slug: &str) -> RepoResult<Option<MusicService>> {
        let row = sqlx::query(&format!("SELECT {SERVICE_COLUMNS} FROM music_services WHERE slug = $1"))
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| service_from_row(&row)).transpose()
    }

    async fn get_or_create_chart(&self, service_id: i64, new: &NewChart) -> RepoResult<GetOrCreate<Chart>> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO charts (service_id, name, url, weight) VALUES ($1, $2, $3, $4)
             ON CONFLICT (service_id) DO NOTHING
             RETURNING {CHART_COLUMNS}"
        ))
        .bind(service_id)
        .bind(&new.name)
        .bind(&new.url)
        .bind(new.weight)
        .fetch_optional(&self.pool)
        .await
        .map_err(write_error)?;
        if let Some(row) = inserted {
            return Ok(GetOrCreate::created(chart_from_row(&row)?));
        }

        let row = sqlx::query(&format!("SELECT {CHART_COLUMNS} FROM charts WHERE service_id = $1"))
            .bind(service_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(GetOrCreate::existing(chart_from_row(&row)?))
    }

    async fn set_chart_weight(&self, chart_id: i64, weight: f64) -> RepoResult<()> {
        let result = sqlx::query("UPDATE charts SET weight = $2 WHERE id = $1")
            .bind(chart_id)
            .bind(weight)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                kind: "chart",
                id: chart_id,
            });
        }
        Ok(())
    }

    async fn get_mapping(
        &self,
        kind: EntityKind,
        service_id: i64,
        local_id: ServiceLocalId,
    ) -> RepoResult<Option<EntityId>> {
        let (table, local_column, canonical_column) = mapping_table(kind);
        let row = sqlx::query(&format!(
            "SELECT {canonical_column} AS canonical_id FROM {table}
             WHERE service_id = $1 AND {local_column} = $2"
        ))
        .bind(service_id)
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(|r| r.try_get("canonical_id").map_err(backend)).transpose()
    }

    async fn get_local_id(
        &self,
        kind: EntityKind,
        service_id: i64,
        canonical_id: EntityId,
    ) -> RepoResult<Option<ServiceLocalId>> {
        let (table, local_column, canonical_column) = mapping_table(kind);
        let row = sqlx::query(&format!(
            "SELECT {local_column} AS local_id FROM {table}
             WHERE service_id = $1 AND {canonical_column} = $2"
        ))
        .bind(service_id)
        .bind(canonical_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(|r| r.try_get("local_id").map_err(backend)).transpose()
    }

    async fn create_mapping(
        &self,
        kind: EntityKind,
        service_id: i64,
        local_id: ServiceLocalId,
        canonical_id: EntityId,
    ) -> RepoResult<()> {
        let mut tx = self.begin().await?;
        insert_mapping(&mut tx, kind, service_id, local_id, canonical_id).await?;
        commit(tx).await
    }

    async fn insert_artist(&self, service_id: i64, local_id: ServiceLocalId, new: &NewArtist) -> RepoResult<Artist> {
        let mut tx = self.begin().await?;
        let id: i64 = sqlx::query("INSERT INTO artists (name, debut_date) VALUES ($1, $2) RETURNING id")
            .bind(&new.name)
            .bind(new.debut_date)
            .fetch_one(&mut *tx)
            .await
            .map_err(write_error)?
            .try_get("id")
            .map_err(backend)?;
        insert_mapping(&mut tx, EntityKind::Artist, service_id, local_id, id).await?;
        commit(tx).await?;
        Ok(Artist {
            id,
            name: new.name.clone(),
            debut_date: new.debut_date,
        })
    }

    async fn insert_album(&self, service_id: i64, local_id: ServiceLocalId, new: &NewAlbum) -> RepoResult<Album> {
        let mut tx = self.begin().await?;
        let id: i64 = sqlx::query("INSERT INTO albums (name, release_date) VALUES ($1, $2) RETURNING id")
            .bind(&new.name)
            .bind(new.release_date)
            .fetch_one(&mut *tx)
            .await
            .map_err(write_error)?
            .try_get("id")
            .map_err(backend)?;
        link_artists(&mut tx, "album_artists", "album_id", id, &new.artist_ids).await?;
        insert_mapping(&mut tx, EntityKind::Album, service_id, local_id, id).await?;
        commit(tx).await?;
        Ok(Album {
            id,
            name: new.name.clone(),
            release_date: new.release_date,
            artist_ids: new.artist_ids.clone(),
        })
    }

    async fn insert_song(&self, service_id: i64, local_id: ServiceLocalId, new: &NewSong) -> RepoResult<Song> {
        let mut tx = self.begin().await?;
        let id: i64 = sqlx::query("INSERT INTO songs (name, release_date, album_id) VALUES ($1, $2, $3) RETURNING id")
            .bind(&new.name)
            .bind(new.release_date)
            .bind(new.album_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(write_error)?
            .try_get("id")
            .map_err(backend)?;
        link_artists(&mut tx, "song_artists", "song_id", id, &new.artist_ids).await?;
        insert_mapping(&mut tx, EntityKind::Song, service_id, local_id, id).await?;
        commit(tx).await?;
        Ok(Song {
            id,
            name: new.name.clone(),
            release_date: new.release_date,
            album_id: new.album_id,
            artist_ids: new.artist_ids.clone(),
        })
    }

    async fn artist(&self, id: EntityId) -> RepoResult<Option<Artist>> {
        let row = sqlx::query("SELECT id, name, debut_date FROM artists WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| {
            Ok(Artist {
                id: row.try_get("id").map_err(backend)?,
                name: row.try_get("name").map_err(backend)?,
                debut_date: row.try_get::<Option<NaiveDate>, _>("debut_date").map_err(backend)?,
            })
        })
        .transpose()
    }

    async fn album(&self, id: EntityId) -> RepoResult<Option<Album>> {
        let row = sqlx::query(
            "SELECT a.id, a.name, a.release_date,
                    COALESCE(array_agg(aa.artist_id ORDER BY aa.position)
                             FILTER (WHERE aa.artist_id IS NOT NULL), '{}') AS artist_ids
             FROM albums a
             LEFT JOIN album_artists aa ON aa.album_id = a.id
             WHERE a.id = $1
             GROUP BY a.id",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(|row| {
            Ok(Album {
                id: row.try_get("id").map_err(backend)?,
                name: row.try_get("name").map_err(backend)?,
                release_date: row.try_get("release_date").map_err(backend)?,
                artist_ids: row.try_get("artist_ids").map_err(backend)?,
            })
        })
        .transpose()
    }

    async fn song(&self, id: EntityId) -> RepoResult<Option<Song>> {
        self.load_song(id).await
    }

    async fn record_unmatched(&self, service_id: i64, local_song_id: ServiceLocalId) -> RepoResult<bool> {
        let result = sqlx::query(
            "INSERT INTO unmatched_service_songs (service_id, service_song_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(service_id)
        .bind(local_song_id)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn is_unmatched(&self, service_id: i64, local_song_id: ServiceLocalId) -> RepoResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM unmatched_service_songs
                            WHERE service_id = $1 AND service_song_id = $2) AS unmatched",
        )
        .bind(service_id)
        .bind(local_song_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        row.try_get("unmatched").map_err(backend)
    }

    async fn hourly_chart(&self, chart_id: i64, hour: DateTime<Utc>) -> RepoResult<Option<HourlySongChart>> {
        let row = sqlx::query("SELECT id FROM hourly_song_charts WHERE chart_id = $1 AND hour = $2")
            .bind(chart_id)
            .bind(hour)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.try_get("id").map_err(backend)?;
        Ok(Some(HourlySongChart {
            id,
            chart_id,
            hour,
            entries: self.load_hourly_entries(id).await?,
        }))
    }

    async fn hourly_charts_at(&self, hour: DateTime<Utc>) -> RepoResult<Vec<(Chart, HourlySongChart)>> {
        let rows = sqlx::query(
            "SELECT h.id AS hourly_id, c.id, c.service_id, c.name, c.url, c.weight
             FROM hourly_song_charts h
             JOIN charts c ON c.id = h.chart_id
             WHERE h.hour = $1
             ORDER BY c.id",
        )
        .bind(hour)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut charts = Vec::with_capacity(rows.len());
        for row in &rows {
            let chart = chart_from_row(row)?;
            let hourly_id: i64 = row.try_get("hourly_id").map_err(backend)?;
            let hourly = HourlySongChart {
                id: hourly_id,
                chart_id: chart.id,
                hour,
                entries: self.load_hourly_entries(hourly_id).await?,
            };
            charts.push((chart, hourly));
        }
        Ok(charts)
    }

    async fn replace_hourly_chart(
        &self,
        chart_id: i64,
        hour: DateTime<Utc>,
        entries: &[ChartEntry],
    ) -> RepoResult<HourlySongChart> {
        check_entry_uniqueness(entries.iter().map(|e| (e.song_id, e.position)))?;
        let mut sorted = entries.to_vec();
        sorted.sort_by_key(|e| e.position);

        let mut tx = self.begin().await?;
        let id: i64 = sqlx::query(
            "INSERT INTO hourly_song_charts (chart_id, hour) VALUES ($1, $2)
             ON CONFLICT (chart_id, hour) DO UPDATE SET hour = EXCLUDED.hour
             RETURNING id",
        )
        .bind(chart_id)
        .bind(hour)
        .fetch_one(&mut *tx)
        .await
        .map_err(write_error)?
        .try_get("id")
        .map_err(backend)?;

        sqlx::query("DELETE FROM hourly_song_chart_entries WHERE hourly_chart_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        let song_ids = sorted.iter().map(|e| e.song_id).collect::<Vec<_>>();
        let positions = sorted.iter().map(|e| e.position as i32).collect::<Vec<_>>();
        sqlx::query(
            "INSERT INTO hourly_song_chart_entries (hourly_chart_id, song_id, position)
             SELECT $1, song_id, position FROM UNNEST($2::bigint[], $3::int[]) AS t (song_id, position)",
        )
        .bind(id)
        .bind(&song_ids)
        .bind(&positions)
        .execute(&mut *tx)
        .await
        .map_err(write_error)?;
        commit(tx).await?;

        Ok(HourlySongChart {
            id,
            chart_id,
            hour,
            entries: sorted,
        })
    }

    async fn aggregate_chart(&self, hour: DateTime<Utc>) -> RepoResult<Option<AggregateHourlySongChart>> {
        let row = sqlx::query("SELECT id, hour FROM aggregate_hourly_song_charts WHERE hour = $1")
            .bind(hour)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => Ok(Some(self.load_aggregate(&row).await?)),
            None => Ok(None),
        }
    }

    async fn replace_aggregate_chart(
        &self,
        hour: DateTime<Utc>,
        component_chart_ids: &[i64],
        entries: &[AggregateEntry],
    ) -> RepoResult<AggregateHourlySongChart> {
        check_entry_uniqueness(entries.iter().map(|e| (e.song_id, e.position)))?;
        let mut sorted = entries.to_vec();
        sorted.sort_by_key(|e| e.position);
        let mut components = component_chart_ids.to_vec();
        components.sort_unstable();
        components.dedup();

        let mut tx = self.begin().await?;
        let id: i64 = sqlx::query(
            "INSERT INTO aggregate_hourly_song_charts (hour) VALUES ($1)
             ON CONFLICT (hour) DO UPDATE SET hour = EXCLUDED.hour
             RETURNING id",
        )
        .bind(hour)
        .fetch_one(&mut *tx)
        .await
        .map_err(write_error)?
        .try_get("id")
        .map_err(backend)?;

        sqlx::query("DELETE FROM aggregate_chart_components WHERE aggregate_chart_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        sqlx::query(
            "INSERT INTO aggregate_chart_components (aggregate_chart_id, hourly_chart_id)
             SELECT $1, hourly_chart_id FROM UNNEST($2::bigint[]) AS t (hourly_chart_id)",
        )
        .bind(id)
        .bind(&components)
        .execute(&mut *tx)
        .await
        .map_err(write_error)?;

        sqlx::query("DELETE FROM aggregate_hourly_song_chart_entries WHERE aggregate_chart_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        let song_ids = sorted.iter().map(|e| e.song_id).collect::<Vec<_>>();
        let positions = sorted.iter().map(|e| e.position as i32).collect::<Vec<_>>();
        let scores = sorted.iter().map(|e| e.score).collect::<Vec<_>>();
        sqlx::query(
            "INSERT INTO aggregate_hourly_song_chart_entries (aggregate_chart_id, song_id, position, score)
             SELECT $1, song_id, position, score
             FROM UNNEST($2::bigint[], $3::int[], $4::float8[]) AS t (song_id, position, score)",
        )
        .bind(id)
        .bind(&song_ids)
        .bind(&positions)
        .bind(&scores)
        .execute(&mut *tx)
        .await
        .map_err(write_error)?;
        commit(tx).await?;

        Ok(AggregateHourlySongChart {
            id,
            hour,
            component_chart_ids: components,
            entries: sorted,
        })
    }

    async fn position_at(&self, scope: ChartScope, hour: DateTime<Utc>, song_id: EntityId) -> RepoResult<Option<u32>> {
        let row = match scope {
            ChartScope::Aggregate => {
                sqlx::query(
                    "SELECT e.position FROM aggregate_hourly_song_chart_entries e
                     JOIN aggregate_hourly_song_charts a ON a.id = e.aggregate_chart_id
                     WHERE a.hour = $1 AND e.song_id = $2",
                )
                .bind(hour)
                .bind(song_id)
                .fetch_optional(&self.pool)
                .await
            }
            ChartScope::Chart(chart_id) => {
                sqlx::query(
                    "SELECT e.position FROM hourly_song_chart_entries e
                     JOIN hourly_song_charts h ON h.id = e.hourly_chart_id
                     WHERE h.hour = $1 AND e.song_id = $2 AND h.chart_id = $3",
                )
                .bind(hour)
                .bind(song_id)
                .bind(chart_id)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(backend)?;
        row.map(|r| position_from_row(&r)).transpose()
    }

    async fn song_history(&self, scope: ChartScope, song_id: EntityId) -> RepoResult<Vec<(DateTime<Utc>, u32)>> {
        let rows = match scope {
            ChartScope::Aggregate => {
                sqlx::query(
                    "SELECT a.hour, e.position FROM aggregate_hourly_song_chart_entries e
                     JOIN aggregate_hourly_song_charts a ON a.id = e.aggregate_chart_id
                     WHERE e.song_id = $1
                     ORDER BY a.hour",
                )
                .bind(song_id)
                .fetch_all(&self.pool)
                .await
            }
            ChartScope::Chart(chart_id) => {
                sqlx::query(
                    "SELECT h.hour, e.position FROM hourly_song_chart_entries e
                     JOIN hourly_song_charts h ON h.id = e.hourly_chart_id
                     WHERE e.song_id = $1 AND h.chart_id = $2
                     ORDER BY h.hour",
                )
                .bind(song_id)
                .bind(chart_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(backend)?;

        let mut history = Vec::with_capacity(rows.len());
        for row in &rows {
            history.push((row.try_get("hour").map_err(backend)?, position_from_row(row)?));
        }
        Ok(history)
    }
}
