//! SqliteStore - SQLite implementation of the sighting and snapshot stores.
//!
//! Every write is an idempotent upsert on the record's natural key, and a
//! batch is applied inside one transaction so a failed commit leaves nothing
//! half-written.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite, Transaction};
use tracing::{debug, info};

use crate::scanner::storage::{SightingStore, SnapshotStore};
use crate::scanner::timing;
use crate::scanner::write_buffer::WriteRequest;
use crate::types::{Coordinates, EncounterStats, SeenSample, SpawnId, SpawnPointRecord};

#[derive(FromRow)]
struct SpawnPointRow {
    spawn_id: i64,
    lat: f64,
    lon: f64,
    despawn_time: Option<i64>,
    updated: i64,
}

impl From<SpawnPointRow> for SpawnPointRecord {
    fn from(row: SpawnPointRow) -> Self {
        Self {
            spawn_id: row.spawn_id as SpawnId,
            coords: Coordinates::new(row.lat, row.lon),
            despawn_offset: row.despawn_time,
            updated: row.updated,
        }
    }
}

#[derive(FromRow)]
struct SampleRow {
    spawn_id: i64,
    first_seen: i64,
    first_seconds: i64,
    last_seconds: i64,
}

impl SampleRow {
    fn sample(&self) -> SeenSample {
        SeenSample {
            first_seen: self.first_seen,
            first_seconds: self.first_seconds,
            last_seconds: self.last_seconds,
        }
    }
}

#[derive(FromRow)]
struct SnapshotRow {
    blob: String,
}

/// Optional encounter columns, bound as NULL when absent.
struct DetailColumns {
    attack: Option<i64>,
    defense: Option<i64>,
    stamina: Option<i64>,
    move_1: Option<i64>,
    move_2: Option<i64>,
}

impl From<Option<EncounterStats>> for DetailColumns {
    fn from(detail: Option<EncounterStats>) -> Self {
        Self {
            attack: detail.map(|d| d.attack as i64),
            defense: detail.map(|d| d.defense as i64),
            stamina: detail.map(|d| d.stamina as i64),
            move_1: detail.map(|d| d.move_1 as i64),
            move_2: detail.map(|d| d.move_2 as i64),
        }
    }
}

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Connect to the database and create the schema if needed.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::create_schema(&pool).await?;

        info!("SqliteStore initialized and connected to {}", database_url);
        Ok(Self { pool })
    }

    async fn create_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sightings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                encounter_id INTEGER NOT NULL,
                spawn_id INTEGER NOT NULL,
                species_id INTEGER NOT NULL,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                seen INTEGER NOT NULL,
                expire_timestamp INTEGER NOT NULL,
                inferred BOOLEAN NOT NULL DEFAULT FALSE,
                attack INTEGER,
                defense INTEGER,
                stamina INTEGER,
                move_1 INTEGER,
                move_2 INTEGER,
                UNIQUE(encounter_id, expire_timestamp)
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create sightings table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mysteries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                encounter_id INTEGER NOT NULL,
                spawn_id INTEGER NOT NULL,
                species_id INTEGER NOT NULL,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                first_seen INTEGER NOT NULL,
                first_seconds INTEGER NOT NULL,
                last_seconds INTEGER NOT NULL,
                seen_range INTEGER NOT NULL,
                attack INTEGER,
                defense INTEGER,
                stamina INTEGER,
                move_1 INTEGER,
                move_2 INTEGER,
                UNIQUE(encounter_id, spawn_id)
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create mysteries table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mysteries_spawn ON mysteries(spawn_id);")
            .execute(pool)
            .await
            .context("Failed to create mysteries index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS spawnpoints (
                spawn_id INTEGER PRIMARY KEY,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                despawn_time INTEGER,
                updated INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create spawnpoints table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS features (
                feature_id TEXT PRIMARY KEY,
                lat REAL NOT NULL,
                lon REAL NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create features table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feature_sightings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feature_id TEXT NOT NULL,
                team INTEGER NOT NULL,
                prestige INTEGER NOT NULL,
                guard_species_id INTEGER NOT NULL,
                last_modified INTEGER NOT NULL,
                UNIQUE(feature_id, last_modified)
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create feature_sightings table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identity_failures (
                username TEXT PRIMARY KEY,
                failures INTEGER NOT NULL,
                updated INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create identity_failures table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                key TEXT PRIMARY KEY,
                blob TEXT NOT NULL,
                updated INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create snapshots table")?;

        Ok(())
    }

    async fn apply(tx: &mut Transaction<'_, Sqlite>, request: &WriteRequest) -> Result<()> {
        match request {
            WriteRequest::Sighting(s) => {
                let detail = DetailColumns::from(s.detail);
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO sightings (
                        encounter_id, spawn_id, species_id, lat, lon, seen, expire_timestamp,
                        inferred, attack, defense, stamina, move_1, move_2
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(s.encounter_id as i64)
                .bind(s.spawn_id as i64)
                .bind(s.species_id as i64)
                .bind(s.coords.lat)
                .bind(s.coords.lon)
                .bind(s.seen)
                .bind(s.expire_timestamp)
                .bind(s.inferred)
                .bind(detail.attack)
                .bind(detail.defense)
                .bind(detail.stamina)
                .bind(detail.move_1)
                .bind(detail.move_2)
                .execute(&mut **tx)
                .await?;
            }
            WriteRequest::Mystery(m) => {
                let sample = SeenSample::from_observations(m.seen, m.seen);
                let detail = DetailColumns::from(m.detail);
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO mysteries (
                        encounter_id, spawn_id, species_id, lat, lon, first_seen, first_seconds,
                        last_seconds, seen_range, attack, defense, stamina, move_1, move_2
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(m.encounter_id as i64)
                .bind(m.spawn_id as i64)
                .bind(m.species_id as i64)
                .bind(m.coords.lat)
                .bind(m.coords.lon)
                .bind(sample.first_seen)
                .bind(sample.first_seconds)
                .bind(sample.last_seconds)
                .bind(sample.range())
                .bind(detail.attack)
                .bind(detail.defense)
                .bind(detail.stamina)
                .bind(detail.move_1)
                .bind(detail.move_2)
                .execute(&mut **tx)
                .await?;
            }
            WriteRequest::FeatureSighting(f) => {
                sqlx::query("INSERT OR IGNORE INTO features (feature_id, lat, lon) VALUES (?, ?, ?)")
                    .bind(&f.feature_id)
                    .bind(f.coords.lat)
                    .bind(f.coords.lon)
                    .execute(&mut **tx)
                    .await?;
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO feature_sightings (
                        feature_id, team, prestige, guard_species_id, last_modified
                    ) VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&f.feature_id)
                .bind(f.team as i64)
                .bind(f.prestige as i64)
                .bind(f.guard_species_id as i64)
                .bind(f.last_modified)
                .execute(&mut **tx)
                .await?;
            }
            WriteRequest::FeatureLocation(l) => {
                sqlx::query("INSERT OR IGNORE INTO features (feature_id, lat, lon) VALUES (?, ?, ?)")
                    .bind(&l.feature_id)
                    .bind(l.coords.lat)
                    .bind(l.coords.lon)
                    .execute(&mut **tx)
                    .await?;
            }
            WriteRequest::ThrottleFailures { username, failures } => {
                sqlx::query(
                    r#"
                    INSERT INTO identity_failures (username, failures, updated) VALUES (?, ?, ?)
                    ON CONFLICT(username) DO UPDATE SET failures = excluded.failures, updated = excluded.updated
                    "#,
                )
                .bind(username)
                .bind(*failures as i64)
                .bind(timing::now_secs())
                .execute(&mut **tx)
                .await?;
            }
            WriteRequest::DeadlineCorrection(c) => {
                // last_seconds is relative to the hour of first_seen
                sqlx::query(
                    r#"
                    UPDATE mysteries
                    SET last_seconds = ? - (first_seen - first_seconds),
                        seen_range = ? - first_seen
                    WHERE encounter_id = ? AND spawn_id = ?
                    "#,
                )
                .bind(c.last_seen)
                .bind(c.last_seen)
                .bind(c.encounter_id as i64)
                .bind(c.spawn_id as i64)
                .execute(&mut **tx)
                .await?;
            }
            WriteRequest::SpawnPoint(p) => {
                let sql = if p.despawn_offset.is_some() {
                    r#"
                    INSERT INTO spawnpoints (spawn_id, lat, lon, despawn_time, updated) VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(spawn_id) DO UPDATE SET despawn_time = excluded.despawn_time, updated = excluded.updated
                    "#
                } else {
                    "INSERT OR IGNORE INTO spawnpoints (spawn_id, lat, lon, despawn_time, updated) VALUES (?, ?, ?, ?, ?)"
                };
                sqlx::query(sql)
                    .bind(p.spawn_id as i64)
                    .bind(p.coords.lat)
                    .bind(p.coords.lon)
                    .bind(p.despawn_offset)
                    .bind(p.updated)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SightingStore for SqliteStore {
    async fn commit(&self, batch: &[WriteRequest]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for request in batch {
            Self::apply(&mut tx, request).await?;
        }
        tx.commit().await.context("Failed to commit write batch")?;
        debug!("Committed {} writes", batch.len());
        Ok(())
    }

    async fn load_spawns(&self) -> Result<Vec<SpawnPointRecord>> {
        let rows = sqlx::query_as::<_, SpawnPointRow>(
            "SELECT spawn_id, lat, lon, despawn_time, updated FROM spawnpoints",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load spawn points")?;
        Ok(rows.into_iter().map(SpawnPointRecord::from).collect())
    }

    async fn historical_samples(&self, spawn_id: SpawnId) -> Result<Vec<SeenSample>> {
        let rows = sqlx::query_as::<_, SampleRow>(
            "SELECT spawn_id, first_seen, first_seconds, last_seconds FROM mysteries WHERE spawn_id = ?",
        )
        .bind(spawn_id as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load seen samples")?;
        Ok(rows.iter().map(SampleRow::sample).collect())
    }

    async fn all_samples(&self) -> Result<Vec<(SpawnId, SeenSample)>> {
        let rows = sqlx::query_as::<_, SampleRow>(
            "SELECT spawn_id, first_seen, first_seconds, last_seconds FROM mysteries",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load seen samples")?;
        Ok(rows.iter().map(|row| (row.spawn_id as SpawnId, row.sample())).collect())
    }

    async fn health_check(&self) -> Result<bool> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!("Health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn save_snapshot(&self, key: &str, blob: &serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (key, blob, updated) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET blob = excluded.blob, updated = excluded.updated
            "#,
        )
        .bind(key)
        .bind(serde_json::to_string(blob)?)
        .bind(timing::now_secs())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save snapshot {}", key))?;
        Ok(())
    }

    async fn load_snapshot(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query_as::<_, SnapshotRow>("SELECT blob FROM snapshots WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to load snapshot {}", key))?;
        row.map(|r| serde_json::from_str(&r.blob).context("Snapshot is not valid JSON"))
            .transpose()
    }
}
