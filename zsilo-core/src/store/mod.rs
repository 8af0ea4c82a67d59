//! Volume catalog with SQLite persistence.
//!
//! The store owns the volume rows. RPC handlers mutate a row and run its
//! side effect inside one transaction, so the free functions here operate on
//! a `SqliteConnection`: pass a pool connection for standalone access or a
//! transaction for composed access. [`VolumeStore`] wraps the pool with the
//! common pool-level entry points.

use crate::error::{Result, SiloError};
use crate::types::{Volume, VolumeMode, VolumeStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row, Sqlite, SqliteConnection, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, instrument};

pub mod migrations;


/// Current unix time in seconds.
pub fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Persistent volume catalog.
#[derive(Clone)]
pub struct VolumeStore {
    pool: SqlitePool,
}

impl VolumeStore {
    /// Create a store with an in-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    /// Create a store with a database at the specified path.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing volume store at {:?}", db_path);

        let in_memory = db_path == Path::new(":memory:");

        // Create parent directory if it doesn't exist (but not for :memory:)
        if !in_memory {
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    SiloError::Database(format!(
                        "failed to create directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let mut options = SqliteConnectOptions::from_str(db_path.to_str().ok_or_else(|| {
            SiloError::Database("invalid database path".to_string())
        })?)
        .map_err(|e| SiloError::Database(e.to_string()))?;

        options = options.create_if_missing(true).log_statements(tracing::log::LevelFilter::Debug);

        // An in-memory SQLite database exists per connection, so the pool
        // must stay at one connection for every caller to see the same data.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await
            .map_err(|e| SiloError::Database(e.to_string()))?;

        let store = Self { pool };

        migrations::run(&store.pool).await?;

        info!("Volume store initialized");
        Ok(store)
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction. Dropping it without commit rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.map_err(|e| SiloError::Database(e.to_string()))
    }

    /// Insert a new volume. Fails with `AlreadyExists` when the id or the
    /// dataset collide.
    #[instrument(skip(self, volume), fields(volume_id = %volume.id))]
    pub async fn insert_volume(&self, volume: &mut Volume) -> Result<()> {
        let mut conn =
            self.pool.acquire().await.map_err(|e| SiloError::Database(e.to_string()))?;
        insert_volume(&mut *conn, volume).await
    }

    /// Get a volume by ID.
    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn get_volume(&self, id: &str) -> Result<Volume> {
        let mut conn =
            self.pool.acquire().await.map_err(|e| SiloError::Database(e.to_string()))?;
        get_volume(&mut *conn, id).await
    }

    /// Update a volume row in place.
    #[instrument(skip(self, volume), fields(volume_id = %volume.id))]
    pub async fn update_volume(&self, volume: &mut Volume) -> Result<()> {
        let mut conn =
            self.pool.acquire().await.map_err(|e| SiloError::Database(e.to_string()))?;
        update_volume(&mut *conn, volume).await
    }

    /// Delete a volume by ID.
    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn delete_volume(&self, id: &str) -> Result<()> {
        let mut conn =
            self.pool.acquire().await.map_err(|e| SiloError::Database(e.to_string()))?;
        delete_volume(&mut *conn, id).await
    }

    /// List one page of volumes, newest first.
    #[instrument(skip(self))]
    pub async fn list_volumes(&self, offset: i64, limit: i64) -> Result<Vec<Volume>> {
        let rows = sqlx::query(
            "SELECT * FROM volumes ORDER BY create_time DESC, id ASC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SiloError::Database(e.to_string()))?;

        rows.into_iter().map(row_to_volume).collect()
    }

    /// List every volume, newest first.
    #[instrument(skip(self))]
    pub async fn list_all_volumes(&self) -> Result<Vec<Volume>> {
        let rows = sqlx::query("SELECT * FROM volumes ORDER BY create_time DESC, id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SiloError::Database(e.to_string()))?;

        rows.into_iter().map(row_to_volume).collect()
    }
}

/// Insert a volume row. Zero timestamps are filled in with the current time.
pub async fn insert_volume(conn: &mut SqliteConnection, volume: &mut Volume) -> Result<()> {
    if volume.create_time == 0 {
        volume.create_time = now_unix();
    }
    volume.update_time = now_unix();

    let options_json = serde_json::to_string(&volume.options)
        .map_err(|e| SiloError::Database(format!("failed to serialize options: {e}")))?;
    let attrs_json = serde_json::to_string(&volume.attrs)
        .map_err(|e| SiloError::Database(format!("failed to serialize attrs: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO volumes (
            id, name, dataset_id, mode, status, capacity_bytes, sparse,
            options, attrs, target_iqn, initiator_iqn, target_address,
            mount_path, create_time, update_time
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&volume.id)
    .bind(&volume.name)
    .bind(&volume.dataset_id)
    .bind(volume.mode.as_str())
    .bind(volume.status.as_str())
    .bind(volume.capacity_bytes)
    .bind(volume.sparse)
    .bind(options_json)
    .bind(attrs_json)
    .bind(&volume.target_iqn)
    .bind(&volume.initiator_iqn)
    .bind(&volume.target_address)
    .bind(&volume.mount_path)
    .bind(volume.create_time)
    .bind(volume.update_time)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        metrics::counter!("zsilo_db_errors_total", "operation" => "insert_volume").increment(1);
        map_write_error(e)
    })?;

    Ok(())
}

/// Get a volume row by ID.
pub async fn get_volume(conn: &mut SqliteConnection, id: &str) -> Result<Volume> {
    let row = sqlx::query("SELECT * FROM volumes WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| SiloError::Database(e.to_string()))?
        .ok_or_else(|| SiloError::NotFound("volume does not exist".to_string()))?;

    row_to_volume(row)
}

/// Write every mutable field of a volume row and bump its update time.
pub async fn update_volume(conn: &mut SqliteConnection, volume: &mut Volume) -> Result<()> {
    volume.update_time = now_unix();

    let options_json = serde_json::to_string(&volume.options)
        .map_err(|e| SiloError::Database(format!("failed to serialize options: {e}")))?;
    let attrs_json = serde_json::to_string(&volume.attrs)
        .map_err(|e| SiloError::Database(format!("failed to serialize attrs: {e}")))?;

    let result = sqlx::query(
        r#"
        UPDATE volumes SET
            name = ?, status = ?, capacity_bytes = ?, options = ?, attrs = ?,
            target_iqn = ?, initiator_iqn = ?, target_address = ?,
            mount_path = ?, update_time = ?
        WHERE id = ?
        "#,
    )
    .bind(&volume.name)
    .bind(volume.status.as_str())
    .bind(volume.capacity_bytes)
    .bind(&options_json)
    .bind(&attrs_json)
    .bind(&volume.target_iqn)
    .bind(&volume.initiator_iqn)
    .bind(&volume.target_address)
    .bind(&volume.mount_path)
    .bind(volume.update_time)
    .bind(&volume.id)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        metrics::counter!("zsilo_db_errors_total", "operation" => "update_volume").increment(1);
        map_write_error(e)
    })?;

    if result.rows_affected() == 0 {
        return Err(SiloError::NotFound("volume does not exist".to_string()));
    }
    Ok(())
}

/// Delete a volume row by ID.
pub async fn delete_volume(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM volumes WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            metrics::counter!("zsilo_db_errors_total", "operation" => "delete_volume").increment(1);
            SiloError::Database(e.to_string())
        })?;

    if result.rows_affected() == 0 {
        return Err(SiloError::NotFound("volume does not exist".to_string()));
    }
    Ok(())
}

fn map_write_error(err: sqlx::Error) -> SiloError {
    let message = err.to_string();
    if message.contains("UNIQUE constraint failed") {
        SiloError::AlreadyExists("volume already exists".to_string())
    } else {
        SiloError::Database(message)
    }
}

fn row_to_volume(row: SqliteRow) -> Result<Volume> {
    let mode_str: String = row.get("mode");
    let mode = VolumeMode::parse(&mode_str)
        .ok_or_else(|| SiloError::NotFound(format!("unknown volume mode {mode_str}")))?;

    let status_str: String = row.get("status");
    let status = VolumeStatus::parse(&status_str)
        .ok_or_else(|| SiloError::NotFound(format!("unknown volume status {status_str}")))?;

    let options_json: String = row.get("options");
    let options = serde_json::from_str(&options_json)
        .map_err(|e| SiloError::Database(format!("failed to deserialize options: {e}")))?;

    let attrs_json: String = row.get("attrs");
    let attrs = serde_json::from_str(&attrs_json)
        .map_err(|e| SiloError::Database(format!("failed to deserialize attrs: {e}")))?;

    Ok(Volume {
        id: row.get("id"),
        name: row.get("name"),
        dataset_id: row.get("dataset_id"),
        mode,
        status,
        capacity_bytes: row.get("capacity_bytes"),
        sparse: row.get("sparse"),
        options,
        attrs,
        target_iqn: row.get("target_iqn"),
        initiator_iqn: row.get("initiator_iqn"),
        target_address: row.get("target_address"),
        mount_path: row.get("mount_path"),
        create_time: row.get("create_time"),
        update_time: row.get("update_time"),
    })
}
