//! SQLite backend holding raw readings and key-value documents.

use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::{KeyValueStore, ReadingSource};
use crate::types::Reading;

/// SQLite-backed reading history and rollup cache.
pub struct SqliteStorage {
    pool: Pool<Sqlite>,
}

impl SqliteStorage {
    /// Open (creating if missing) the database at `db_path`.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Create parent directories if they don't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let connection_options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connection_options)
            .await?;

        let storage = Self { pool };
        storage.init_schema().await?;

        info!("Opened SQLite store at {}", db_path.display());
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS readings (
                key TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                temperature REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                path TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Store one reading. Re-inserting an existing key overwrites it.
    pub async fn insert_reading(&self, key: &str, reading: &Reading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (key, timestamp, temperature)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                timestamp = excluded.timestamp,
                temperature = excluded.temperature
            "#,
        )
        .bind(key)
        .bind(&reading.timestamp)
        .bind(reading.temperature)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl ReadingSource for SqliteStorage {
    async fn fetch_all(&self) -> Result<HashMap<String, Reading>> {
        let rows = sqlx::query("SELECT key, timestamp, temperature FROM readings")
            .fetch_all(&self.pool)
            .await?;

        debug!("Fetched {} readings from SQLite", rows.len());

        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<String, _>("key"),
                    Reading {
                        timestamp: row.get::<String, _>("timestamp"),
                        temperature: row.get::<f64, _>("temperature"),
                    },
                )
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl KeyValueStore for SqliteStorage {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw = row.get::<String, _>("value");
                match serde_json::from_str(&raw) {
                    Ok(value) => Ok(Some(value)),
                    Err(e) => {
                        warn!("Stored value at {} is not valid JSON: {}", path, e);
                        Err(e.into())
                    }
                }
            }
            None => Ok(None),
        }
    }

    async fn put(&self, path: &str, value: Value) -> Result<()> {
        let encoded = serde_json::to_string(&value)?;
        sqlx::query(
            r#"
            INSERT INTO kv_store (path, value)
            VALUES (?, ?)
            ON CONFLICT(path) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(path)
        .bind(encoded)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
