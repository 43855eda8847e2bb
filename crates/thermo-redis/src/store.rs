//! Redis implementation of the reading source and the rollup cache store.
//!
//! Readings live in a hash (`HSET <readings_key> <id> <reading json>`) and
//! the cached rollups in a plain string key holding one JSON document, so a
//! cache write is a single atomic `SET`.

use serde_json::Value;
use std::collections::HashMap;
use thermo_stats::error::Result;
use thermo_stats::{KeyValueStore, Reading, ReadingSource, StoreError};
use tracing::{debug, warn};

use crate::client::RedisClient;
use crate::error::RedisError;

#[derive(Clone)]
pub struct RedisStore {
    client: RedisClient,
    readings_key: String,
}

impl RedisStore {
    pub fn new(client: RedisClient, readings_key: impl Into<String>) -> Self {
        Self {
            client,
            readings_key: readings_key.into(),
        }
    }

    pub async fn connect(redis_url: &str, readings_key: impl Into<String>) -> std::result::Result<Self, RedisError> {
        Ok(Self::new(RedisClient::new(redis_url).await?, readings_key))
    }

    pub fn client(&self) -> &RedisClient {
        &self.client
    }

    /// Append one reading to the hash under `key`.
    pub async fn insert_reading(&self, key: &str, reading: &Reading) -> Result<()> {
        self.client
            .hash_set(&self.readings_key, key, reading)
            .await
            .map_err(StoreError::from)
    }
}

#[async_trait::async_trait]
impl ReadingSource for RedisStore {
    async fn fetch_all(&self) -> Result<HashMap<String, Reading>> {
        let entries = self.client.hash_entries(&self.readings_key).await?;
        debug!(
            "Fetched {} raw readings from {}",
            entries.len(),
            self.readings_key
        );

        let mut readings = HashMap::with_capacity(entries.len());
        for (key, raw) in entries {
            match serde_json::from_str::<Reading>(&raw) {
                Ok(reading) => {
                    readings.insert(key, reading);
                }
                Err(e) => warn!("Skipping undecodable reading {}: {}", key, e),
            }
        }

        Ok(readings)
    }
}

#[async_trait::async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.client.get::<Value>(path).await?)
    }

    async fn put(&self, path: &str, value: Value) -> Result<()> {
        Ok(self.client.set(path, &value).await?)
    }
}
