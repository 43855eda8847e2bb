use redis::{aio::ConnectionManager, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;

use crate::error::RedisError;

/// JSON-over-Redis client sharing one auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisClient {
    manager: ConnectionManager,
}

impl RedisClient {
    pub async fn new(redis_url: &str) -> Result<Self, RedisError> {
        let client =
            Client::open(redis_url).map_err(|e| RedisError::ConnectionError(e.to_string()))?;

        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| RedisError::ConnectionError(e.to_string()))?;

        Ok(Self { manager })
    }

    /// Store `value` as a JSON string, replacing any previous value.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), RedisError> {
        let serialized = serde_json::to_string(value)?;

        redis::cmd("SET")
            .arg(key)
            .arg(&serialized)
            .query_async::<_, ()>(&mut self.manager.clone())
            .await
            .map_err(RedisError::from)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RedisError> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.manager.clone())
            .await
            .map_err(RedisError::from)?;

        match value {
            Some(v) => {
                let deserialized = serde_json::from_str(&v)?;
                Ok(Some(deserialized))
            }
            None => Ok(None),
        }
    }

    /// Set one field of a hash to `value` encoded as JSON.
    pub async fn hash_set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        field: &str,
        value: &T,
    ) -> Result<(), RedisError> {
        let serialized = serde_json::to_string(value)?;

        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(&serialized)
            .query_async::<_, ()>(&mut self.manager.clone())
            .await
            .map_err(RedisError::from)
    }

    /// Every field of a hash with its raw value.
    pub async fn hash_entries(&self, key: &str) -> Result<HashMap<String, String>, RedisError> {
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.manager.clone())
            .await
            .map_err(RedisError::from)
    }

    pub async fn delete(&self, key: &str) -> Result<(), RedisError> {
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut self.manager.clone())
            .await
            .map_err(RedisError::from)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, RedisError> {
        let exists: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.manager.clone())
            .await
            .map_err(RedisError::from)?;

        Ok(exists)
    }
}
