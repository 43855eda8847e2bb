//! Collaborator contracts: the raw reading source, the key-value store backing
//! the rollup cache, and change subscriptions for live consumers.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::types::Reading;

/// Raw reading history. Keys are opaque to aggregation.
#[async_trait::async_trait]
pub trait ReadingSource: Send + Sync {
    /// Fetch every stored reading.
    async fn fetch_all(&self) -> Result<HashMap<String, Reading>>;
}

/// Single-key JSON documents with atomic full-replace writes.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    /// Replace whatever is stored at `path` with `value`.
    async fn put(&self, path: &str, value: Value) -> Result<()>;
}

#[async_trait::async_trait]
impl<T: ReadingSource + ?Sized> ReadingSource for Arc<T> {
    async fn fetch_all(&self) -> Result<HashMap<String, Reading>> {
        (**self).fetch_all().await
    }
}

#[async_trait::async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        (**self).get(path).await
    }

    async fn put(&self, path: &str, value: Value) -> Result<()> {
        (**self).put(path, value).await
    }
}

/// Callback invoked with the new value at a path, or `None` once it is removed.
pub type ChangeListener = Box<dyn Fn(Option<&Value>) + Send + Sync>;

/// Push notification of changes at a path.
///
/// Live displays use this; the aggregation path only ever pulls.
pub trait Subscribe {
    /// Register `on_change`. It fires once immediately with the current value
    /// and again after every write to `path` until the subscription ends.
    fn subscribe(&self, path: &str, on_change: ChangeListener) -> Subscription;
}

/// Handle returned by [`Subscribe::subscribe`]. Dropping it also unsubscribes.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new<F>(detach: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.detach.is_some())
            .finish()
    }
}

/// Decode a JSON collection of readings keyed by opaque ids.
///
/// Objects map keys to readings; arrays are keyed by index with `null` holes
/// ignored. Children that do not decode as a [`Reading`] are skipped.
pub fn decode_readings(value: Value) -> Result<HashMap<String, Reading>> {
    let children: Vec<(String, Value)> = match value {
        Value::Object(map) => map.into_iter().collect(),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .filter(|(_, item)| !item.is_null())
            .map(|(idx, item)| (idx.to_string(), item))
            .collect(),
        Value::Null => Vec::new(),
        other => {
            return Err(StoreError::Unavailable(format!(
                "readings collection is not an object: {}",
                other
            )))
        }
    };

    let mut readings = HashMap::with_capacity(children.len());
    for (key, child) in children {
        match serde_json::from_value::<Reading>(child) {
            Ok(reading) => {
                readings.insert(key, reading);
            }
            Err(e) => warn!("Skipping undecodable reading {}: {}", key, e),
        }
    }

    Ok(readings)
}

/// Serves readings stored as one JSON collection at `path` of a [`KeyValueStore`].
pub struct KeyValueReadings<S> {
    store: S,
    path: String,
}

impl<S: KeyValueStore> KeyValueReadings<S> {
    pub fn new(store: S, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }
}

#[async_trait::async_trait]
impl<S: KeyValueStore> ReadingSource for KeyValueReadings<S> {
    async fn fetch_all(&self) -> Result<HashMap<String, Reading>> {
        match self.store.get(&self.path).await? {
            Some(value) => decode_readings(value),
            None => Err(StoreError::Unavailable(format!(
                "no readings at {}",
                self.path
            ))),
        }
    }
}
