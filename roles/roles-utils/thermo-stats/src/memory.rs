//! In-process JSON store with change subscriptions.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

use crate::error::Result;
use crate::storage::{ChangeListener, KeyValueStore, Subscribe, Subscription};
use crate::types::Reading;

type Listeners = HashMap<String, Vec<(u64, Arc<ChangeListener>)>>;

#[derive(Default)]
struct Inner {
    values: RwLock<HashMap<String, Value>>,
    listeners: Mutex<Listeners>,
    next_listener_id: AtomicU64,
}

/// Top-level paths mapped to JSON documents, shared between clones.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reading under `key` to the collection at `path`, creating it if needed.
    pub fn insert_reading(&self, path: &str, key: &str, reading: &Reading) -> Result<()> {
        let encoded = serde_json::to_value(reading)?;
        let updated = {
            let mut values = self
                .inner
                .values
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let collection = values
                .entry(path.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !collection.is_object() {
                *collection = Value::Object(Map::new());
            }
            if let Value::Object(map) = collection {
                map.insert(key.to_string(), encoded);
            }
            collection.clone()
        };

        self.notify(path, Some(&updated));
        Ok(())
    }

    /// Drop the document at `path`, returning it.
    pub fn remove(&self, path: &str) -> Option<Value> {
        let removed = self
            .inner
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        if removed.is_some() {
            self.notify(path, None);
        }
        removed
    }

    fn current(&self, path: &str) -> Option<Value> {
        self.inner
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    fn notify(&self, path: &str, value: Option<&Value>) {
        // Listeners run outside the lock so they may call back into the store.
        let listeners: Vec<Arc<ChangeListener>> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        debug!("Notifying {} listeners of change at {}", listeners.len(), path);
        for listener in listeners {
            listener(value);
        }
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.current(path))
    }

    async fn put(&self, path: &str, value: Value) -> Result<()> {
        self.inner
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), value.clone());
        self.notify(path, Some(&value));
        Ok(())
    }
}

impl Subscribe for MemoryStore {
    fn subscribe(&self, path: &str, on_change: ChangeListener) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let listener = Arc::new(on_change);

        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_string())
            .or_default()
            .push((id, listener.clone()));

        listener(self.current(path).as_ref());

        let inner = Arc::downgrade(&self.inner);
        let path = path.to_string();
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                let mut listeners = inner
                    .listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some(entries) = listeners.get_mut(&path) {
                    entries.retain(|(entry_id, _)| *entry_id != id);
                    if entries.is_empty() {
                        listeners.remove(&path);
                    }
                }
            }
        })
    }
}
