use serde::Deserialize;
use std::sync::Arc;
use thermo_redis::RedisStore;
use thermo_stats::{
    KeyValueReadings, KeyValueStore, MemoryStore, Reading, ReadingSource, SqliteStorage,
    StoreError,
};
use tracing::info;

/// Which store holds readings and cached averages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Redis,
    Memory,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub sqlite_path: String,
    pub redis_url: String,
    pub readings_key: String,
}

/// Where ingested readings are written.
#[derive(Clone)]
pub enum ReadingSink {
    Sqlite(Arc<SqliteStorage>),
    Redis(RedisStore),
    Memory { store: MemoryStore, path: String },
}

impl ReadingSink {
    pub async fn insert(&self, key: &str, reading: &Reading) -> Result<(), StoreError> {
        match self {
            ReadingSink::Sqlite(storage) => storage.insert_reading(key, reading).await,
            ReadingSink::Redis(store) => store.insert_reading(key, reading).await,
            ReadingSink::Memory { store, path } => store.insert_reading(path, key, reading),
        }
    }
}

/// The reading source, cache store and ingest sink of one configured backend.
pub struct Backend {
    pub source: Arc<dyn ReadingSource>,
    pub store: Arc<dyn KeyValueStore>,
    pub sink: ReadingSink,
}

impl Backend {
    /// A backend living entirely in process memory.
    pub fn memory(store: MemoryStore, readings_key: &str) -> Self {
        Self {
            source: Arc::new(KeyValueReadings::new(store.clone(), readings_key)),
            store: Arc::new(store.clone()),
            sink: ReadingSink::Memory {
                store,
                path: readings_key.to_string(),
            },
        }
    }
}

pub async fn open_backend(settings: &BackendSettings) -> Result<Backend, Box<dyn std::error::Error>> {
    match settings.kind {
        BackendKind::Sqlite => {
            let storage = Arc::new(SqliteStorage::new(&settings.sqlite_path).await?);
            Ok(Backend {
                source: storage.clone(),
                store: storage.clone(),
                sink: ReadingSink::Sqlite(storage),
            })
        }
        BackendKind::Redis => {
            let store = RedisStore::connect(&settings.redis_url, settings.readings_key.clone()).await?;
            info!("Connected to Redis at {}", settings.redis_url);
            Ok(Backend {
                source: Arc::new(store.clone()),
                store: Arc::new(store.clone()),
                sink: ReadingSink::Redis(store),
            })
        }
        BackendKind::Memory => {
            info!("Using in-memory store; readings are lost on restart");
            Ok(Backend::memory(MemoryStore::new(), &settings.readings_key))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_sink_feeds_source() {
        let settings = BackendSettings {
            kind: BackendKind::Memory,
            sqlite_path: String::new(),
            redis_url: String::new(),
            readings_key: "Readings".to_string(),
        };
        let backend = open_backend(&settings).await.unwrap();

        backend
            .sink
            .insert("k1", &Reading::new("01/01/2024, 12:00:00", 20.0))
            .await
            .unwrap();

        let readings = backend.source.fetch_all().await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings["k1"].temperature, 20.0);
    }

    #[test]
    fn test_backend_kind_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            backend: BackendKind,
        }
        let parsed: Wrapper = toml::from_str(r#"backend = "redis""#).unwrap();
        assert_eq!(parsed.backend, BackendKind::Redis);
    }
}
