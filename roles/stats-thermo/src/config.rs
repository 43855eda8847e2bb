use chrono::FixedOffset;
use serde::Deserialize;
use stats_thermo::backend::{BackendKind, BackendSettings};
use std::{env, fs, time::Duration};
use thermo_stats::{AggregationSettings, AVERAGES_KEY, READINGS_KEY};

#[derive(Debug, Clone)]
pub struct Config {
    pub tcp_address: String,
    pub http_address: String,
    pub backend: BackendSettings,
    pub aggregation: AggregationSettings,
}

#[derive(Debug, Default, Deserialize)]
struct StatsThermoConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    aggregation: AggregationConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ServerConfig {
    tcp_listen_address: Option<String>,
    http_listen_address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StoreConfig {
    backend: Option<BackendKind>,
    sqlite_path: Option<String>,
    redis_url: Option<String>,
    readings_key: Option<String>,
    averages_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AggregationConfig {
    stale_window_secs: Option<u64>,
    utc_offset_minutes: Option<i32>,
    request_timeout_secs: Option<u64>,
}

fn flag_value(args: &[String], names: &[&str]) -> Option<String> {
    args.iter()
        .position(|arg| names.contains(&arg.as_str()))
        .and_then(|i| args.get(i + 1))
        .cloned()
}

impl Config {
    pub fn from_args() -> Result<Self, Box<dyn std::error::Error>> {
        let args: Vec<String> = env::args().collect();

        let config_path = flag_value(&args, &["--config", "-c"])
            .ok_or("Missing required argument: --config")?;

        let config_str = fs::read_to_string(&config_path).unwrap_or_default();
        let file_config: StatsThermoConfig = if config_str.is_empty() {
            StatsThermoConfig::default()
        } else {
            toml::from_str(&config_str)?
        };

        Self::resolve(file_config, &args)
    }

    /// Merge the file config with CLI overrides and fill in defaults.
    fn resolve(
        file_config: StatsThermoConfig,
        args: &[String],
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let tcp_address = flag_value(args, &["--tcp-address", "-t"])
            .or(file_config.server.tcp_listen_address)
            .unwrap_or_else(|| "127.0.0.1:9090".to_string());

        let http_address = flag_value(args, &["--http-address", "-h"])
            .or(file_config.server.http_listen_address)
            .unwrap_or_else(|| "127.0.0.1:9091".to_string());

        let store = file_config.store;
        let backend = BackendSettings {
            kind: store.backend.unwrap_or(BackendKind::Sqlite),
            sqlite_path: flag_value(args, &["--sqlite-path"])
                .or(store.sqlite_path)
                .unwrap_or_else(|| ".devenv/state/stats-thermo/readings.db".to_string()),
            redis_url: store
                .redis_url
                .unwrap_or_else(|| "redis://127.0.0.1/".to_string()),
            readings_key: store
                .readings_key
                .unwrap_or_else(|| READINGS_KEY.to_string()),
        };

        let aggregation_config = file_config.aggregation;
        let offset_minutes = aggregation_config.utc_offset_minutes.unwrap_or(0);
        let utc_offset = FixedOffset::east_opt(offset_minutes * 60)
            .ok_or("aggregation.utc_offset_minutes must be within ±24h")?;

        let aggregation = AggregationSettings {
            stale_window: Duration::from_secs(aggregation_config.stale_window_secs.unwrap_or(3600)),
            utc_offset,
            request_timeout: match aggregation_config.request_timeout_secs.unwrap_or(30) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            averages_key: store
                .averages_key
                .unwrap_or_else(|| AVERAGES_KEY.to_string()),
        };

        Ok(Config {
            tcp_address,
            http_address,
            backend,
            aggregation,
        })
    }
}
