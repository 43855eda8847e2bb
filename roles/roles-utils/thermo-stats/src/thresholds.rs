//! User-set temperature thresholds stored next to the rollups.
//!
//! `minTemp`/`maxTemp` bound the alarm range and `minColorTemp`/`maxColorTemp`
//! the range a dashboard maps onto its colour scale.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{StoreError, ThresholdError};
use crate::storage::KeyValueStore;
use crate::types::number_or_string;

/// Key the threshold document is stored under.
pub const THRESHOLDS_KEY: &str = "TemperatureConfig";

/// Lowest temperature the sensor reports.
pub const SENSOR_MIN: f64 = -55.0;
/// Highest temperature the sensor reports.
pub const SENSOR_MAX: f64 = 125.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdConfig {
    #[serde(deserialize_with = "number_or_string")]
    pub min_temp: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub max_temp: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub min_color_temp: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub max_color_temp: f64,
}

impl ThresholdConfig {
    /// Both ranges must lie within the sensor's span with `min < max`.
    pub fn validate(&self) -> Result<(), ThresholdError> {
        let in_span = |t: f64| (SENSOR_MIN..=SENSOR_MAX).contains(&t);

        if ![
            self.min_temp,
            self.max_temp,
            self.min_color_temp,
            self.max_color_temp,
        ]
        .into_iter()
        .all(in_span)
        {
            return Err(ThresholdError::Invalid("values must be within -55..=125"));
        }
        if self.min_temp >= self.max_temp {
            return Err(ThresholdError::Invalid("minTemp must be below maxTemp"));
        }
        if self.min_color_temp >= self.max_color_temp {
            return Err(ThresholdError::Invalid(
                "minColorTemp must be below maxColorTemp",
            ));
        }
        Ok(())
    }

    /// True when `temperature` touches or leaves the alarm range.
    pub fn is_out_of_range(&self, temperature: f64) -> bool {
        temperature <= self.min_temp || temperature >= self.max_temp
    }
}

/// Read/write access to the stored [`ThresholdConfig`].
pub struct ThresholdStore<S> {
    store: S,
    key: String,
}

impl<S: KeyValueStore> ThresholdStore<S> {
    pub fn new(store: S) -> Self {
        Self::with_key(store, THRESHOLDS_KEY)
    }

    pub fn with_key(store: S, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// The stored thresholds, or `None` if nothing usable is stored.
    pub async fn load(&self) -> Result<Option<ThresholdConfig>, ThresholdError> {
        let Some(value) = self.store.get(&self.key).await? else {
            debug!("No thresholds at {}", self.key);
            return Ok(None);
        };

        match serde_json::from_value::<ThresholdConfig>(value) {
            Ok(config) => Ok(Some(config)),
            Err(e) => {
                warn!("Thresholds at {} do not decode, ignoring: {}", self.key, e);
                Ok(None)
            }
        }
    }

    /// Validate and replace the stored thresholds.
    pub async fn save(&self, config: &ThresholdConfig) -> Result<(), ThresholdError> {
        config.validate()?;
        let value = serde_json::to_value(config).map_err(StoreError::from)?;
        self.store.put(&self.key, value).await?;

        info!(
            "Updated thresholds: alarm {}..{}, colour {}..{}",
            config.min_temp, config.max_temp, config.min_color_temp, config.max_color_temp
        );
        Ok(())
    }
}
