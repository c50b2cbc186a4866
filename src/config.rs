//! Queue tunables, persisted in the store's config collection.
//!
//! Two settings drive the retry policy: `max-retries` (default 3) and
//! `backoff-base` (default 2, the base of the exponential backoff). Values are
//! tolerated as either JSON numbers or numeric strings; unparseable values
//! fall back to the defaults.

use serde_json::Value;

use crate::store::{ConfigMap, FileStore, StoreError};
use crate::QueueError;

pub const MAX_RETRIES_KEY: &str = "max-retries";
pub const BACKOFF_BASE_KEY: &str = "backoff-base";

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;

pub(crate) fn defaults() -> ConfigMap {
    ConfigMap::from([
        (MAX_RETRIES_KEY.to_owned(), Value::from(DEFAULT_MAX_RETRIES)),
        (BACKOFF_BASE_KEY.to_owned(), Value::from(2)),
    ])
}

#[derive(Clone)]
pub struct ConfigStore {
    store: FileStore,
}

impl ConfigStore {
    pub fn new(store: FileStore) -> Self {
        Self { store }
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.store.config()?.get(key).cloned())
    }

    pub fn all(&self) -> Result<ConfigMap, StoreError> {
        self.store.config()
    }

    /// Sets a config value, validating the known retry tunables.
    pub fn set(&self, key: &str, raw: &str) -> Result<(), QueueError> {
        let value = match key {
            MAX_RETRIES_KEY => {
                let retries: u32 = raw.parse().map_err(|_| QueueError::InvalidConfigValue {
                    key: key.to_owned(),
                    reason: "expected a non-negative integer".to_owned(),
                })?;
                Value::from(retries)
            }
            BACKOFF_BASE_KEY => {
                let base: f64 = raw.parse().map_err(|_| QueueError::InvalidConfigValue {
                    key: key.to_owned(),
                    reason: "expected a number".to_owned(),
                })?;
                if !base.is_finite() || base < 1.0 {
                    return Err(QueueError::InvalidConfigValue {
                        key: key.to_owned(),
                        reason: "backoff base must be at least 1".to_owned(),
                    });
                }
                Value::from(base)
            }
            _ => raw
                .parse::<f64>()
                .ok()
                .and_then(|n| serde_json::Number::from_f64(n).map(Value::Number))
                .unwrap_or_else(|| Value::from(raw)),
        };
        self.store
            .update_config(|config| config.insert(key.to_owned(), value))?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.store
            .update_config(|config| config.remove(key).is_some())
    }

    pub fn reset(&self) -> Result<(), StoreError> {
        self.store.update_config(|config| *config = defaults())?;
        Ok(())
    }

    /// Maximum retry attempts before a job is dead-lettered.
    pub fn max_retries(&self) -> Result<u32, StoreError> {
        Ok(self
            .get(MAX_RETRIES_KEY)?
            .and_then(|value| as_u32(&value))
            .unwrap_or(DEFAULT_MAX_RETRIES))
    }

    /// Base of the exponential retry backoff, `base ^ attempts` seconds.
    pub fn backoff_base(&self) -> Result<f64, StoreError> {
        Ok(self
            .get(BACKOFF_BASE_KEY)?
            .and_then(|value| as_f64(&value))
            .unwrap_or(DEFAULT_BACKOFF_BASE))
    }
}

fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
