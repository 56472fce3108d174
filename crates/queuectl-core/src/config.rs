//! Typed configuration accessors over a [`ConfigStore`].
//!
//! Mirrors `original_source/src/config.py`: values are stored as strings,
//! defaults are seeded on first use, and typed getters silently fall back to
//! the provided default on parse failure rather than erroring.

use std::sync::Arc;

use crate::error::Result;
use crate::store::ConfigStore;

/// Default configuration, seeded into the store on first access.
pub const DEFAULTS: &[(&str, &str)] = &[
    ("max_retries", "3"),
    ("backoff_base", "2"),
    ("worker_default_count", "1"),
    ("abandoned_threshold", "3600"),
    ("poll_interval", "1.0"),
    ("log_level", "INFO"),
    ("job_timeout", "3600"),
];

fn default_for(key: &str) -> Option<&'static str> {
    DEFAULTS.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// A typed view over a durable [`ConfigStore`].
#[derive(Clone)]
pub struct Config {
    store: Arc<dyn ConfigStore>,
}

impl Config {
    /// Wrap a config store, seeding any missing default keys.
    pub async fn new(store: Arc<dyn ConfigStore>) -> Result<Self> {
        let existing = store.get_all_config().await?;
        for (key, value) in DEFAULTS {
            if !existing.iter().any(|(k, _)| k == key) {
                store.set_config(key, value).await?;
            }
        }
        Ok(Self { store })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.store.get_config(key).await? {
            Some(value) => Ok(Some(value)),
            None => Ok(default_for(key).map(str::to_string)),
        }
    }

    pub async fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key).await {
            Ok(Some(value)) => value.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub async fn get_float(&self, key: &str, default: f64) -> f64 {
        match self.get(key).await {
            Ok(Some(value)) => value.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.store.set_config(key, value).await
    }

    pub async fn get_all(&self) -> Result<Vec<(String, String)>> {
        self.store.get_all_config().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockConfigStore(StdMutex<HashMap<String, String>>);

    #[async_trait::async_trait]
    impl ConfigStore for MockConfigStore {
        async fn get_config(&self, key: &str) -> Result<Option<String>> {
            Ok(self.0.lock().unwrap().get(key).cloned())
        }

        async fn set_config(&self, key: &str, value: &str) -> Result<()> {
            self.0.lock().unwrap().insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn get_all_config(&self) -> Result<Vec<(String, String)>> {
            Ok(self.0.lock().unwrap().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        }
    }

    #[tokio::test]
    async fn new_seeds_missing_defaults_without_overwriting_existing() {
        let store = Arc::new(MockConfigStore::default());
        store.set_config("backoff_base", "9").await.unwrap();

        let config = Config::new(store.clone()).await.unwrap();

        assert_eq!(config.get("backoff_base").await.unwrap().as_deref(), Some("9"));
        assert_eq!(config.get("max_retries").await.unwrap().as_deref(), Some("3"));
        assert_eq!(config.get("job_timeout").await.unwrap().as_deref(), Some("3600"));
        assert_eq!(config.get("nonexistent_key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn typed_getters_fall_back_on_parse_failure() {
        let store = Arc::new(MockConfigStore::default());
        let config = Config::new(store.clone()).await.unwrap();
        store.set_config("backoff_base", "not-a-number").await.unwrap();

        assert_eq!(config.get_int("backoff_base", 2).await, 2);
        assert_eq!(config.get_float("poll_interval", 1.0).await, 1.0);

        config.set("backoff_base", "5").await.unwrap();
        assert_eq!(config.get_int("backoff_base", 2).await, 5);
    }
}
