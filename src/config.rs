use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub path: PathBuf,
}

/// Process-wide store layout. The shard list is fixed for the lifetime of the
/// data: shard `i` of the list always holds partition `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolodeckConfig {
    pub canonical_path: PathBuf,
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub settings: StoreSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// How many of the newest samples a widget receives.
    pub sample_window: u32,
    pub api_key_max_attempts: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            sample_window: 50,
            api_key_max_attempts: 5,
        }
    }
}

impl HolodeckConfig {
    pub fn new(canonical_path: impl Into<PathBuf>, shard_paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            canonical_path: canonical_path.into(),
            shards: shard_paths.into_iter().map(|path| ShardConfig { path }).collect(),
            settings: StoreSettings::default(),
        }
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> AppResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|error| AppError::Config(format!("unreadable config: {}", error)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.shards.is_empty() {
            return Err(AppError::Config("at least one shard must be configured".to_string()));
        }
        self.settings.validate()?;

        let mut seen = HashSet::new();
        for shard in &self.shards {
            if shard.path == self.canonical_path {
                return Err(AppError::Config(format!(
                    "shard path {} is the canonical store",
                    shard.path.display()
                )));
            }
            if !seen.insert(&shard.path) {
                return Err(AppError::Config(format!(
                    "shard path {} is listed twice",
                    shard.path.display()
                )));
            }
        }
        Ok(())
    }
}

impl StoreSettings {
    pub fn validate(&self) -> AppResult<()> {
        if self.api_key_max_attempts == 0 {
            return Err(AppError::Config("api_key_max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::HolodeckConfig;
    use crate::errors::AppError;

    #[test]
    fn parses_with_default_settings() {
        let config = HolodeckConfig::from_json(
            r#"{
                "canonical_path": "/data/holodeck.db",
                "shards": [{ "path": "/data/shard_0.db" }, { "path": "/data/shard_1.db" }]
            }"#,
        )
        .expect("config");
        assert_eq!(config.shard_count(), 2);
        assert_eq!(config.settings.sample_window, 50);
        assert_eq!(config.settings.api_key_max_attempts, 5);
    }

    #[test]
    fn rejects_empty_shard_list() {
        let error = HolodeckConfig::from_json(r#"{ "canonical_path": "a.db", "shards": [] }"#)
            .expect_err("no shards");
        assert!(matches!(error, AppError::Config(_)));
    }

    #[test]
    fn rejects_duplicate_and_canonical_shard_paths() {
        let duplicate = HolodeckConfig::from_json(
            r#"{ "canonical_path": "a.db", "shards": [{ "path": "s.db" }, { "path": "s.db" }] }"#,
        );
        assert!(matches!(duplicate, Err(AppError::Config(_))));

        let canonical = HolodeckConfig::from_json(r#"{ "canonical_path": "a.db", "shards": [{ "path": "a.db" }] }"#);
        assert!(matches!(canonical, Err(AppError::Config(_))));
    }

    #[test]
    fn rejects_zero_key_attempts() {
        let error = HolodeckConfig::from_json(
            r#"{ "canonical_path": "a.db", "shards": [{ "path": "s.db" }],
                 "settings": { "api_key_max_attempts": 0 } }"#,
        );
        assert!(matches!(error, Err(AppError::Config(_))));
    }
}
