use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env, fs, path::PathBuf, str::FromStr};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{entity::EntityType, orchestrator::DEFAULT_MAX_STEPS};

pub const MAX_STEPS_KEY: &str = "COURSEFLOW_MAX_STEPS";
pub const SESSION_TTL_KEY: &str = "COURSEFLOW_SESSION_TTL";
pub const DEFAULT_TRACK_KEY: &str = "COURSEFLOW_DEFAULT_TRACK";
pub const TRACK_KEY_PREFIX: &str = "COURSEFLOW_TRACK_";
/// Prefix shared by every key the engine reads.
pub const KEY_PREFIX: &str = "COURSEFLOW_";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("`{key}` must be a positive integer, got `{value}`")]
    InvalidNumber { key: String, value: String },

    #[error("`{key}` must not be empty")]
    Empty { key: String },

    #[error("could not write {path}: {reason}")]
    Write { path: String, reason: String },
}

#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from and written back to a `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            error!("could not load .env from {}", env_file.display())
        }

        Box::new(Self { env_file })
    }

    /// `.env` lines other than `key`, in file order.
    fn lines_without(&self, key: &str) -> Vec<String> {
        fs::read_to_string(&self.env_file)
            .unwrap_or_default()
            .lines()
            .filter(|line| match line.split_once('=') {
                Some((k, _)) => k.trim() != key,
                None => true,
            })
            .map(str::to_string)
            .collect()
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        unsafe {
            env::set_var(key, value);
        };
        let mut lines = self.lines_without(key);
        lines.push(format!("{key}={value}"));
        fs::write(&self.env_file, lines.join("\n")).map_err(|e| ConfigError::Write {
            path: self.env_file.display().to_string(),
            reason: e.to_string(),
        })
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            if let Err(e) = fs::write(&self.env_file, self.lines_without(key).join("\n")) {
                warn!("could not remove `{key}` from {}: {e}", self.env_file.display());
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "EnvConfigManager".to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }
    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Runtime knobs of the tutoring engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EngineConfig {
    /// Hard ceiling on orchestrator iterations per request.
    pub max_steps: usize,
    /// Idle seconds before a session is dropped.
    pub session_ttl: u64,
    /// Flow started for seeds without a specific track.
    pub default_track: String,
    /// Flow started per seed entity type.
    pub tracks: HashMap<EntityType, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            session_ttl: 30 * 60,
            default_track: "lesson".to_string(),
            tracks: HashMap::new(),
        }
    }
}

fn parse_positive<T: FromStr + PartialOrd + Default>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .ok()
        .filter(|n| *n > T::default())
        .ok_or_else(|| ConfigError::InvalidNumber {
            key: key.to_string(),
            value: value.to_string(),
        })
}

/// The engine's keys currently set, sorted.
pub async fn engine_keys(config: &ConfigManager) -> Vec<(String, String)> {
    let mut keys: Vec<_> = config
        .0
        .as_vec()
        .await
        .into_iter()
        .filter(|(key, _)| key.starts_with(KEY_PREFIX))
        .collect();
    keys.sort();
    keys
}

impl EngineConfig {
    /// Reads `COURSEFLOW_*` keys, keeping defaults for the missing ones.
    pub async fn load(config: &ConfigManager) -> Result<Self, ConfigError> {
        let mut engine = Self::default();
        if let Some(value) = config.0.get(MAX_STEPS_KEY).await {
            engine.max_steps = parse_positive(MAX_STEPS_KEY, &value)?;
        }
        if let Some(value) = config.0.get(SESSION_TTL_KEY).await {
            engine.session_ttl = parse_positive(SESSION_TTL_KEY, &value)?;
        }
        if let Some(value) = config.0.get(DEFAULT_TRACK_KEY).await {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty {
                    key: DEFAULT_TRACK_KEY.to_string(),
                });
            }
            engine.default_track = value.trim().to_string();
        }
        for kind in EntityType::ALL {
            let key = format!("{TRACK_KEY_PREFIX}{}", kind.as_str().to_uppercase());
            if let Some(flow) = config.0.get(&key).await {
                if !flow.trim().is_empty() {
                    engine.tracks.insert(kind, flow.trim().to_string());
                }
            }
        }
        Ok(engine)
    }

    /// Flow a session seeded with `kind` starts on.
    pub fn track_for(&self, kind: EntityType) -> &str {
        self.tracks
            .get(&kind)
            .map(String::as_str)
            .unwrap_or(&self.default_track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::{TempDir, tempdir};

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::new();

        mgr.set("foo", "bar").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));

        mgr.set("foo", "baz").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));
        assert_eq!(mgr.keys().await, vec!["foo".to_string()]);

        mgr.del("foo").await;
        assert_eq!(mgr.get("foo").await, None);
    }

    #[tokio::test]
    async fn test_env_config_manager_set_and_delete() {
        let key = "COURSEFLOW_TEST_SET_AND_DELETE";
        let tmp = TempDir::new().unwrap();
        let env = tmp.path().join(".env");
        write(&env, "OTHER=1\n").unwrap();

        let mgr = EnvConfigManager::new(env.clone());
        mgr.set(key, "secret").await.unwrap();
        assert_eq!(mgr.get(key).await, Some("secret".to_string()));
        let content = fs::read_to_string(&env).unwrap();
        assert!(content.contains("OTHER=1"));
        assert!(content.contains(&format!("{key}=secret")));

        mgr.del(key).await;
        assert_eq!(std::env::var(key).ok(), None);
        assert!(!fs::read_to_string(&env).unwrap().contains(key));
    }

    #[tokio::test]
    async fn test_env_config_manager_with_temp_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "COURSEFLOW_TEST_FROM_FILE=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(env_path);
        assert_eq!(
            mgr.get("COURSEFLOW_TEST_FROM_FILE").await,
            Some("abc123".to_string())
        );
    }

    #[tokio::test]
    async fn engine_keys_lists_only_courseflow_keys() {
        let map = MapConfigManager::new();
        map.set(SESSION_TTL_KEY, "90").await.unwrap();
        map.set("PATH", "/bin").await.unwrap();
        map.set(MAX_STEPS_KEY, "64").await.unwrap();
        let config = ConfigManager(map);

        assert_eq!(
            engine_keys(&config).await,
            vec![
                (MAX_STEPS_KEY.to_string(), "64".to_string()),
                (SESSION_TTL_KEY.to_string(), "90".to_string()),
            ]
        );
        config.0.del(MAX_STEPS_KEY).await;
        assert_eq!(engine_keys(&config).await.len(), 1);
    }

    #[tokio::test]
    async fn env_delete_without_a_writable_file_keeps_going() {
        let key = "COURSEFLOW_TEST_UNWRITABLE";
        let dir = tempdir().unwrap();
        // a directory where the `.env` file should be cannot be written
        let env = dir.path().join(".env");
        fs::create_dir(&env).unwrap();
        let mgr = EnvConfigManager::new(env);
        unsafe {
            std::env::set_var(key, "1");
        }
        mgr.del(key).await;
        assert_eq!(std::env::var(key).ok(), None);
    }

    #[tokio::test]
    async fn engine_config_defaults() {
        let config = ConfigManager(MapConfigManager::new());
        let engine = EngineConfig::load(&config).await.unwrap();
        assert_eq!(engine, EngineConfig::default());
        assert_eq!(engine.track_for(EntityType::Unit), "lesson");
    }

    #[tokio::test]
    async fn engine_config_from_keys() {
        let map = MapConfigManager::new();
        map.set(MAX_STEPS_KEY, "64").await.unwrap();
        map.set(SESSION_TTL_KEY, " 90 ").await.unwrap();
        map.set(DEFAULT_TRACK_KEY, "intro").await.unwrap();
        map.set("COURSEFLOW_TRACK_UNIT", "unit_track").await.unwrap();
        let engine = EngineConfig::load(&ConfigManager(map)).await.unwrap();

        assert_eq!(engine.max_steps, 64);
        assert_eq!(engine.session_ttl, 90);
        assert_eq!(engine.track_for(EntityType::Unit), "unit_track");
        assert_eq!(engine.track_for(EntityType::Lesson), "intro");
    }

    #[tokio::test]
    async fn engine_config_rejects_bad_numbers() {
        let map = MapConfigManager::new();
        map.set(MAX_STEPS_KEY, "0").await.unwrap();
        let err = EngineConfig::load(&ConfigManager(map)).await.unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                key: MAX_STEPS_KEY.to_string(),
                value: "0".to_string()
            }
        );
    }
}
