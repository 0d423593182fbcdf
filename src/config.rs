use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::adapters::http::HttpClientConfig;
use crate::cache::CacheConfig;
use crate::sync::NativeOrder;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const CONFIG_ENV: &str = "LIFELOG_CONFIG";
pub const DATA_DIR_ENV: &str = "LIFELOG_DATA_DIR";
const CONFIG_FILE_NAME: &str = "lifelog.json";
const DATABASE_FILE_NAME: &str = "lifelog.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Feed,
    Game,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// 0 disables the source.
    #[serde(default)]
    pub interval_mins: u64,
    #[serde(default)]
    pub device_id: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub credentials: SourceCredentials,
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    /// Feed sources only: the order the API lists entries in.
    #[serde(default)]
    pub oldest_first: bool,
    #[serde(default)]
    pub timeout_ms: u64,
}

impl SourceConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_mins.saturating_mul(60))
    }

    pub fn native_order(&self) -> NativeOrder {
        if self.oldest_first {
            NativeOrder::OldestFirst
        } else {
            NativeOrder::NewestFirst
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.base_url.clone(),
            token_url: self.token_url.clone(),
            client_id: self.credentials.client_id.clone(),
            client_secret: self.credentials.client_secret.clone(),
            api_key: self.credentials.api_key.clone(),
            timeout_ms: self.timeout_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_path: Option<PathBuf>,
    pub cache: CacheConfig,
    pub sources: BTreeMap<String, SourceConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            database_path: None,
            cache: CacheConfig::default(),
            sources: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Resolve the config file from the environment and load it.
    pub fn from_env() -> Self {
        let data_dir_override = env::var_os(DATA_DIR_ENV).map(PathBuf::from);
        let path = match env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => data_dir_override
                .clone()
                .unwrap_or_else(|| AppConfig::default().data_dir)
                .join(CONFIG_FILE_NAME),
        };

        let mut config = Self::load(&path);
        if let Some(data_dir) = data_dir_override {
            config.data_dir = data_dir;
        }
        config
    }

    /// Missing or invalid files fall back to defaults.
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log_info!("no config at {}, using defaults", path.display());
                return Self::default();
            }
            Err(err) => {
                log_warn!("failed to read config {}: {err}, using defaults", path.display());
                return Self::default();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                log_warn!("invalid config {}: {err}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DATABASE_FILE_NAME))
    }

    pub fn snapshot_path(&self, name: &str) -> PathBuf {
        self.sources
            .get(name)
            .and_then(|source| source.snapshot_path.clone())
            .unwrap_or_else(|| self.data_dir.join("snapshots").join(format!("{name}.json")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.json"));
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.database_path(), PathBuf::from("data/lifelog.db"));
    }

    #[test]
    fn invalid_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lifelog.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(AppConfig::load(&path), AppConfig::default());
    }

    #[test]
    fn sources_parse_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lifelog.json");
        fs::write(
            &path,
            r#"{
                "dataDir": "/var/lib/lifelog",
                "cache": { "cacheDurationSecs": 0 },
                "sources": {
                    "steam": {
                        "kind": "game",
                        "intervalMins": 5,
                        "baseUrl": "https://collector.example.com/steam",
                        "credentials": { "apiKey": "k" }
                    },
                    "letterboxd": {
                        "kind": "feed",
                        "baseUrl": "https://collector.example.com/letterboxd",
                        "snapshotPath": "/tmp/lb.json",
                        "oldestFirst": true
                    }
                }
            }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path);
        assert!(!config.cache.is_enabled());
        assert_eq!(config.cache.cache_interval_secs, 60);

        let steam = &config.sources["steam"];
        assert_eq!(steam.kind, SourceKind::Game);
        assert_eq!(steam.poll_interval().as_secs(), 300);
        assert_eq!(steam.http_client_config().api_key.as_deref(), Some("k"));

        let letterboxd = &config.sources["letterboxd"];
        assert!(letterboxd.poll_interval().is_zero());
        assert_eq!(letterboxd.native_order(), NativeOrder::OldestFirst);

        assert_eq!(
            config.snapshot_path("steam"),
            PathBuf::from("/var/lib/lifelog/snapshots/steam.json")
        );
        assert_eq!(config.snapshot_path("letterboxd"), PathBuf::from("/tmp/lb.json"));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/lifelog/lifelog.db")
        );
    }
}
