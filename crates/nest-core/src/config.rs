//! Configuration - store connection settings
//!
//! Features:
//! - Config stored in ~/.nurse-nest/config.json
//! - Environment overrides (NEST_STORE_URL, NEST_SERVICE_KEY)
//! - Builds the configured store backend

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::store::{RecordStore, RestStore, SledStore};

pub const ENV_STORE_URL: &str = "NEST_STORE_URL";
pub const ENV_SERVICE_KEY: &str = "NEST_SERVICE_KEY";

/// Store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Hosted database over REST
    #[default]
    Rest,
    /// Local sled snapshot
    Local,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Rest => f.write_str("rest"),
            Backend::Local => f.write_str("local"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rest" | "remote" => Ok(Backend::Rest),
            "local" | "sled" => Ok(Backend::Local),
            other => Err(format!("unknown backend '{}' (expected rest or local)", other)),
        }
    }
}

/// Nurse Nest configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NestConfig {
    #[serde(default)]
    pub store: StoreConfig,
}

/// Record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub service_key: String,
    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Rest,
            url: String::new(),
            service_key: String::new(),
            local_path: default_local_path(),
        }
    }
}

impl StoreConfig {
    /// Copy safe to print (service key masked)
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.service_key.is_empty() {
            let tail: String = copy
                .service_key
                .chars()
                .rev()
                .take(4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            copy.service_key = format!("****{}", tail);
        }
        copy
    }
}

fn nest_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nurse-nest")
}

/// Default local store location (~/.nurse-nest/store)
pub fn default_local_path() -> PathBuf {
    nest_dir().join("store")
}

/// Get config file path (~/.nurse-nest/config.json)
pub fn get_config_path() -> PathBuf {
    nest_dir().join("config.json")
}

/// Load config from the default path, then apply environment overrides
pub fn load_config() -> Result<NestConfig> {
    let mut config = load_config_from(&get_config_path())?;
    apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Load config from `path` (defaults if missing)
pub fn load_config_from(path: &Path) -> Result<NestConfig> {
    if !path.exists() {
        return Ok(NestConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: NestConfig = serde_json::from_str(&content)
        .map_err(|e| anyhow!("Invalid config {}: {}", path.display(), e))?;
    Ok(config)
}

/// Save config to the default path
pub fn save_config(config: &NestConfig) -> Result<()> {
    save_config_to(config, &get_config_path())
}

/// Save config to `path`
pub fn save_config_to(config: &NestConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;

    tracing::info!("Config saved to {:?}", path);
    Ok(())
}

/// Override store credentials from `lookup` (normally the process env)
pub fn apply_overrides(config: &mut NestConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup(ENV_STORE_URL).filter(|v| !v.trim().is_empty()) {
        config.store.url = url;
    }
    if let Some(key) = lookup(ENV_SERVICE_KEY).filter(|v| !v.trim().is_empty()) {
        config.store.service_key = key;
    }
}

/// Build the configured store backend
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn RecordStore>> {
    match config.backend {
        Backend::Rest => {
            if config.url.trim().is_empty() {
                bail!(
                    "Store URL not configured (run `nest config init` or set {})",
                    ENV_STORE_URL
                );
            }
            let store = RestStore::new(&config.url, &config.service_key)?;
            tracing::debug!("Using REST store at {}", config.url);
            Ok(Arc::new(store))
        }
        Backend::Local => {
            let store = SledStore::open(&config.local_path)?;
            tracing::debug!("Using local store at {:?}", config.local_path);
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_path() {
        let path = get_config_path();
        assert!(path.to_string_lossy().contains(".nurse-nest"));
        assert!(path.to_string_lossy().ends_with("config.json"));
    }

    #[test]
    fn test_default_config() {
        let config = NestConfig::default();
        assert_eq!(config.store.backend, Backend::Rest);
        assert!(config.store.url.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = NestConfig {
            store: StoreConfig {
                backend: Backend::Local,
                url: "https://project.example.co".into(),
                service_key: "secret-key".into(),
                local_path: dir.path().join("store"),
            },
        };
        save_config_to(&config, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.store.backend, Backend::Local);
        assert_eq!(loaded.store.url, "https://project.example.co");
        assert_eq!(loaded.store.local_path, dir.path().join("store"));
    }

    #[test]
    fn test_missing_file_and_partial_json() {
        let dir = tempdir().unwrap();
        let missing = load_config_from(&dir.path().join("none.json")).unwrap();
        assert!(missing.store.url.is_empty());

        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"store": {"backend": "local"}}"#).unwrap();
        let partial = load_config_from(&path).unwrap();
        assert_eq!(partial.store.backend, Backend::Local);
        assert_eq!(partial.store.local_path, default_local_path());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = NestConfig::default();
        apply_overrides(&mut config, |key| match key {
            ENV_STORE_URL => Some("https://env.example.co".into()),
            ENV_SERVICE_KEY => Some("  ".into()),
            _ => None,
        });

        assert_eq!(config.store.url, "https://env.example.co");
        assert!(config.store.service_key.is_empty());
    }

    #[test]
    fn test_redacted_masks_key() {
        let config = StoreConfig {
            service_key: "abcdef123456".into(),
            ..Default::default()
        };
        assert_eq!(config.redacted().service_key, "****3456");
    }

    #[test]
    fn test_open_store() {
        assert!(open_store(&StoreConfig::default()).is_err());

        let dir = tempdir().unwrap();
        let local = StoreConfig {
            backend: Backend::Local,
            local_path: dir.path().join("store"),
            ..Default::default()
        };
        assert_eq!(open_store(&local).unwrap().name(), "local");

        let rest = StoreConfig {
            url: "https://project.example.co".into(),
            service_key: "key".into(),
            ..Default::default()
        };
        assert_eq!(open_store(&rest).unwrap().name(), "rest");
    }
}
