use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheSettings,
  #[serde(default)]
  pub sound: SoundConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// REST base URL, e.g. "https://farm.example.com/api"
  pub base_url: String,
  /// Push channel URL (defaults to `ws(s)://<host>/ws`)
  pub realtime_url: Option<String>,
  /// Id of the signed-in user; decides which chat messages are inbound
  pub user_id: Option<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8000/api".to_string(),
      realtime_url: None,
      user_id: None,
      timeout_secs: default_timeout_secs(),
    }
  }
}

impl ApiConfig {
  /// The push channel URL: explicit, or derived from the base URL's host.
  pub fn realtime_url(&self) -> Result<String> {
    if let Some(url) = &self.realtime_url {
      return Ok(url.clone());
    }

    let mut url = Url::parse(&self.base_url)
      .map_err(|e| eyre!("Invalid API base URL {}: {}", self.base_url, e))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url
      .set_scheme(scheme)
      .map_err(|_| eyre!("Cannot derive realtime URL from {}", self.base_url))?;
    url.set_path("/ws");
    url.set_query(None);
    Ok(url.to_string())
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
  /// SQLite file under the data directory (or `cache.path`)
  #[default]
  Sqlite,
  /// Process memory only
  Memory,
  /// No snapshots
  None,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSettings {
  #[serde(default)]
  pub storage: StorageKind,
  /// Custom SQLite path
  pub path: Option<PathBuf>,
  /// Per-cache staleness overrides in seconds, keyed by cache name
  /// ("alerts", "tasks", "messages", ...)
  #[serde(default)]
  pub stale_after_secs: HashMap<String, u64>,
}

impl CacheSettings {
  pub fn stale_after(&self, name: &str, default: chrono::Duration) -> chrono::Duration {
    self
      .stale_after_secs
      .get(name)
      .map(|secs| chrono::Duration::seconds(*secs as i64))
      .unwrap_or(default)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SoundConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Minimum gap between two cues
  #[serde(default = "default_min_interval_ms")]
  pub min_interval_ms: u64,
}

fn default_true() -> bool {
  true
}

fn default_min_interval_ms() -> u64 {
  1500
}

impl Default for SoundConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      min_interval_ms: default_min_interval_ms(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pondwatch.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pondwatch/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/pondwatch/config.yaml\n\
                 See pondwatch.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("pondwatch.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pondwatch").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the API token from environment variables.
  ///
  /// Checks PONDWATCH_API_TOKEN first, then FARM_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("PONDWATCH_API_TOKEN")
      .or_else(|_| std::env::var("FARM_API_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set PONDWATCH_API_TOKEN or FARM_API_TOKEN environment variable.")
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("api:\n  base_url: https://farm.example.com/api\n").unwrap();

    assert_eq!(config.api.timeout_secs, 30);
    assert_eq!(config.cache.storage, StorageKind::Sqlite);
    assert!(config.sound.enabled);
    assert_eq!(config.sound.min_interval_ms, 1500);
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
api:
  base_url: http://10.0.0.5:8000/api
  realtime_url: ws://10.0.0.5:8001/socket
  user_id: "42"
  timeout_secs: 10
cache:
  storage: memory
  stale_after_secs:
    alerts: 30
sound:
  enabled: false
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.api.user_id.as_deref(), Some("42"));
    assert_eq!(config.api.realtime_url().unwrap(), "ws://10.0.0.5:8001/socket");
    assert_eq!(config.cache.storage, StorageKind::Memory);
    assert_eq!(
      config.cache.stale_after("alerts", chrono::Duration::minutes(2)),
      chrono::Duration::seconds(30)
    );
    assert_eq!(
      config.cache.stale_after("tasks", chrono::Duration::minutes(3)),
      chrono::Duration::minutes(3)
    );
    assert!(!config.sound.enabled);
  }

  #[test]
  fn test_realtime_url_is_derived_from_base() {
    let api = ApiConfig {
      base_url: "https://farm.example.com/api/v1?x=1".into(),
      ..ApiConfig::default()
    };
    assert_eq!(api.realtime_url().unwrap(), "wss://farm.example.com/ws");
  }

  #[test]
  fn test_load_reads_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pondwatch.yaml");
    std::fs::write(&path, "api:\n  base_url: http://localhost:9000\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.api.base_url, "http://localhost:9000");

    assert!(Config::load(Some(&dir.path().join("missing.yaml"))).is_err());
  }

  #[test]
  fn test_unknown_storage_kind_is_rejected() {
    assert!(Config::parse("api:\n  base_url: x\ncache:\n  storage: redis\n").is_err());
  }
}
