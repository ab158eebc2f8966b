use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub channel: ChannelConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the JoyBor REST API (e.g., "https://joybor.example/api")
  pub url: String,
  /// Path overrides per cache key, relative to `url`
  #[serde(default)]
  pub endpoints: BTreeMap<String, String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Age after which cached data is refetched on read
  #[serde(default = "default_stale_secs")]
  pub stale_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_secs: default_stale_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
  /// SQLite file shared by every instance (default: $XDG_DATA_HOME/joybor-sync/channel.db)
  pub path: Option<PathBuf>,
  #[serde(default = "default_slot")]
  pub slot: String,
  #[serde(default = "default_poll_interval_ms")]
  pub poll_interval_ms: u64,
  /// Cross-tab events older than this are dropped
  #[serde(default = "default_freshness_ms")]
  pub freshness_ms: u64,
}

impl Default for ChannelConfig {
  fn default() -> Self {
    Self {
      path: None,
      slot: default_slot(),
      poll_interval_ms: default_poll_interval_ms(),
      freshness_ms: default_freshness_ms(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Filter used when RUST_LOG is not set
  #[serde(default = "default_log_level")]
  pub level: String,
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      dir: None,
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_stale_secs() -> u64 {
  300
}

fn default_slot() -> String {
  "joybor-global-event".to_string()
}

fn default_poll_interval_ms() -> u64 {
  250
}

fn default_freshness_ms() -> u64 {
  5000
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./joybor-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/joybor-sync/config.yaml
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
        "No configuration file found. Create one at ~/.config/joybor-sync/config.yaml\n\
                 See joybor-sync.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("joybor-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("joybor-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the API token from environment variables.
  ///
  /// Checks JOYBOR_API_TOKEN first, then JOYBOR_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("JOYBOR_API_TOKEN")
      .or_else(|_| std::env::var("JOYBOR_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set JOYBOR_API_TOKEN or JOYBOR_TOKEN environment variable.")
      })
  }

  pub fn channel_path(&self) -> Result<PathBuf> {
    match &self.channel.path {
      Some(p) => Ok(p.clone()),
      None => Ok(data_dir()?.join("channel.db")),
    }
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    match &self.log.dir {
      Some(p) => Ok(p.clone()),
      None => data_dir(),
    }
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.channel.poll_interval_ms.max(1))
  }

  pub fn freshness(&self) -> Duration {
    Duration::from_millis(self.channel.freshness_ms)
  }

  pub fn stale_time(&self) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(self.cache.stale_secs).unwrap_or(i64::MAX / 1000))
  }
}

fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("joybor-sync"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("api:\n  url: https://joybor.example/api\n").unwrap();

    assert_eq!(config.api.url, "https://joybor.example/api");
    assert!(config.api.endpoints.is_empty());
    assert_eq!(config.timeout(), Duration::from_secs(30));
    assert_eq!(config.stale_time(), chrono::Duration::minutes(5));
    assert_eq!(config.channel.slot, "joybor-global-event");
    assert_eq!(config.freshness(), Duration::from_millis(5000));
    assert_eq!(config.log.level, "info");
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
api:
  url: http://localhost:8000/api
  timeout_secs: 5
  endpoints:
    monthlyRevenue: admin/monthly-revenue/
cache:
  stale_secs: 60
channel:
  path: /tmp/joybor/channel.db
  slot: dorm-a
  poll_interval_ms: 100
  freshness_ms: 2000
log:
  level: debug
  dir: /tmp/joybor/logs
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(
      config.api.endpoints.get("monthlyRevenue").map(String::as_str),
      Some("admin/monthly-revenue/")
    );
    assert_eq!(config.stale_time(), chrono::Duration::seconds(60));
    assert_eq!(config.channel_path().unwrap(), PathBuf::from("/tmp/joybor/channel.db"));
    assert_eq!(config.poll_interval(), Duration::from_millis(100));
    assert_eq!(config.channel.slot, "dorm-a");
    assert_eq!(config.log_dir().unwrap(), PathBuf::from("/tmp/joybor/logs"));
  }

  #[test]
  fn test_missing_api_section_is_error() {
    assert!(Config::parse("cache:\n  stale_secs: 10\n").is_err());
  }

  #[test]
  fn test_explicit_path_must_exist() {
    let err = Config::load(Some(Path::new("/nonexistent/joybor-sync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "api:\n  url: http://localhost/api\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.api.url, "http://localhost/api");
  }
}
