use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use url::Url;

/// Environment variable that overrides the configured origin.
pub const ORIGIN_ENV: &str = "SWCACHE_ORIGIN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the application is served from; manifest paths resolve against it
  #[serde(default = "default_origin")]
  pub origin: String,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Paths stored at setup, in order
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default = "default_user_agent")]
  pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Bucket name prefix; buckets are named `<prefix>-v<version>`
  #[serde(default = "default_prefix")]
  pub prefix: String,
  /// Bump to rotate the bucket on next cleanup
  #[serde(default = "default_version")]
  pub version: u32,
  /// Page served to navigations while offline
  #[serde(default = "default_navigation_fallback")]
  pub navigation_fallback: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite database path (default: $XDG_DATA_HOME/swcache/cache.db)
  pub path: Option<PathBuf>,
  /// Keep buckets in memory only
  #[serde(default)]
  pub ephemeral: bool,
}

fn default_origin() -> String {
  "http://localhost:8080".to_string()
}

fn default_prefix() -> String {
  "rapunzel".to_string()
}

fn default_version() -> u32 {
  3
}

fn default_navigation_fallback() -> String {
  "/index.html".to_string()
}

fn default_precache() -> Vec<String> {
  [
    "/",
    "/index.html",
    "/v1.html",
    "/manifest.json",
    "/icons/icon-192x192.png",
    "/icons/icon-512x512.png",
    // Legacy icon paths still referenced by old pages
    "/icon-192.png",
    "/icon-512.png",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

fn default_user_agent() -> String {
  format!("swcache/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: default_prefix(),
      version: default_version(),
      navigation_fallback: default_navigation_fallback(),
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: default_origin(),
      cache: CacheConfig::default(),
      precache: default_precache(),
      storage: StorageConfig::default(),
      user_agent: default_user_agent(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
  ///
  /// Built-in defaults apply when no file is found. `SWCACHE_ORIGIN`
  /// overrides the origin either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        info!("No configuration file found, using defaults");
        Self::default()
      }
    };

    if let Ok(origin) = std::env::var(ORIGIN_ENV) {
      config.origin = origin;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Check the settings a worker cannot run without.
  pub fn validate(&self) -> Result<()> {
    self.origin_url()?;

    if self.cache.prefix.is_empty() {
      return Err(eyre!("cache.prefix must not be empty"));
    }
    if !self.cache.navigation_fallback.starts_with('/') {
      return Err(eyre!(
        "cache.navigation_fallback must be an absolute path, got '{}'",
        self.cache.navigation_fallback
      ));
    }
    if let Some(path) = self.precache.iter().find(|p| !p.starts_with('/')) {
      return Err(eyre!("precache entries must be absolute paths, got '{}'", path));
    }

    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    let url =
      Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;

    if url.cannot_be_a_base() {
      return Err(eyre!("Origin '{}' cannot be used as a base URL", self.origin));
    }

    Ok(url)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.origin, "http://localhost:8080");
    assert_eq!(config.cache.prefix, "rapunzel");
    assert_eq!(config.cache.version, 3);
    assert_eq!(config.cache.navigation_fallback, "/index.html");
    assert_eq!(config.precache.len(), 8);
    assert_eq!(config.precache[0], "/");
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_partial_yaml_fills_defaults() {
    let config = Config::from_yaml(
      r#"
origin: https://rapunzel.example
cache:
  version: 4
"#,
    )
    .unwrap();

    assert_eq!(config.origin, "https://rapunzel.example");
    assert_eq!(config.cache.version, 4);
    assert_eq!(config.cache.prefix, "rapunzel");
    assert_eq!(config.precache.len(), 8);
    assert!(!config.storage.ephemeral);
  }

  #[test]
  fn test_full_yaml() {
    let config = Config::from_yaml(
      r#"
origin: http://127.0.0.1:3000
cache:
  prefix: game
  version: 7
  navigation_fallback: /
precache:
  - /
  - /app.js
storage:
  path: /tmp/swcache-test.db
  ephemeral: true
user_agent: test-agent
"#,
    )
    .unwrap();

    assert_eq!(config.cache.prefix, "game");
    assert_eq!(config.precache, vec!["/", "/app.js"]);
    assert_eq!(
      config.storage.path.as_deref(),
      Some(Path::new("/tmp/swcache-test.db"))
    );
    assert!(config.storage.ephemeral);
    assert_eq!(config.user_agent, "test-agent");
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_validate_rejects_bad_values() {
    let mut config = Config::default();
    config.origin = "not a url".to_string();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.origin = "mailto:someone@example.com".to_string();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.precache.push("relative.png".to_string());
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.cache.prefix.clear();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_load_missing_explicit_path_fails() {
    let result = Config::load(Some(Path::new("/definitely/not/here.yaml")));
    assert!(result.is_err());
  }

  #[test]
  fn test_load_explicit_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("swcache.yaml");
    std::fs::write(&path, "cache:\n  prefix: other\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.cache.prefix, "other");
  }
}
