use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Versioned identifier of the cache store. Bumping the version is the
  /// only way to invalidate previously cached entries.
  pub cache_name: String,
  /// Origin the app is served from. Relative offline URLs and the
  /// fallback route resolve against it, and only responses from this
  /// origin are cached at runtime.
  pub base_url: String,
  /// URLs precached at install time, in order. Entries may be
  /// app-relative paths or absolute URLs (e.g. a CDN stylesheet).
  pub offline_urls: Vec<String>,
  /// Page served when a request misses the cache and the network is
  /// unreachable.
  pub fallback_url: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      cache_name: "dcn-family-v1".to_string(),
      base_url: "http://127.0.0.1:5000".to_string(),
      offline_urls: [
        "/",
        "/family",
        "/family_login",
        "/static/manifest.json",
        "https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/css/bootstrap.min.css",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      fallback_url: "/family".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./careworker.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/careworker/config.yaml
  ///
  /// Every field has a default matching the worker shipped with Careapp,
  /// so a missing config file just means defaults.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("careworker.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("careworker").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }
}
