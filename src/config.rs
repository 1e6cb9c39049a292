use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Prefix for relative resource endpoints
  pub base_url: String,
  /// Per-request HTTP timeout; no timeout when unset
  pub timeout_secs: Option<u64>,
  pub resources: BTreeMap<String, ResourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
  /// Endpoint template, e.g. `/categories/:category_id/posts`
  pub endpoint: String,
  #[serde(default = "default_id_field")]
  pub id_field: String,
  /// Envelope field holding the items of a paginated list
  #[serde(default = "default_data_field")]
  pub data_field: String,
}

fn default_id_field() -> String {
  "id".to_string()
}

fn default_data_field() -> String {
  "data".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rescache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rescache/config.yaml
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
        "No configuration file found. Create one at ~/.config/rescache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("rescache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rescache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;

    if config.resources.is_empty() {
      return Err(eyre!("No resources configured"));
    }

    Ok(config)
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_secs.map(Duration::from_secs)
  }

  /// Get the API token from the environment, if set.
  ///
  /// Checks RESCACHE_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("RESCACHE_TOKEN")
      .ok()
      .filter(|token| !token.is_empty())
  }
}
