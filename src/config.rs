use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  pub backend: BackendConfig,
  pub cache: CacheConfig,
  pub routes: RoutesConfig,
  pub sync: SyncConfig,
  /// SQLite database location (defaults to $XDG_DATA_HOME/visto-offline/offline.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  pub url: String,
  /// Token embedded in the page; overrides the csrf-token endpoint
  pub csrf_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Cache generation. Bumping it invalidates every previously cached response.
  pub name: String,
  pub offline_url: String,
  pub essential_resources: Vec<String>,
  /// Point-of-sale resources, precached best-effort
  pub pdv_resources: Vec<String>,
  pub offline_data_ttl_hours: i64,
  pub skip_waiting_on_install: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  pub api: Vec<String>,
  pub static_prefixes: Vec<String>,
  pub static_extensions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub ping_interval_secs: u64,
  /// Upper bound on replay attempts per offline sale; unlimited when unset
  pub max_attempts: Option<u32>,
  pub sales_endpoint: String,
  pub catalog_endpoint: String,
  pub reference_endpoints: Vec<String>,
  pub csrf_endpoint: String,
  pub ping_endpoint: String,
}

fn strings(items: &[&str]) -> Vec<String> {
  items.iter().map(|s| s.to_string()).collect()
}

impl Default for Config {
  fn default() -> Self {
    Self {
      backend: BackendConfig::default(),
      cache: CacheConfig::default(),
      routes: RoutesConfig::default(),
      sync: SyncConfig::default(),
      database: None,
    }
  }
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:8000/".to_string(),
      csrf_token: None,
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      name: "visto-gest-v1.2.0".to_string(),
      offline_url: "/offline/".to_string(),
      essential_resources: strings(&[
        "/",
        "/dashboard/",
        "/static/css/dashboard.css",
        "/static/js/dashboard.js",
        "/static/js/pdv-avancado.js",
        "/offline/",
      ]),
      pdv_resources: strings(&[
        "/pdv/",
        "/static/js/pdv-offline.js",
        "/ajax/produtos/search/",
        "/ajax/formas-pagamento/",
      ]),
      offline_data_ttl_hours: 24,
      skip_waiting_on_install: true,
    }
  }
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      api: strings(&[
        "/ajax/produtos/search/",
        "/ajax/vendas/nova/",
        "/ajax/dashboard/",
        "/relatorios/vendas/dados/",
      ]),
      static_prefixes: strings(&["/static/", "/media/"]),
      static_extensions: strings(&[".css", ".js", ".png", ".jpg", ".svg"]),
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      ping_interval_secs: 30,
      max_attempts: None,
      sales_endpoint: "/ajax/vendas/sync-offline/".to_string(),
      catalog_endpoint: "/ajax/produtos/cache-offline/".to_string(),
      reference_endpoints: strings(&["/ajax/formas-pagamento/", "/ajax/clientes/"]),
      csrf_endpoint: "/ajax/csrf-token/".to_string(),
      ping_endpoint: "/ajax/ping/".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./visto-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/visto-offline/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
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
        tracing::debug!("No configuration file found, using defaults");
        Self::default()
      }
    };

    if let Some(token) = Self::get_csrf_token() {
      config.backend.csrf_token = Some(token);
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("visto-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("visto-offline").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.base_url()?;
    if self.cache.name.trim().is_empty() {
      return Err(eyre!("cache.name must not be empty"));
    }
    if self.cache.offline_data_ttl_hours <= 0 {
      return Err(eyre!("cache.offline_data_ttl_hours must be positive"));
    }
    self.offline_data_ttl()?;
    Ok(())
  }

  /// Page-embedded CSRF token, supplied through VISTO_CSRF_TOKEN.
  fn get_csrf_token() -> Option<String> {
    std::env::var("VISTO_CSRF_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }

  pub fn base_url(&self) -> Result<Url> {
    Url::parse(&self.backend.url)
      .map_err(|e| eyre!("Invalid backend url '{}': {}", self.backend.url, e))
  }

  /// Resolve a backend path (or absolute URL) against the backend base url.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .base_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid url '{}': {}", path, e))
  }

  pub fn offline_data_ttl(&self) -> Result<Duration> {
    Duration::try_hours(self.cache.offline_data_ttl_hours).ok_or_else(|| {
      eyre!(
        "cache.offline_data_ttl_hours is out of range: {}",
        self.cache.offline_data_ttl_hours
      )
    })
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("visto-offline").join("offline.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_match_worker_constants() {
    let config = Config::default();
    assert_eq!(config.cache.name, "visto-gest-v1.2.0");
    assert_eq!(config.cache.offline_data_ttl_hours, 24);
    assert_eq!(config.sync.ping_interval_secs, 30);
    assert!(config.sync.max_attempts.is_none());
    assert!(config.cache.essential_resources.contains(&"/offline/".to_string()));
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
backend:
  url: https://pos.example.com/
cache:
  name: visto-gest-v2
sync:
  max_attempts: 5
"#,
    )
    .unwrap();

    assert_eq!(config.backend.url, "https://pos.example.com/");
    assert_eq!(config.cache.name, "visto-gest-v2");
    assert_eq!(config.cache.offline_url, "/offline/");
    assert_eq!(config.sync.max_attempts, Some(5));
    assert_eq!(config.routes.static_prefixes, vec!["/static/", "/media/"]);
  }

  #[test]
  fn test_resolve_joins_paths() {
    let config = Config::default();
    let url = config.resolve("/ajax/ping/").unwrap();
    assert_eq!(url.as_str(), "http://localhost:8000/ajax/ping/");

    let absolute = config.resolve("https://cdn.example.com/a.js").unwrap();
    assert_eq!(absolute.as_str(), "https://cdn.example.com/a.js");
  }

  #[test]
  fn test_out_of_range_ttl_is_rejected() {
    let config = Config::from_yaml("cache:\n  offline_data_ttl_hours: 9000000000000000\n").unwrap();
    assert!(config.offline_data_ttl().is_err());
    assert!(config.validate().is_err());

    assert_eq!(Config::default().offline_data_ttl().unwrap(), Duration::hours(24));
  }

  #[test]
  fn test_validate_rejects_bad_url() {
    let mut config = Config::default();
    config.backend.url = "not a url".to_string();
    assert!(config.validate().is_err());
  }
}
