//! Layered configuration.
//!
//! Values are merged in increasing priority: built-in defaults, the TOML
//! config file, then `PREFETCH_*` environment variables. The binary applies
//! its command-line overrides on top and calls [`PrefetchConfig::validate`].
//!
//! The default file lives at `$XDG_CONFIG_HOME/prefetch/config.toml`, or
//! `$HOME/.config/prefetch/config.toml` when `XDG_CONFIG_HOME` is unset.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::dispatcher::DispatcherSettings;
use crate::store::{DEFAULT_DAILY_QUOTA_BYTES, OpenBackoff, StoreOptions};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PREFETCH_";

const CONFIG_DIR_NAME: &str = "prefetch";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested config file does not exist.
    #[error("config file not found: {path}")]
    MissingFile {
        /// Requested path.
        path: PathBuf,
    },

    /// A source could not be parsed or has the wrong shape.
    #[error("invalid configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// A value is outside its allowed range.
    #[error("invalid value for `{key}`: {message}")]
    Invalid {
        /// Offending key.
        key: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        Self::Load(Box::new(error))
    }
}

/// Every tunable of the pipeline, the store and the HTTP collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub database_path: PathBuf,
    pub archives_dir: PathBuf,
    pub pages_dir: PathBuf,
    pub service_url: String,
    /// Defaults to `{service_url}/v1/media`.
    pub download_base_url: Option<String>,
    pub push_token: Option<String>,
    pub max_urls_per_bundle: usize,
    pub max_concurrent_downloads: usize,
    pub daily_quota_bytes: i64,
    pub maintenance_interval_secs: u64,
    pub suspend_secs: u64,
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub store_open_attempts: u32,
    pub store_busy_timeout_ms: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("prefetch.db"),
            archives_dir: PathBuf::from("archives"),
            pages_dir: PathBuf::from("pages"),
            service_url: "https://offlinepages.example.com".to_string(),
            download_base_url: None,
            push_token: None,
            max_urls_per_bundle: 20,
            max_concurrent_downloads: 2,
            daily_quota_bytes: DEFAULT_DAILY_QUOTA_BYTES,
            maintenance_interval_secs: 900,
            suspend_secs: 86_400,
            request_timeout_secs: 30,
            download_timeout_secs: 300,
            store_open_attempts: 3,
            store_busy_timeout_ms: 5_000,
        }
    }
}

impl PrefetchConfig {
    /// Loads defaults, then `file` (or the default file when it exists),
    /// then the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingFile`] when `file` is given but absent,
    /// and [`ConfigError::Load`] when a source cannot be parsed.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match file {
            Some(path) if !path.exists() => {
                return Err(ConfigError::MissingFile {
                    path: path.to_path_buf(),
                });
            }
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|path| path.exists()),
        };

        let mut figment = Self::defaults();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    /// Figment holding only the built-in defaults.
    #[must_use]
    pub fn defaults() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
    }

    /// Extracts a config from an assembled figment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] when the figment has the wrong shape.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        Ok(figment.extract()?)
    }

    /// Checks every bounded value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("max_urls_per_bundle", self.max_urls_per_bundle, 1, 100)?;
        check_range("max_concurrent_downloads", self.max_concurrent_downloads, 1, 10)?;
        check_range("maintenance_interval_secs", self.maintenance_interval_secs, 60, 86_400)?;
        check_range("request_timeout_secs", self.request_timeout_secs, 1, 3_600)?;
        check_range("download_timeout_secs", self.download_timeout_secs, 1, 3_600)?;
        check_range("store_open_attempts", self.store_open_attempts, 1, 10)?;
        check_range("store_busy_timeout_ms", self.store_busy_timeout_ms, 0, 120_000)?;
        if self.daily_quota_bytes < 0 {
            return Err(ConfigError::Invalid {
                key: "daily_quota_bytes",
                message: "must not be negative".to_string(),
            });
        }
        if self.suspend_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "suspend_secs",
                message: "must be positive".to_string(),
            });
        }
        check_http_url("service_url", &self.service_url)?;
        if let Some(base) = &self.download_base_url {
            check_http_url("download_base_url", base)?;
        }
        Ok(())
    }

    /// Archive download base URL.
    #[must_use]
    pub fn download_base_url(&self) -> String {
        self.download_base_url
            .clone()
            .unwrap_or_else(|| format!("{}/v1/media", self.service_url.trim_end_matches('/')))
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Options for opening the file-backed store.
    #[must_use]
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions::file(&self.database_path)
            .with_busy_timeout(Duration::from_millis(self.store_busy_timeout_ms))
            .with_open_backoff(OpenBackoff::with_max_attempts(self.store_open_attempts))
    }

    /// Pipeline tunables.
    #[must_use]
    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            max_urls_per_bundle: self.max_urls_per_bundle,
            max_concurrent_downloads: self.max_concurrent_downloads,
            daily_quota_bytes: self.daily_quota_bytes,
            suspend: Duration::from_secs(self.suspend_secs),
            maintenance_interval: Duration::from_secs(self.maintenance_interval_secs),
            archives_dir: self.archives_dir.clone(),
        }
    }
}

fn check_range<T>(key: &'static str, value: T, min: T, max: T) -> Result<(), ConfigError>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(ConfigError::Invalid {
            key,
            message: format!("{value} is outside {min}..={max}"),
        });
    }
    Ok(())
}

fn check_http_url(key: &'static str, value: &str) -> Result<(), ConfigError> {
    let parsed = Url::parse(value).map_err(|e| ConfigError::Invalid {
        key,
        message: format!("{value}: {e}"),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid {
            key,
            message: format!("{value}: scheme must be http or https"),
        });
    }
    Ok(())
}

/// Default config file location, if a config directory can be determined.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    resolve_config_dir(
        sanitize_env_path(env::var_os("XDG_CONFIG_HOME")),
        sanitize_env_path(env::var_os("HOME")),
    )
    .map(|dir| dir.join(CONFIG_FILE_NAME))
}

fn sanitize_env_path(value: Option<OsString>) -> Option<PathBuf> {
    let value = value?;
    if value.to_string_lossy().trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(value))
}

fn resolve_config_dir(xdg_config_home: Option<PathBuf>, home: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(xdg) = xdg_config_home {
        return Some(xdg.join(CONFIG_DIR_NAME));
    }
    home.map(|home| home.join(".config").join(CONFIG_DIR_NAME))
}
