//! Configuration for the heartbeat tracker.
//!
//! [`TrackerConfig`] deserializes from a kebab-case table so the editor's own
//! configuration loader can embed it directly. The standalone binary reads the
//! same table from a TOML file and then overlays environment variables.
//!
//! # Options
//!
//! | Key | Environment variable | Default | Description |
//! |-----|----------------------|---------|-------------|
//! | `enabled` | `WAKATRACK_ENABLED` | `false` | Feature on/off |
//! | `api-key` | `WAKATRACK_API_KEY`, `WAKATIME_API_KEY` | - | Credential for requests |
//! | `api-url` | `WAKATRACK_API_URL` | WakaTime heartbeats endpoint | Destination URL |
//! | `project` | `WAKATRACK_PROJECT` | - | Overrides project detection |
//! | `hide-file-names` | `WAKATRACK_HIDE_FILE_NAMES` | `false` | Send `HIDDEN` instead of paths |
//! | `hide-project-names` | `WAKATRACK_HIDE_PROJECT_NAMES` | `false` | Omit project names |
//! | `timeout` | `WAKATRACK_TIMEOUT` | 30 | Per-request timeout (seconds) |
//! | `debounce-secs` | `WAKATRACK_DEBOUNCE_SECS` | 120 | Minimum gap between non-write heartbeats |
//! | `buffer-size` | `WAKATRACK_BUFFER_SIZE` | 1000 | Pending heartbeat capacity |
//! | `max-attempts` | `WAKATRACK_MAX_ATTEMPTS` | 5 | Delivery attempts before dropping |
//! | `shutdown-grace-secs` | `WAKATRACK_SHUTDOWN_GRACE_SECS` | 5 | Final flush budget |
//!
//! # Example
//!
//! ```
//! use wakatrack::config::TrackerConfig;
//!
//! let config = TrackerConfig::from_toml_str(
//!     r#"
//!     enabled = true
//!     api-key = "waka_123"
//!     hide-file-names = true
//!     "#,
//! )
//! .unwrap();
//!
//! assert!(config.enabled);
//! assert!(config.validate().is_ok());
//! ```

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use crate::utils::debounce::DEFAULT_DEBOUNCE_SECS;

/// Default heartbeat endpoint.
pub const DEFAULT_API_URL: &str = "https://api.wakatime.com/api/v1/users/current/heartbeats";

/// Default per-request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default pending heartbeat capacity.
const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Default number of delivery attempts per heartbeat.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default budget for the final flush on shutdown.
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Configuration file name inside the platform config directory.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors that can occur while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Tracking is switched off.
    #[error("heartbeat tracking is disabled")]
    Disabled,

    /// Tracking is enabled but no API key was provided.
    #[error("missing API key: set `api-key` or WAKATRACK_API_KEY")]
    MissingApiKey,

    /// An option has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// API credential, wiped from memory on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(Zeroizing<String>);

impl ApiKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(Zeroizing::new(key.into()))
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// Returns the key with everything but the last four characters masked.
    #[must_use]
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let visible = chars.len().saturating_sub(4);
        let tail: String = chars[visible..].iter().collect();
        format!("{}{tail}", "*".repeat(visible))
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

impl<'de> Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Heartbeat tracking configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TrackerConfig {
    pub enabled: bool,

    pub api_key: Option<ApiKey>,

    pub api_url: String,

    /// Static project name that replaces detection when set.
    pub project: Option<String>,

    pub hide_file_names: bool,

    pub hide_project_names: bool,

    /// Per-request timeout in seconds.
    pub timeout: u64,

    /// Minimum seconds between non-write heartbeats for the same file.
    pub debounce_secs: u64,

    pub buffer_size: usize,

    pub max_attempts: u32,

    pub shutdown_grace_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            project: None,
            hide_file_names: false,
            hide_project_names: false,
            timeout: DEFAULT_TIMEOUT_SECS,
            debounce_secs: DEFAULT_DEBOUNCE_SECS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

impl TrackerConfig {
    /// Parses a configuration table from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the text is not valid TOML or an
    /// option has the wrong type.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads configuration from a file (if any) and overlays the environment.
    ///
    /// An explicit `path` must exist. Without one, the platform default
    /// location is used when present and skipped otherwise.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or parsed, or an
    /// environment variable holds an invalid value.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|p| p.is_file()),
        };

        let config = match file {
            Some(path) => {
                debug!(path = %path.display(), "Reading configuration file");
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Io { path, source })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };

        config.apply_env()
    }

    /// Overlays `WAKATRACK_*` environment variables onto this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable cannot be parsed.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(enabled) = env_bool("WAKATRACK_ENABLED")? {
            self.enabled = enabled;
        }

        if let Ok(key) = env::var("WAKATRACK_API_KEY").or_else(|_| env::var("WAKATIME_API_KEY")) {
            self.api_key = Some(ApiKey::new(key));
        }

        if let Ok(url) = env::var("WAKATRACK_API_URL") {
            self.api_url = url;
        }

        if let Ok(project) = env::var("WAKATRACK_PROJECT") {
            self.project = Some(project);
        }

        if let Some(hide) = env_bool("WAKATRACK_HIDE_FILE_NAMES")? {
            self.hide_file_names = hide;
        }

        if let Some(hide) = env_bool("WAKATRACK_HIDE_PROJECT_NAMES")? {
            self.hide_project_names = hide;
        }

        if let Some(timeout) = env_number("WAKATRACK_TIMEOUT")? {
            self.timeout = timeout;
        }

        if let Some(secs) = env_number("WAKATRACK_DEBOUNCE_SECS")? {
            self.debounce_secs = secs;
        }

        if let Some(size) = env_number("WAKATRACK_BUFFER_SIZE")? {
            self.buffer_size = size;
        }

        if let Some(attempts) = env_number("WAKATRACK_MAX_ATTEMPTS")? {
            self.max_attempts = attempts;
        }

        if let Some(secs) = env_number("WAKATRACK_SHUTDOWN_GRACE_SECS")? {
            self.shutdown_grace_secs = secs;
        }

        Ok(self)
    }

    /// Checks that the configuration can start tracking.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - tracking is disabled
    /// - no (non-blank) API key is set
    /// - the URL is empty, or timeout, buffer size or attempt limit is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Err(ConfigError::Disabled);
        }

        match &self.api_key {
            Some(key) if !key.expose().trim().is_empty() => {}
            _ => return Err(ConfigError::MissingApiKey),
        }

        if self.api_url.trim().is_empty() {
            return Err(invalid("api-url", "URL cannot be empty"));
        }
        if self.timeout == 0 {
            return Err(invalid("timeout", "timeout must be at least 1 second"));
        }
        if self.buffer_size == 0 {
            return Err(invalid("buffer-size", "buffer size must be greater than 0"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max-attempts", "at least one attempt is required"));
        }

        Ok(())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    #[must_use]
    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Platform location of the configuration file
/// (e.g. `~/.config/wakatrack/config.toml` on Linux).
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "wakatrack").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    let Ok(val) = env::var(key) else {
        return Ok(None);
    };

    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{val}'"),
        }),
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    let Ok(val) = env::var(key) else {
        return Ok(None);
    };

    val.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected non-negative integer, got '{val}'"),
        })
}
