use std::env;
use std::fs;
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::Mutex;
use std::time::Duration;

use directories::BaseDirs;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::livechat::{LiveOrdering, LivechatSettings};

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:54321";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {reason}")]
    Toml { path: PathBuf, reason: String },
    #[error("unable to determine home directory")]
    NoHome,
}

/// Inbox console configuration.
///
/// Layers, lowest first: built-in defaults, the TOML file, `INBOX_*` env vars.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub backend_url: Url,
    pub anon_key: String,
    pub access_token: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub livechat: LivechatSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    backend_url: Option<String>,
    anon_key: Option<String>,
    access_token: Option<String>,
    email: Option<String>,
    password: Option<String>,
    #[serde(default)]
    livechat: FileLivechat,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLivechat {
    window_size: Option<usize>,
    scroll_threshold: Option<f64>,
    scroll_debounce_ms: Option<u64>,
    live_ordering: Option<String>,
}

impl Config {
    /// Defaults overlaid with env vars only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Full layering. An explicit `path` must exist; the default file
    /// under the home directory is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().ok().filter(|p| p.exists()),
        };
        if let Some(path) = file {
            let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            config.apply_toml(&raw, &path)?;
        }
        config.apply_env()?;
        Ok(config)
    }

    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let base = BaseDirs::new().ok_or(ConfigError::NoHome)?;
        Ok(base.home_dir().join(".inbox").join("config.toml"))
    }

    fn apply_toml(&mut self, raw: &str, path: &Path) -> Result<(), ConfigError> {
        let file: FileConfig = toml::from_str(raw).map_err(|err| ConfigError::Toml {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        if let Some(url) = file.backend_url {
            self.backend_url = parse_url("backend_url", &url)?;
        }
        if let Some(key) = file.anon_key {
            self.anon_key = key;
        }
        self.access_token = file.access_token.or(self.access_token.take());
        self.email = file.email.or(self.email.take());
        self.password = file.password.or(self.password.take());

        let chat = file.livechat;
        if let Some(size) = chat.window_size {
            self.livechat.window_size = check_window("livechat.window_size", size)?;
        }
        if let Some(threshold) = chat.scroll_threshold {
            self.livechat.scroll_threshold = check_threshold("livechat.scroll_threshold", threshold)?;
        }
        if let Some(ms) = chat.scroll_debounce_ms {
            self.livechat.scroll_debounce = Duration::from_millis(ms);
        }
        if let Some(ordering) = chat.live_ordering {
            self.livechat.live_ordering = parse_ordering("livechat.live_ordering", &ordering)?;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(url) = var("INBOX_BACKEND_URL") {
            self.backend_url = parse_url("INBOX_BACKEND_URL", &url)?;
        }
        if let Some(key) = var("INBOX_ANON_KEY") {
            self.anon_key = key;
        }
        if let Some(token) = var("INBOX_ACCESS_TOKEN") {
            self.access_token = Some(token);
        }
        if let Some(email) = var("INBOX_EMAIL") {
            self.email = Some(email);
        }
        if let Some(password) = var("INBOX_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(raw) = var("INBOX_WINDOW_SIZE") {
            let size = raw.parse().map_err(|err: std::num::ParseIntError| ConfigError::Invalid {
                key: "INBOX_WINDOW_SIZE",
                reason: err.to_string(),
            })?;
            self.livechat.window_size = check_window("INBOX_WINDOW_SIZE", size)?;
        }
        if let Some(raw) = var("INBOX_SCROLL_THRESHOLD") {
            let threshold =
                raw.parse().map_err(|err: std::num::ParseFloatError| ConfigError::Invalid {
                    key: "INBOX_SCROLL_THRESHOLD",
                    reason: err.to_string(),
                })?;
            self.livechat.scroll_threshold = check_threshold("INBOX_SCROLL_THRESHOLD", threshold)?;
        }
        if let Some(raw) = var("INBOX_SCROLL_DEBOUNCE_MS") {
            let ms: u64 = raw.parse().map_err(|err: std::num::ParseIntError| ConfigError::Invalid {
                key: "INBOX_SCROLL_DEBOUNCE_MS",
                reason: err.to_string(),
            })?;
            self.livechat.scroll_debounce = Duration::from_millis(ms);
        }
        if let Some(raw) = var("INBOX_LIVE_ORDERING") {
            self.livechat.live_ordering = parse_ordering("INBOX_LIVE_ORDERING", &raw)?;
        }
        Ok(())
    }

    pub fn has_credentials(&self) -> bool {
        self.email.is_some() && self.password.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: Url::parse(DEFAULT_BACKEND_URL)
                .unwrap_or_else(|_| unreachable!("default backend url parses")),
            anon_key: String::new(),
            access_token: None,
            email: None,
            password: None,
            livechat: LivechatSettings::default(),
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_url(key: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw.trim()).map_err(|err| ConfigError::Invalid {
        key,
        reason: err.to_string(),
    })
}

fn parse_ordering(key: &'static str, raw: &str) -> Result<LiveOrdering, ConfigError> {
    raw.parse()
        .map_err(|reason| ConfigError::Invalid { key, reason })
}

fn check_window(key: &'static str, size: usize) -> Result<usize, ConfigError> {
    if size == 0 {
        return Err(ConfigError::Invalid {
            key,
            reason: "window must hold at least one message".into(),
        });
    }
    Ok(size)
}

fn check_threshold(key: &'static str, threshold: f64) -> Result<f64, ConfigError> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(ConfigError::Invalid {
            key,
            reason: format!("{threshold} is not a non-negative distance"),
        });
    }
    Ok(threshold)
}
