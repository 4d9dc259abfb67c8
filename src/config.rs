use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

const SETTINGS_ENV: &str = "PIXVIEW_SETTINGS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_base_url: String,
    pub local_api_url: Option<String>,
    pub user_agent: String,
    pub image_host_rewrites: Vec<HostRewrite>,
    /// Max IDs sent in one batch request. Larger batches are split.
    pub batch_size: usize,
    /// Page size used when slicing a pre-fetched result set into pages.
    pub prefetched_page_size: usize,
    pub backoff: BackoffSettings,
    pub extra_data_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRewrite {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_ms: u64,
    pub exponent: f64,
    pub max_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            api_base_url: "https://www.pixiv.net".to_string(),
            local_api_url: None,
            user_agent: "pixview/0.1.0".to_string(),
            image_host_rewrites: vec![HostRewrite {
                from: "i.pximg.net".to_string(),
                to: "i-cf.pximg.net".to_string(),
            }],
            batch_size: 100,
            prefetched_page_size: 48,
            backoff: BackoffSettings::default(),
            extra_data_path: None,
        }
    }
}

impl Default for BackoffSettings {
    fn default() -> Self {
        BackoffSettings {
            initial_ms: 1000,
            exponent: 1.5,
            max_ms: 30_000,
            cooldown_ms: 60_000,
        }
    }
}

impl BackoffSettings {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

fn get_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pixview")
}

pub fn settings_path() -> PathBuf {
    match std::env::var_os(SETTINGS_ENV) {
        Some(path) => PathBuf::from(path),
        None => get_config_dir().join("settings.json"),
    }
}

pub fn default_extra_data_path() -> PathBuf {
    get_config_dir().join("extra_data.json")
}

impl Settings {
    /// Load settings from the default location. A missing file gives the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(settings_path())
    }

    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("No settings at {}, using defaults", path.display());
            return Ok(Settings::default());
        }

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn extra_data_path(&self) -> PathBuf {
        self.extra_data_path
            .clone()
            .unwrap_or_else(default_extra_data_path)
    }
}
