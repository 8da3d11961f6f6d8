use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    /// Backend peer endpoint. A malformed value disables the channel; it is
    /// never retried (see the channel client).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:28880/ws".to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    2
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    #[serde(default)]
    pub headless: bool,
    /// Explicit browser binary; when unset a per-OS candidate list and PATH
    /// lookup are tried in order.
    #[serde(default)]
    pub binary: Option<String>,
    /// Optional cookies JSON file imported before the first navigation, so a
    /// session can be seeded without interactive login.
    #[serde(default)]
    pub cookies_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshConfig {
    #[serde(default = "default_keepalive_minutes")]
    pub keepalive_minutes: u64,
}

fn default_keepalive_minutes() -> u64 {
    10
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            keepalive_minutes: default_keepalive_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}
