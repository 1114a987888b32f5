use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkTuning {
    pub connect_timeout_secs: u64,
    pub api_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for NetworkTuning {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 12,
            api_timeout_secs: 30,
            user_agent: "Orbus/3.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub default_username: String,
    pub default_game_version: String,
    pub probe_timeout_ms: u64,
    pub liveness_poll_ms: u64,
    pub download_concurrency: usize,
    pub network_tuning: NetworkTuning,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_username: String::new(),
            default_game_version: "1.21.1".to_string(),
            probe_timeout_ms: 3000,
            liveness_poll_ms: 1000,
            download_concurrency: 1,
            network_tuning: NetworkTuning::default(),
        }
    }
}

impl AppConfig {
    /// Missing or unreadable settings fall back to defaults.
    pub fn load(path: &Path) -> Self {
        let Ok(raw) = fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&raw).unwrap_or_else(|error| {
            warn!(path = %path.display(), %error, "settings file unreadable, using defaults");
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(self)
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?;
        fs::write(path, serialized)?;
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms.max(10))
    }
}
