use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::Result;

pub(crate) const INSTANCES_DIR_NAME: &str = "orbus_instances";
pub(crate) const REGISTRY_FILE_NAME: &str = "orbus_config.json";
pub(crate) const SETTINGS_FILE_NAME: &str = "orbus_settings.json";
pub(crate) const ROOT_ENV_VAR: &str = "ORBUS_MINECRAFT_DIR";

/// On-disk layout shared by the store, the installer and the launcher.
#[derive(Debug, Clone)]
pub struct LauncherLayout {
    pub root: PathBuf,
    pub instances: PathBuf,
    pub registry_file: PathBuf,
    pub settings_file: PathBuf,
}

impl LauncherLayout {
    pub fn from_root(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            instances: root.join(INSTANCES_DIR_NAME),
            registry_file: root.join(REGISTRY_FILE_NAME),
            settings_file: root.join(SETTINGS_FILE_NAME),
        }
    }

    /// `ORBUS_MINECRAFT_DIR` wins over the platform default game directory.
    pub fn from_env() -> Self {
        let root = std::env::var_os(ROOT_ENV_VAR)
            .map(PathBuf::from)
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or_else(default_game_root);
        Self::from_root(&root)
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(&self.instances)?;
        Ok(())
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.instances.join(name)
    }
}

fn default_game_root() -> PathBuf {
    if cfg!(target_os = "windows") {
        if let Some(roaming) = dirs::config_dir() {
            return roaming.join(".minecraft");
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".minecraft")
}
