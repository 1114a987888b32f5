use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

use crate::core::error::{CoreError, Result};

pub const MIN_RAM_GIB: u8 = 2;
pub const MAX_RAM_GIB: u8 = 12;
pub const DEFAULT_RAM_GIB: u8 = 4;
pub const LATEST_LOADER_VERSION: &str = "latest";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoaderKind {
    #[default]
    Vanilla,
    Fabric,
    Quilt,
}

impl LoaderKind {
    pub fn slug(self) -> &'static str {
        match self {
            LoaderKind::Vanilla => "vanilla",
            LoaderKind::Fabric => "fabric",
            LoaderKind::Quilt => "quilt",
        }
    }
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoaderKind::Vanilla => "Vanilla",
            LoaderKind::Fabric => "Fabric",
            LoaderKind::Quilt => "Quilt",
        };
        f.write_str(label)
    }
}

/// One named instance. The name is the registry key and is not repeated
/// inside the serialized value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceRecord {
    #[serde(skip)]
    pub name: String,
    pub username: String,
    pub version: String,
    pub loader: LoaderKind,
    pub loader_version: String,
    #[serde(rename = "ram", deserialize_with = "deserialize_ram")]
    ram_gib: u8,
    pub java_path: String,
    #[serde(rename = "icon")]
    pub icon_path: Option<PathBuf>,
}

impl Default for InstanceRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            username: String::new(),
            version: String::new(),
            loader: LoaderKind::Vanilla,
            loader_version: LATEST_LOADER_VERSION.to_string(),
            ram_gib: DEFAULT_RAM_GIB,
            java_path: String::new(),
            icon_path: None,
        }
    }
}

impl InstanceRecord {
    pub fn new(name: &str, username: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            username: username.to_string(),
            version: version.to_string(),
            ..Self::default()
        }
    }

    pub fn ram_gib(&self) -> u8 {
        self.ram_gib
    }

    pub fn set_ram_gib(&mut self, requested: i64) {
        self.ram_gib = clamp_ram_gib(requested);
    }

    /// Re-establishes the RAM bound on records read from disk.
    pub(crate) fn normalize(&mut self) {
        self.ram_gib = clamp_ram_gib(i64::from(self.ram_gib));
        if self.loader_version.trim().is_empty() {
            self.loader_version = LATEST_LOADER_VERSION.to_string();
        }
    }

    pub(crate) fn apply(&mut self, edit: InstanceEdit) {
        if let Some(username) = edit.username {
            self.username = username;
        }
        if let Some(version) = edit.version {
            self.version = version;
        }
        if let Some(loader) = edit.loader {
            self.loader = loader;
        }
        if let Some(loader_version) = edit.loader_version {
            self.loader_version = if loader_version.trim().is_empty() {
                LATEST_LOADER_VERSION.to_string()
            } else {
                loader_version
            };
        }
        if let Some(ram) = edit.ram_gib {
            self.set_ram_gib(ram);
        }
        if let Some(java_path) = edit.java_path {
            self.java_path = java_path.trim().to_string();
        }
    }
}

/// Settings edit coming from a front end. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct InstanceEdit {
    pub username: Option<String>,
    pub version: Option<String>,
    pub loader: Option<LoaderKind>,
    pub loader_version: Option<String>,
    pub ram_gib: Option<i64>,
    pub java_path: Option<String>,
}

pub fn clamp_ram_gib(requested: i64) -> u8 {
    requested.clamp(i64::from(MIN_RAM_GIB), i64::from(MAX_RAM_GIB)) as u8
}

fn deserialize_ram<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let requested = i64::deserialize(deserializer)?;
    Ok(clamp_ram_gib(requested))
}

/// Names double as directory names under the instances root.
pub fn validate_instance_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    let invalid = trimmed.is_empty()
        || trimmed != name
        || name == "."
        || name == ".."
        || name
            .chars()
            .any(|c| matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control());
    if invalid {
        return Err(CoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Turns arbitrary text (manifest names, archive file stems) into a usable
/// instance name, falling back to `fallback` when nothing survives.
pub fn sanitize_instance_name(raw: &str, fallback: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned.to_string()
    }
}
