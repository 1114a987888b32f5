use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::core::error::{CoreError, Result};
use crate::core::instance::{sanitize_instance_name, LoaderKind};

pub const MANIFEST_ENTRY: &str = "modrinth.index.json";
pub const OVERRIDES_PREFIX: &str = "overrides";

const GAME_DEPENDENCY: &str = "minecraft";
const FABRIC_DEPENDENCY: &str = "fabric-loader";
const QUILT_DEPENDENCY: &str = "quilt-loader";
const FALLBACK_PACK_NAME: &str = "Pack";

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    dependencies: Option<BTreeMap<String, String>>,
    #[serde(default)]
    files: Vec<RawManifestFile>,
}

#[derive(Debug, Deserialize)]
struct RawManifestFile {
    path: String,
    #[serde(default)]
    downloads: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    pub relative_path: PathBuf,
    pub download_url: String,
}

/// Parsed registry-pack manifest. Lives only for the duration of an install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveManifest {
    pub display_name: String,
    pub game_version: String,
    pub loader_kind: LoaderKind,
    /// Loader version the pack was built against, when it declares one.
    pub declared_loader_version: Option<String>,
    pub files: Vec<ManifestFile>,
}

impl ArchiveManifest {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let manifest: RawManifest = serde_json::from_slice(raw)
            .map_err(|error| CoreError::CorruptArchive(format!("{MANIFEST_ENTRY}: {error}")))?;

        let dependencies = manifest.dependencies.unwrap_or_default();
        let game_version = dependencies
            .get(GAME_DEPENDENCY)
            .map(|version| version.trim().to_string())
            .filter(|version| !version.is_empty())
            .ok_or_else(|| {
                CoreError::CorruptArchive(format!(
                    "{MANIFEST_ENTRY} does not declare a {GAME_DEPENDENCY} version"
                ))
            })?;

        let (loader_kind, declared_loader_version) = detect_loader(&dependencies);

        let files = manifest
            .files
            .into_iter()
            .map(|file| {
                let relative_path = safe_relative_path(&file.path).ok_or_else(|| {
                    CoreError::CorruptArchive(format!("unsafe file path in manifest: {}", file.path))
                })?;
                let download_url = file
                    .downloads
                    .into_iter()
                    .find(|url| !url.trim().is_empty())
                    .ok_or_else(|| {
                        CoreError::CorruptArchive(format!("no download for {}", file.path))
                    })?;
                Ok(ManifestFile {
                    relative_path,
                    download_url,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            display_name: sanitize_instance_name(&manifest.name, FALLBACK_PACK_NAME),
            game_version,
            loader_kind,
            declared_loader_version,
            files,
        })
    }
}

/// Fabric wins over Quilt when a pack lists both.
fn detect_loader(dependencies: &BTreeMap<String, String>) -> (LoaderKind, Option<String>) {
    if let Some(version) = dependencies.get(FABRIC_DEPENDENCY) {
        (LoaderKind::Fabric, Some(version.clone()))
    } else if let Some(version) = dependencies.get(QUILT_DEPENDENCY) {
        (LoaderKind::Quilt, Some(version.clone()))
    } else {
        (LoaderKind::Vanilla, None)
    }
}

/// Relative path that stays inside the directory it is joined onto.
pub(crate) fn safe_relative_path(raw: &str) -> Option<PathBuf> {
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') {
        return None;
    }
    let mut relative = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            part if part.contains(':') => return None,
            part => relative.push(part),
        }
    }
    (!relative.as_os_str().is_empty()).then_some(relative)
}
