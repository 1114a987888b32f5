//! Modpack installation: registry-format packs (`.mrpack`) and plain zip
//! archives.

pub mod installer;
pub mod manifest;

pub use installer::{
    install_archive, install_from_registry, InstallContext, InstallPhase, PackSource,
};
pub use manifest::{ArchiveManifest, ManifestFile};
