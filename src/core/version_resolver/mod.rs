use std::path::{Path, PathBuf};

use crate::core::instance::LoaderKind;

/// Options handed to the provider when it assembles a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub username: String,
    pub uuid: String,
    pub access_token: String,
    pub game_directory: PathBuf,
    pub executable_path: PathBuf,
    pub jvm_arguments: Vec<String>,
}

/// External collaborator that owns the game platform's files and command
/// templating. Calls block and are always made from a blocking worker.
pub trait VersionInstallProvider: Send + Sync {
    /// Makes sure the base files for `version` exist under `root`.
    /// `progress` receives free-form status text.
    fn ensure_version_installed(
        &self,
        version: &str,
        root: &Path,
        progress: &dyn Fn(&str),
    ) -> anyhow::Result<()>;

    fn ensure_loader_installed(
        &self,
        kind: LoaderKind,
        version: &str,
        loader_version: &str,
        root: &Path,
    ) -> anyhow::Result<()>;

    /// Returns argv, executable first.
    fn build_launch_command(
        &self,
        profile_id: &str,
        root: &Path,
        options: &LaunchOptions,
    ) -> anyhow::Result<Vec<String>>;
}
