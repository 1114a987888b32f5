use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::core::dispatcher::{CoreEvent, EventSink, InstanceLocks};
use crate::core::error::{CoreError, Result};
use crate::core::instance::{InstanceRecord, LoaderKind, MIN_RAM_GIB};
use crate::core::instance_runner::{spawn_instance, RunningInstance};
use crate::core::java_scanner::find_launcher_on_path;
use crate::core::loaders::profile_id_for_loader;
use crate::core::modloader_resolver::{resolve_loader_version, LoaderVersionSource};
use crate::core::version_resolver::{LaunchOptions, VersionInstallProvider};
use crate::core::LaunchState;

pub(crate) const GAME_DIR_FLAG: &str = "--gameDir";
pub(crate) const OFFLINE_ACCESS_TOKEN: &str = "0";
const FALLBACK_LAUNCHER: &str = "java";

#[cfg(windows)]
const PREFERRED_LAUNCHERS: &[&str] = &["javaw.exe", "java.exe"];
#[cfg(not(windows))]
const PREFERRED_LAUNCHERS: &[&str] = &["java"];

/// Collaborators and host facts a launch runs against.
#[derive(Clone)]
pub struct LaunchContext {
    /// Game data root handed to the provider.
    pub install_root: PathBuf,
    pub instances_root: PathBuf,
    pub provider: Arc<dyn VersionInstallProvider>,
    pub loader_source: Arc<dyn LoaderVersionSource>,
    pub search_path: Option<OsString>,
    pub liveness_poll: Duration,
    pub locks: InstanceLocks,
    pub sink: EventSink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub profile_id: String,
    pub command: Vec<String>,
    pub working_dir: PathBuf,
}

pub fn validate_launch_preconditions(record: &InstanceRecord) -> Result<()> {
    if record.version.trim().is_empty() {
        return Err(CoreError::MissingField("version"));
    }
    if record.username.trim().is_empty() {
        return Err(CoreError::MissingField("username"));
    }
    Ok(())
}

/// Prepares and spawns `record`, holding the instance lock until the
/// process is running. Every failure comes back as `CoreError::Launch`.
pub async fn launch_instance(ctx: &LaunchContext, record: &InstanceRecord) -> Result<RunningInstance> {
    let name = record.name.as_str();
    let launched = async {
        validate_launch_preconditions(record)?;
        let _guard = ctx.locks.lock(name).await;
        let plan = prepare_launch(ctx, record).await?;
        publish_state(ctx, name, LaunchState::Launching);
        let running = spawn_instance(
            name,
            &plan.command,
            &plan.working_dir,
            ctx.liveness_poll,
            ctx.sink.clone(),
        )?;
        Ok::<_, CoreError>(running)
    }
    .await;
    launched.map_err(|error| CoreError::launch(name, error))
}

/// Steps 1-5 of a launch: directories, base game, loader, runtime, command.
pub async fn prepare_launch(ctx: &LaunchContext, record: &InstanceRecord) -> Result<LaunchPlan> {
    let name = record.name.clone();
    let instance_dir = ctx.instances_root.join(&name);

    publish_state(ctx, &name, LaunchState::Preparing);
    fs::create_dir_all(instance_dir.join("config"))?;

    publish_state(ctx, &name, LaunchState::Downloading);
    {
        let provider = Arc::clone(&ctx.provider);
        let root = ctx.install_root.clone();
        let version = record.version.clone();
        let sink = ctx.sink.clone();
        let instance = name.clone();
        tokio::task::spawn_blocking(move || {
            let report = |message: &str| {
                sink.emit(CoreEvent::LaunchStatus {
                    instance: instance.clone(),
                    message: message.to_string(),
                })
            };
            provider.ensure_version_installed(&version, &root, &report)
        })
        .await??;
    }

    publish_state(ctx, &name, LaunchState::Resolving);
    let profile_id = match record.loader {
        LoaderKind::Vanilla => record.version.clone(),
        kind => {
            let loader_version = resolve_loader_version(
                ctx.loader_source.as_ref(),
                kind,
                &record.version,
                &record.loader_version,
            )
            .await?;
            debug!(instance = %name, loader = %kind, %loader_version, "loader version pinned");

            let provider = Arc::clone(&ctx.provider);
            let root = ctx.install_root.clone();
            let version = record.version.clone();
            let pinned = loader_version.clone();
            tokio::task::spawn_blocking(move || {
                provider.ensure_loader_installed(kind, &version, &pinned, &root)
            })
            .await??;
            profile_id_for_loader(kind, &record.version, &loader_version)
        }
    };

    let executable = resolve_java_executable(&record.java_path, ctx.search_path.as_ref());
    let options = LaunchOptions {
        username: record.username.clone(),
        uuid: offline_uuid(&record.username),
        access_token: OFFLINE_ACCESS_TOKEN.to_string(),
        game_directory: instance_dir.clone(),
        executable_path: executable,
        jvm_arguments: heap_arguments(record.ram_gib()),
    };

    let provider = Arc::clone(&ctx.provider);
    let root = ctx.install_root.clone();
    let profile = profile_id.clone();
    let mut command =
        tokio::task::spawn_blocking(move || provider.build_launch_command(&profile, &root, &options))
            .await??;
    if command.is_empty() {
        return Err(CoreError::ProviderFailure(format!(
            "provider returned an empty command for {profile_id}"
        )));
    }
    enforce_game_dir(&mut command, &instance_dir);

    info!(instance = %name, %profile_id, "launch command assembled");
    Ok(LaunchPlan {
        profile_id,
        command,
        working_dir: instance_dir,
    })
}

/// Explicit path when it exists, then the host search path, then the bare
/// command name.
pub(crate) fn resolve_java_executable(explicit: &str, search_path: Option<&OsString>) -> PathBuf {
    let explicit = explicit.trim();
    if !explicit.is_empty() {
        let path = PathBuf::from(explicit);
        if path.is_file() {
            return path;
        }
        debug!(path = explicit, "configured runtime not found, falling back to PATH");
    }
    find_launcher_on_path(search_path, PREFERRED_LAUNCHERS)
        .unwrap_or_else(|| PathBuf::from(FALLBACK_LAUNCHER))
}

/// Sets every `--gameDir` value to `instance_dir`, or appends the flag.
pub(crate) fn enforce_game_dir(command: &mut Vec<String>, instance_dir: &Path) {
    let value = instance_dir.to_string_lossy().into_owned();
    let mut found = false;
    let mut index = 0;
    while index < command.len() {
        if command[index] == GAME_DIR_FLAG {
            found = true;
            if index + 1 < command.len() {
                command[index + 1] = value.clone();
            } else {
                command.push(value.clone());
            }
            index += 2;
        } else {
            index += 1;
        }
    }
    if !found {
        command.push(GAME_DIR_FLAG.to_string());
        command.push(value);
    }
}

pub(crate) fn heap_arguments(ram_gib: u8) -> Vec<String> {
    vec![format!("-Xms{MIN_RAM_GIB}G"), format!("-Xmx{ram_gib}G")]
}

/// Name-based (MD5, version 3) UUID of `OfflinePlayer:<name>`.
pub fn offline_uuid(username: &str) -> String {
    let mut bytes = md5::compute(format!("OfflinePlayer:{username}")).0;
    bytes[6] = (bytes[6] & 0x0f) | 0x30;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|byte| format!("{byte:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn publish_state(ctx: &LaunchContext, instance: &str, state: LaunchState) {
    ctx.sink.emit(CoreEvent::LaunchState {
        instance: instance.to_string(),
        state,
    });
}
