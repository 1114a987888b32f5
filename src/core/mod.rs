pub mod asset_downloader;
pub mod config;
pub mod dispatcher;
pub mod downloader;
pub mod error;
pub mod instance;
pub mod instance_runner;
pub mod instance_store;
pub mod java;
pub mod java_scanner;
pub mod launch_pipeline;
pub mod launcher;
pub mod loaders;
pub mod modloader_resolver;
pub mod modpack;
pub mod network;
pub mod version_resolver;

use serde::{Deserialize, Serialize};

/// Launch progress as published to front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LaunchState {
    Idle,
    Preparing,
    Downloading,
    Resolving,
    Launching,
    Running,
    Crashed,
    Finished,
}
