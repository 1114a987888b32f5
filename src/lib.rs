//! Instance provisioning and launch orchestration for the Orbus launcher.
//!
//! Front ends drive everything through [`Dispatcher`]: they request scans,
//! installs, searches and launches, then drain [`CoreEvent`]s on their own
//! control thread.

pub mod core;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::core::config::AppConfig;
pub use crate::core::dispatcher::{
    Collaborators, CoreEvent, Dispatcher, EventSink, InstanceGuard, InstanceLocks,
};
pub use crate::core::error::{CoreError, Result};
pub use crate::core::instance::{InstanceEdit, InstanceRecord, LoaderKind};
pub use crate::core::instance_store::InstanceStore;
pub use crate::core::java::{Bitness, RuntimeCandidate};
pub use crate::core::launcher::LauncherLayout;
pub use crate::core::modpack::PackSource;
pub use crate::core::network::{HttpClient, PackSearchHit, VersionCatalog};
pub use crate::core::version_resolver::{LaunchOptions, VersionInstallProvider};
pub use crate::core::LaunchState;

const DEFAULT_LOG_FILTER: &str = "orbus_lib=info";

/// Installs the global subscriber. `RUST_LOG` overrides the default filter;
/// calling this more than once is harmless.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
