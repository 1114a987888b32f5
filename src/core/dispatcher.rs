use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, trace, warn};

use crate::core::config::AppConfig;
use crate::core::downloader::AssetFetcher;
use crate::core::error::{CoreError, Result};
use crate::core::instance::InstanceRecord;
use crate::core::instance_store::InstanceStore;
use crate::core::java::RuntimeCandidate;
use crate::core::java_scanner::{scan, ScanEnvironment};
use crate::core::launch_pipeline::{launch_instance, validate_launch_preconditions, LaunchContext};
use crate::core::launcher::LauncherLayout;
use crate::core::modloader_resolver::LoaderVersionSource;
use crate::core::modpack::{
    install_archive, install_from_registry, InstallContext, InstallPhase, PackSource,
};
use crate::core::network::{HttpClient, PackSearchHit, VersionCatalog};
use crate::core::version_resolver::VersionInstallProvider;
use crate::core::LaunchState;

/// Everything a worker reports back to the control thread.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    ScanFinished {
        deep: bool,
        candidates: Vec<RuntimeCandidate>,
    },
    /// An install created or replaced a record. Applied to the store.
    InstanceUpserted(InstanceRecord),
    InstallProgress {
        instance: String,
        phase: InstallPhase,
        completed: usize,
        total: usize,
    },
    /// Applied to the store, which is then persisted.
    InstallFinished(InstanceRecord),
    InstallFailed {
        source: String,
        message: String,
    },
    SearchFinished {
        term: String,
        hits: Vec<PackSearchHit>,
    },
    SearchFailed {
        term: String,
        message: String,
    },
    CatalogReady(VersionCatalog),
    CatalogFailed {
        message: String,
    },
    LaunchState {
        instance: String,
        state: LaunchState,
    },
    /// Free-form status text from the version-install provider.
    LaunchStatus {
        instance: String,
        message: String,
    },
    LogLine {
        instance: String,
        line: String,
    },
    ProcessExited {
        instance: String,
        code: Option<i32>,
        success: bool,
    },
    LaunchFailed {
        instance: String,
        message: String,
    },
}

impl CoreEvent {
    /// Completion fraction for progress events.
    pub fn fraction(&self) -> Option<f32> {
        match self {
            CoreEvent::InstallProgress {
                completed, total, ..
            } if *total > 0 => Some(*completed as f32 / *total as f32),
            CoreEvent::InstallProgress { .. } => Some(1.0),
            _ => None,
        }
    }
}

/// Sending half of the worker-to-control-thread queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: UnboundedSender<CoreEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: CoreEvent) {
        if self.tx.send(event).is_err() {
            trace!("event dropped, control thread is gone");
        }
    }
}

/// Per-instance async mutexes serialising installs and launches that target
/// the same name. A name's slot lives only while someone holds or awaits it.
#[derive(Debug, Clone, Default)]
pub struct InstanceLocks {
    table: Arc<Mutex<LockTable>>,
}

type LockTable = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

impl InstanceLocks {
    pub async fn lock(&self, name: &str) -> InstanceGuard {
        let slot = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(table.entry(name.to_string()).or_default())
        };
        InstanceGuard {
            name: name.to_string(),
            table: Arc::clone(&self.table),
            held: Some(slot.lock_owned().await),
        }
    }

    /// Whether an install or launch currently holds `name`.
    pub fn is_busy(&self, name: &str) -> bool {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table
            .get(name)
            .is_some_and(|slot| slot.try_lock().is_err())
    }
}

/// Held lock on one instance name. Dropping it releases the name.
#[must_use = "the instance is unlocked as soon as the guard is dropped"]
pub struct InstanceGuard {
    name: String,
    table: Arc<Mutex<LockTable>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        self.held.take();
        // Waiters clone the slot under the table lock, so a lone reference
        // means nobody else wants this name.
        if table
            .get(&self.name)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            table.remove(&self.name);
        }
    }
}

/// Collaborators the dispatcher hands to workers.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn VersionInstallProvider>,
    pub fetcher: Arc<dyn AssetFetcher>,
    pub loader_source: Arc<dyn LoaderVersionSource>,
    pub pack_source: Arc<dyn PackSource>,
}

/// Owns the store and the worker runtime. Every method is meant to be called
/// from the single control thread; workers only ever send events.
pub struct Dispatcher {
    runtime: Runtime,
    layout: LauncherLayout,
    config: AppConfig,
    store: InstanceStore,
    client: HttpClient,
    collaborators: Collaborators,
    locks: InstanceLocks,
    sink: EventSink,
    events: UnboundedReceiver<CoreEvent>,
    selected: Option<String>,
}

impl Dispatcher {
    /// Uses the HTTP client for downloads, loader lookups and pack lookups.
    pub fn new(
        layout: LauncherLayout,
        config: AppConfig,
        provider: Arc<dyn VersionInstallProvider>,
    ) -> Result<Self> {
        let client = HttpClient::new(&config.network_tuning)?;
        let collaborators = Collaborators {
            provider,
            fetcher: Arc::new(client.clone()),
            loader_source: Arc::new(client.clone()),
            pack_source: Arc::new(client.clone()),
        };
        Self::with_collaborators(layout, config, client, collaborators)
    }

    pub fn with_collaborators(
        layout: LauncherLayout,
        config: AppConfig,
        client: HttpClient,
        collaborators: Collaborators,
    ) -> Result<Self> {
        layout.ensure()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("orbus-worker")
            .build()?;
        let store = InstanceStore::load(&layout);
        let (sink, events) = EventSink::channel();
        info!(root = %layout.root.display(), "dispatcher ready");
        Ok(Self {
            runtime,
            layout,
            config,
            store,
            client,
            collaborators,
            locks: InstanceLocks::default(),
            sink,
            events,
            selected: None,
        })
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut InstanceStore {
        &mut self.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn layout(&self) -> &LauncherLayout {
        &self.layout
    }

    pub fn locks(&self) -> &InstanceLocks {
        &self.locks
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Switches the current instance, persisting pending edits first.
    pub fn select_instance(&mut self, name: &str) -> Result<()> {
        if !self.store.contains(name) {
            return Err(CoreError::InstanceNotFound(name.to_string()));
        }
        self.store.save()?;
        self.selected = Some(name.to_string());
        Ok(())
    }

    /// Renames an instance unless an install or launch holds either name.
    pub fn rename_instance(&mut self, old: &str, new: &str) -> Result<()> {
        self.ensure_idle(old)?;
        self.ensure_idle(new)?;
        self.store.rename(old, new)?;
        if self.selected.as_deref() == Some(old) {
            self.selected = Some(new.to_string());
        }
        Ok(())
    }

    pub fn delete_instance(&mut self, name: &str) -> Result<()> {
        self.ensure_idle(name)?;
        self.store.delete(name)?;
        if self.selected.as_deref() == Some(name) {
            self.selected = None;
        }
        Ok(())
    }

    fn ensure_idle(&self, name: &str) -> Result<()> {
        if self.locks.is_busy(name) {
            return Err(CoreError::InstanceBusy(name.to_string()));
        }
        Ok(())
    }

    pub fn spawn_scan(&self, deep: bool) {
        let sink = self.sink.clone();
        let timeout = self.config.probe_timeout();
        self.runtime.spawn(async move {
            let candidates = scan(deep, ScanEnvironment::from_host(), timeout).await;
            sink.emit(CoreEvent::ScanFinished { deep, candidates });
        });
    }

    pub fn spawn_install(&self, archive: PathBuf) {
        let ctx = self.install_context();
        let existing = self.store.names();
        self.runtime.spawn(async move {
            let outcome = install_archive(&ctx, &archive, &existing).await;
            report_install(&ctx.sink, archive.display().to_string(), outcome);
        });
    }

    pub fn spawn_registry_install(&self, project_id: &str) {
        let ctx = self.install_context();
        let existing = self.store.names();
        let source = Arc::clone(&self.collaborators.pack_source);
        let project_id = project_id.to_string();
        self.runtime.spawn(async move {
            let outcome = install_from_registry(&ctx, source.as_ref(), &project_id, &existing).await;
            report_install(&ctx.sink, project_id, outcome);
        });
    }

    pub fn spawn_search(&self, term: &str) {
        let client = self.client.clone();
        let sink = self.sink.clone();
        let term = term.to_string();
        self.runtime.spawn(async move {
            match client.search_modpacks(&term).await {
                Ok(hits) => sink.emit(CoreEvent::SearchFinished { term, hits }),
                Err(error) => sink.emit(CoreEvent::SearchFailed {
                    term,
                    message: error.to_string(),
                }),
            }
        });
    }

    pub fn spawn_version_catalog(&self) {
        let client = self.client.clone();
        let sink = self.sink.clone();
        self.runtime.spawn(async move {
            match client.version_catalog().await {
                Ok(catalog) => sink.emit(CoreEvent::CatalogReady(catalog)),
                Err(error) => sink.emit(CoreEvent::CatalogFailed {
                    message: error.to_string(),
                }),
            }
        });
    }

    /// Starts a launch. Missing fields are reported here, before any I/O;
    /// later failures arrive as `LaunchFailed` followed by `Idle`.
    pub fn launch(&mut self, name: &str) -> Result<()> {
        let record = self
            .store
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::InstanceNotFound(name.to_string()))?;
        validate_launch_preconditions(&record)?;
        self.store.save()?;
        self.selected = Some(name.to_string());

        let ctx = self.launch_context();
        self.runtime.spawn(async move {
            match launch_instance(&ctx, &record).await {
                Ok(running) => debug!(instance = %running.name, pid = ?running.pid, "launch handed to supervisor"),
                Err(error) => {
                    warn!(%error, "launch failed");
                    ctx.sink.emit(CoreEvent::LaunchFailed {
                        instance: record.name.clone(),
                        message: error.to_string(),
                    });
                    ctx.sink.emit(CoreEvent::LaunchState {
                        instance: record.name,
                        state: LaunchState::Idle,
                    });
                }
            }
        });
        Ok(())
    }

    /// Drains every queued event without blocking.
    pub fn process_events(&mut self) -> Vec<CoreEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            self.apply(&event);
            drained.push(event);
        }
        drained
    }

    /// Blocks the control thread for at most `timeout` waiting for one event.
    pub fn wait_event(&mut self, timeout: Duration) -> Option<CoreEvent> {
        let events = &mut self.events;
        let received = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, events.recv()).await });
        let event = received.ok().flatten()?;
        self.apply(&event);
        Some(event)
    }

    fn apply(&mut self, event: &CoreEvent) {
        match event {
            CoreEvent::InstanceUpserted(record) | CoreEvent::InstallFinished(record) => {
                if let Err(error) = self.store.upsert(record.clone()) {
                    warn!(%error, instance = %record.name, "could not persist installed instance");
                }
            }
            _ => {}
        }
    }

    fn install_context(&self) -> InstallContext {
        let username = self
            .selected
            .as_deref()
            .and_then(|name| self.store.get(name))
            .map(|record| record.username.clone())
            .unwrap_or_else(|| self.config.default_username.clone());
        InstallContext {
            instances_root: self.layout.instances.clone(),
            fetcher: Arc::clone(&self.collaborators.fetcher),
            locks: self.locks.clone(),
            sink: self.sink.clone(),
            download_concurrency: self.config.download_concurrency,
            username,
            default_game_version: self.config.default_game_version.clone(),
        }
    }

    fn launch_context(&self) -> LaunchContext {
        LaunchContext {
            install_root: self.layout.root.clone(),
            instances_root: self.layout.instances.clone(),
            provider: Arc::clone(&self.collaborators.provider),
            loader_source: Arc::clone(&self.collaborators.loader_source),
            search_path: std::env::var_os("PATH"),
            liveness_poll: self.config.liveness_poll(),
            locks: self.locks.clone(),
            sink: self.sink.clone(),
        }
    }
}

fn report_install(sink: &EventSink, source: String, outcome: Result<InstanceRecord>) {
    match outcome {
        Ok(record) => sink.emit(CoreEvent::InstallFinished(record)),
        Err(error) => {
            warn!(%error, source = %source, "installation abandoned");
            sink.emit(CoreEvent::InstallFailed {
                source,
                message: error.to_string(),
            });
        }
    }
}
