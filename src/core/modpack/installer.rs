use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::core::asset_downloader::download_in_order;
use crate::core::dispatcher::{CoreEvent, EventSink, InstanceGuard, InstanceLocks};
use crate::core::downloader::{AssetFetcher, DownloadItem};
use crate::core::error::{CoreError, Result};
use crate::core::instance::{sanitize_instance_name, InstanceRecord};
use crate::core::modpack::manifest::{ArchiveManifest, MANIFEST_ENTRY, OVERRIDES_PREFIX};

/// Staging file for packs fetched from the registry.
pub const REGISTRY_DOWNLOAD_NAME: &str = "download.mrpack";
const FALLBACK_ARCHIVE_NAME: &str = "Modpack";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    Open,
    Classify,
    Download,
    MergeOverrides,
    Extract,
    Complete,
}

/// Where registry projects publish their pack files.
pub trait PackSource: Send + Sync {
    /// Download URL of the newest pack file of `project_id`.
    fn latest_pack_file_url<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// Everything an install needs besides the archive itself.
#[derive(Clone)]
pub struct InstallContext {
    pub instances_root: PathBuf,
    pub fetcher: Arc<dyn AssetFetcher>,
    pub locks: InstanceLocks,
    pub sink: EventSink,
    pub download_concurrency: usize,
    /// Username given to records created from registry packs.
    pub username: String,
    /// Game version given to records created from generic archives.
    pub default_game_version: String,
}

enum ArchiveKind {
    RegistryPack(ArchiveManifest),
    Generic,
}

/// Installs a registry pack or a generic zip archive into a new or existing
/// instance and returns the resulting record.
///
/// `existing_names` is the control thread's view of the registry when the
/// install was requested. Already written files are left in place on failure.
pub async fn install_archive(
    ctx: &InstallContext,
    archive: &Path,
    existing_names: &[String],
) -> Result<InstanceRecord> {
    info!(archive = %archive.display(), "installing archive");
    let path = archive.to_path_buf();
    let kind = tokio::task::spawn_blocking(move || classify(&path)).await??;

    let record = match kind {
        ArchiveKind::RegistryPack(manifest) => install_registry_pack(ctx, archive, manifest).await?,
        ArchiveKind::Generic => install_generic(ctx, archive, existing_names).await?,
    };

    progress(ctx, &record.name, InstallPhase::Complete, 1, 1);
    info!(instance = %record.name, "archive installed");
    Ok(record)
}

/// Fetches the newest file of a registry project and installs it.
pub async fn install_from_registry<S>(
    ctx: &InstallContext,
    source: &S,
    project_id: &str,
    existing_names: &[String],
) -> Result<InstanceRecord>
where
    S: PackSource + ?Sized,
{
    let url = source.latest_pack_file_url(project_id).await?;
    let _staging_guard = ctx.locks.lock(REGISTRY_DOWNLOAD_NAME).await;
    let staging = ctx.instances_root.join(REGISTRY_DOWNLOAD_NAME);
    info!(project_id, %url, "downloading registry pack");
    let installed = match ctx.fetcher.fetch(&url, &staging).await {
        Ok(_) => install_archive(ctx, &staging, existing_names).await,
        Err(error) => Err(error),
    };
    if let Err(error) = fs::remove_file(&staging) {
        debug!(%error, path = %staging.display(), "staging archive not removed");
    }
    installed
}

fn classify(archive: &Path) -> Result<ArchiveKind> {
    debug!(phase = ?InstallPhase::Open, archive = %archive.display());
    let mut zip = ZipArchive::new(File::open(archive)?)?;

    debug!(phase = ?InstallPhase::Classify, entries = zip.len());
    for index in 0..zip.len() {
        let entry = zip.by_index_raw(index)?;
        if entry.enclosed_name().is_none() {
            return Err(CoreError::CorruptArchive(format!(
                "entry {} escapes the instance directory",
                entry.name()
            )));
        }
    }

    let raw = match zip.by_name(MANIFEST_ENTRY) {
        Ok(mut entry) => {
            let mut raw = Vec::new();
            entry.read_to_end(&mut raw).map_err(|error| {
                CoreError::CorruptArchive(format!("{MANIFEST_ENTRY}: {error}"))
            })?;
            raw
        }
        Err(zip::result::ZipError::FileNotFound) => return Ok(ArchiveKind::Generic),
        Err(error) => return Err(error.into()),
    };
    Ok(ArchiveKind::RegistryPack(ArchiveManifest::parse(&raw)?))
}

async fn install_registry_pack(
    ctx: &InstallContext,
    archive: &Path,
    manifest: ArchiveManifest,
) -> Result<InstanceRecord> {
    let name = manifest.display_name.clone();
    let _guard = ctx.locks.lock(&name).await;
    let instance_dir = ctx.instances_root.join(&name);

    let mut record = InstanceRecord::new(&name, &ctx.username, &manifest.game_version);
    record.loader = manifest.loader_kind;
    ctx.sink.emit(CoreEvent::InstanceUpserted(record.clone()));
    info!(
        instance = %name,
        version = %manifest.game_version,
        loader = %manifest.loader_kind,
        declared_loader = manifest.declared_loader_version.as_deref().unwrap_or("-"),
        files = manifest.files.len(),
        "registry pack parsed"
    );

    fs::create_dir_all(instance_dir.join("config"))?;

    let items: Vec<DownloadItem> = manifest
        .files
        .iter()
        .map(|file| DownloadItem {
            url: file.download_url.clone(),
            destination: instance_dir.join(&file.relative_path),
        })
        .collect();
    download_in_order(
        ctx.fetcher.as_ref(),
        &items,
        ctx.download_concurrency,
        |completed, total| progress(ctx, &name, InstallPhase::Download, completed, total),
    )
    .await?;

    let source = archive.to_path_buf();
    let target = instance_dir.clone();
    let merged = tokio::task::spawn_blocking(move || {
        extract_entries(&source, &target, Some(Path::new(OVERRIDES_PREFIX)))
    })
    .await??;
    debug!(instance = %name, merged, "overrides merged");
    progress(ctx, &name, InstallPhase::MergeOverrides, merged, merged);

    Ok(record)
}

async fn install_generic(
    ctx: &InstallContext,
    archive: &Path,
    existing_names: &[String],
) -> Result<InstanceRecord> {
    let base = archive
        .file_stem()
        .map(|stem| sanitize_instance_name(&stem.to_string_lossy(), FALLBACK_ARCHIVE_NAME))
        .unwrap_or_else(|| FALLBACK_ARCHIVE_NAME.to_string());
    let (name, _guard) = claim_free_name(ctx, &base, existing_names).await?;
    let instance_dir = ctx.instances_root.join(&name);

    let record = InstanceRecord::new(&name, "", &ctx.default_game_version);
    ctx.sink.emit(CoreEvent::InstanceUpserted(record.clone()));

    let source = archive.to_path_buf();
    let extracted =
        tokio::task::spawn_blocking(move || extract_entries(&source, &instance_dir, None)).await??;
    progress(ctx, &name, InstallPhase::Extract, extracted, extracted);

    Ok(record)
}

/// Picks `base`, `base (2)`, `base (3)`, ... skipping names that are already
/// registered or whose directory exists, and creates the directory while
/// holding the name's lock.
async fn claim_free_name(
    ctx: &InstallContext,
    base: &str,
    existing_names: &[String],
) -> Result<(String, InstanceGuard)> {
    let registered: HashSet<&str> = existing_names.iter().map(String::as_str).collect();
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let candidate = if attempt == 1 {
            base.to_string()
        } else {
            format!("{base} ({attempt})")
        };
        if registered.contains(candidate.as_str()) {
            continue;
        }
        let guard = ctx.locks.lock(&candidate).await;
        let dir = ctx.instances_root.join(&candidate);
        if dir.exists() {
            continue;
        }
        fs::create_dir_all(&dir)?;
        if candidate != base {
            info!(requested = base, instance = %candidate, "archive name taken, using suffix");
        }
        return Ok((candidate, guard));
    }
}

/// Writes archive entries below `target`. With a prefix, only entries under
/// it are written and the prefix is stripped.
fn extract_entries(archive: &Path, target: &Path, prefix: Option<&Path>) -> Result<usize> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let mut written = 0;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(enclosed) = entry.enclosed_name() else {
            return Err(CoreError::CorruptArchive(format!(
                "entry {} escapes the instance directory",
                entry.name()
            )));
        };
        let relative = match prefix {
            Some(prefix) => match enclosed.strip_prefix(prefix) {
                Ok(rest) => rest.to_path_buf(),
                Err(_) => continue,
            },
            None => enclosed,
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        let destination = target.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&destination)?;
            continue;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
        if let Err(error) = entry.read_to_end(&mut contents) {
            warn!(%error, entry = %relative.display(), "archive entry could not be read");
            return Err(CoreError::CorruptArchive(format!(
                "entry {}: {error}",
                relative.display()
            )));
        }
        fs::write(&destination, contents)?;
        written += 1;
    }
    Ok(written)
}

fn progress(ctx: &InstallContext, name: &str, phase: InstallPhase, completed: usize, total: usize) {
    ctx.sink.emit(CoreEvent::InstallProgress {
        instance: name.to_string(),
        phase,
        completed,
        total,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instance::{LoaderKind, DEFAULT_RAM_GIB};
    use futures::future::BoxFuture;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    struct MapFetcher {
        bodies: HashMap<String, Vec<u8>>,
        requested: Mutex<Vec<String>>,
    }

    impl MapFetcher {
        fn new(bodies: &[(&str, &[u8])]) -> Self {
            Self {
                bodies: bodies
                    .iter()
                    .map(|(url, body)| (url.to_string(), body.to_vec()))
                    .collect(),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    impl AssetFetcher for MapFetcher {
        fn fetch<'a>(&'a self, url: &'a str, destination: &'a Path) -> BoxFuture<'a, Result<u64>> {
            Box::pin(async move {
                self.requested.lock().unwrap().push(url.to_string());
                let body = self
                    .bodies
                    .get(url)
                    .ok_or_else(|| CoreError::NetworkFailure(format!("404 {url}")))?;
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(destination, body)?;
                Ok(body.len() as u64)
            })
        }
    }

    struct FixedPack(Option<&'static str>);

    impl PackSource for FixedPack {
        fn latest_pack_file_url<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move {
                self.0.map(str::to_string).ok_or_else(|| {
                    CoreError::NetworkFailure(format!("project {project_id} has no files"))
                })
            })
        }
    }

    enum Entry<'a> {
        File(&'a str, &'a [u8]),
        Dir(&'a str),
    }

    fn write_zip(path: &Path, entries: &[Entry<'_>]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default();
        for entry in entries {
            match entry {
                Entry::File(name, body) => {
                    zip.start_file(*name, options).unwrap();
                    zip.write_all(body).unwrap();
                }
                Entry::Dir(name) => zip.add_directory(*name, options).unwrap(),
            }
        }
        zip.finish().unwrap();
    }

    fn context(
        root: &Path,
        fetcher: Arc<dyn AssetFetcher>,
    ) -> (InstallContext, UnboundedReceiver<CoreEvent>) {
        let (sink, rx) = EventSink::channel();
        let ctx = InstallContext {
            instances_root: root.join("instances"),
            fetcher,
            locks: InstanceLocks::default(),
            sink,
            download_concurrency: 1,
            username: "Steve".to_string(),
            default_game_version: "1.21.1".to_string(),
        };
        (ctx, rx)
    }

    const PACK_MANIFEST: &[u8] = br#"{"formatVersion":1,"name":"Pack",
        "dependencies":{"minecraft":"1.20.1","fabric-loader":"0.15.0"},
        "files":[{"path":"mods/a.jar","downloads":["https://x/a.jar"]}]}"#;

    #[tokio::test]
    async fn registry_pack_downloads_files_and_merges_overrides() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pack.mrpack");
        write_zip(
            &archive,
            &[
                Entry::File(MANIFEST_ENTRY, PACK_MANIFEST),
                Entry::Dir("overrides/"),
                Entry::Dir("overrides/config/"),
                Entry::File("overrides/config/opts.txt", b"fov=90"),
                Entry::Dir("overrides/saves/"),
            ],
        );
        let fetcher = Arc::new(MapFetcher::new(&[("https://x/a.jar", &b"jar-bytes"[..])]));
        let (ctx, mut rx) = context(dir.path(), fetcher.clone());

        let record = install_archive(&ctx, &archive, &[]).await.unwrap();

        assert_eq!(record.name, "Pack");
        assert_eq!(record.version, "1.20.1");
        assert_eq!(record.loader, LoaderKind::Fabric);
        assert_eq!(record.username, "Steve");
        let instance = ctx.instances_root.join("Pack");
        assert_eq!(fs::read(instance.join("mods/a.jar")).unwrap(), b"jar-bytes");
        assert_eq!(fs::read(instance.join("config/opts.txt")).unwrap(), b"fov=90");
        assert!(instance.join("saves").is_dir());
        assert!(!instance.join("overrides").exists());
        assert_eq!(*fetcher.requested.lock().unwrap(), vec!["https://x/a.jar"]);

        match rx.try_recv().unwrap() {
            CoreEvent::InstanceUpserted(upserted) => assert_eq!(upserted.name, "Pack"),
            other => panic!("unexpected first event {other:?}"),
        }
        let mut download_progress = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let CoreEvent::InstallProgress {
                phase: InstallPhase::Download,
                completed,
                total,
                ..
            } = event
            {
                download_progress.push((completed, total));
            }
        }
        assert_eq!(download_progress, vec![(1, 1)]);
    }

    #[tokio::test]
    async fn overrides_win_over_downloaded_files() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pack.mrpack");
        let manifest = br#"{"name":"Pack","dependencies":{"minecraft":"1.20.1"},
            "files":[{"path":"config/opts.txt","downloads":["https://x/opts"]}]}"#;
        write_zip(
            &archive,
            &[
                Entry::File(MANIFEST_ENTRY, manifest),
                Entry::File("overrides/config/opts.txt", b"from-override"),
            ],
        );
        let fetcher = Arc::new(MapFetcher::new(&[("https://x/opts", &b"from-download"[..])]));
        let (ctx, _rx) = context(dir.path(), fetcher);

        let record = install_archive(&ctx, &archive, &[]).await.unwrap();

        assert_eq!(record.loader, LoaderKind::Vanilla);
        let opts = ctx.instances_root.join("Pack/config/opts.txt");
        assert_eq!(fs::read(opts).unwrap(), b"from-override");
    }

    #[tokio::test]
    async fn failed_download_aborts_but_keeps_the_record_event() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pack.mrpack");
        write_zip(
            &archive,
            &[
                Entry::File(MANIFEST_ENTRY, PACK_MANIFEST),
                Entry::File("overrides/config/opts.txt", b"x"),
            ],
        );
        let (ctx, mut rx) = context(dir.path(), Arc::new(MapFetcher::new(&[])));

        let result = install_archive(&ctx, &archive, &[]).await;

        assert!(matches!(result, Err(CoreError::NetworkFailure(_))));
        assert!(matches!(rx.try_recv().unwrap(), CoreEvent::InstanceUpserted(_)));
        assert!(!ctx.instances_root.join("Pack/config/opts.txt").exists());
    }

    #[tokio::test]
    async fn generic_archive_is_mirrored_with_default_settings() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("my world.zip");
        write_zip(
            &archive,
            &[
                Entry::Dir("saves/"),
                Entry::File("saves/level.dat", b"level"),
                Entry::File("options.txt", b"opts"),
                Entry::Dir("resourcepacks/"),
            ],
        );
        let (ctx, _rx) = context(dir.path(), Arc::new(MapFetcher::new(&[])));

        let record = install_archive(&ctx, &archive, &[]).await.unwrap();

        assert_eq!(record.name, "my world");
        assert_eq!(record.loader, LoaderKind::Vanilla);
        assert_eq!(record.ram_gib(), DEFAULT_RAM_GIB);
        assert!(record.java_path.is_empty());
        assert_eq!(record.version, "1.21.1");
        let instance = ctx.instances_root.join("my world");
        assert_eq!(fs::read(instance.join("saves/level.dat")).unwrap(), b"level");
        assert_eq!(fs::read(instance.join("options.txt")).unwrap(), b"opts");
        assert!(instance.join("resourcepacks").is_dir());
    }

    #[tokio::test]
    async fn generic_archive_names_get_a_suffix_on_collision() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("World.zip");
        write_zip(&archive, &[Entry::File("a.txt", b"a")]);
        let (ctx, _rx) = context(dir.path(), Arc::new(MapFetcher::new(&[])));
        fs::create_dir_all(ctx.instances_root.join("World (2)")).unwrap();

        let first = install_archive(&ctx, &archive, &["World".to_string()]).await.unwrap();
        assert_eq!(first.name, "World (3)");

        let second = install_archive(&ctx, &archive, &[]).await.unwrap();
        assert_eq!(second.name, "World");
    }

    #[tokio::test]
    async fn escaping_entries_are_rejected_before_any_write() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(
            &archive,
            &[Entry::File("ok.txt", b"ok"), Entry::File("../escape.txt", b"x")],
        );
        let (ctx, mut rx) = context(dir.path(), Arc::new(MapFetcher::new(&[])));

        let result = install_archive(&ctx, &archive, &[]).await;

        assert!(matches!(result, Err(CoreError::CorruptArchive(_))));
        assert!(rx.try_recv().is_err());
        assert!(!ctx.instances_root.join("evil").exists());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn registry_install_stages_the_pack_and_removes_it_afterwards() {
        let dir = TempDir::new().unwrap();
        let built = dir.path().join("built.mrpack");
        write_zip(&built, &[Entry::File(MANIFEST_ENTRY, PACK_MANIFEST)]);
        let pack = fs::read(&built).unwrap();
        let fetcher = Arc::new(MapFetcher::new(&[
            ("https://x/pack.mrpack", &pack[..]),
            ("https://x/a.jar", &b"jar-bytes"[..]),
        ]));
        let (ctx, _rx) = context(dir.path(), fetcher.clone());

        let record = install_from_registry(&ctx, &FixedPack(Some("https://x/pack.mrpack")), "p1", &[])
            .await
            .unwrap();

        assert_eq!(record.name, "Pack");
        assert_eq!(
            *fetcher.requested.lock().unwrap(),
            vec!["https://x/pack.mrpack", "https://x/a.jar"]
        );
        assert!(ctx.instances_root.join("Pack/mods/a.jar").is_file());
        assert!(!ctx.instances_root.join(REGISTRY_DOWNLOAD_NAME).exists());
        assert!(!ctx.locks.is_busy(REGISTRY_DOWNLOAD_NAME));
    }

    #[tokio::test]
    async fn failed_registry_install_still_removes_the_staging_file() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MapFetcher::new(&[("https://x/pack.mrpack", &b"not a zip"[..])]));
        let (ctx, mut rx) = context(dir.path(), fetcher);

        let result =
            install_from_registry(&ctx, &FixedPack(Some("https://x/pack.mrpack")), "p1", &[]).await;

        assert!(matches!(result, Err(CoreError::CorruptArchive(_))));
        assert!(!ctx.instances_root.join(REGISTRY_DOWNLOAD_NAME).exists());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn registry_lookup_failure_downloads_nothing() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MapFetcher::new(&[]));
        let (ctx, _rx) = context(dir.path(), fetcher.clone());

        let result = install_from_registry(&ctx, &FixedPack(None), "p1", &[]).await;

        assert!(matches!(result, Err(CoreError::NetworkFailure(_))));
        assert!(fetcher.requested.lock().unwrap().is_empty());
        assert!(!ctx.instances_root.exists());
    }

    #[tokio::test]
    async fn checksum_mismatch_is_a_corrupt_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("Damaged.zip");
        let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let stored = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        zip.start_file("level.dat", stored).unwrap();
        zip.write_all(b"payload-bytes").unwrap();
        let mut bytes = zip.finish().unwrap().into_inner();
        let at = bytes
            .windows(b"payload-bytes".len())
            .position(|window| window == b"payload-bytes")
            .unwrap();
        bytes[at] = b'P';
        fs::write(&archive, bytes).unwrap();
        let (ctx, _rx) = context(dir.path(), Arc::new(MapFetcher::new(&[])));

        let result = install_archive(&ctx, &archive, &[]).await;

        assert!(matches!(result, Err(CoreError::CorruptArchive(_))), "{result:?}");
    }

    #[tokio::test]
    async fn non_zip_input_is_a_corrupt_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("broken.mrpack");
        fs::write(&archive, b"definitely not a zip").unwrap();
        let (ctx, _rx) = context(dir.path(), Arc::new(MapFetcher::new(&[])));

        let result = install_archive(&ctx, &archive, &[]).await;
        assert!(matches!(result, Err(CoreError::CorruptArchive(_))));
    }
}
