use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::core::java::{rank_candidates, Bitness, RuntimeCandidate};

const SHALLOW_DEPTH: usize = 4;
const DEEP_DEPTH: usize = 8;
const PROBE_CONCURRENCY: usize = 8;

static VERSION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:java|openjdk)\s+version\s+"([^"]+)""#).expect("version regex")
});
static BITNESS_64: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)64-bit").expect("bitness regex"));
static VM_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:server|client)\s+vm\b").expect("vm regex"));

#[cfg(target_os = "windows")]
pub(crate) const LAUNCHER_NAMES: &[&str] = &["java.exe", "javaw.exe"];
#[cfg(not(target_os = "windows"))]
pub(crate) const LAUNCHER_NAMES: &[&str] = &["java"];

/// Where a scan looks. `from_host` reads the real environment; tests build
/// one by hand.
#[derive(Debug, Clone, Default)]
pub struct ScanEnvironment {
    pub java_home: Option<PathBuf>,
    pub search_path: Option<OsString>,
    pub vendor_roots: Vec<PathBuf>,
}

impl ScanEnvironment {
    pub fn from_host() -> Self {
        Self {
            java_home: std::env::var_os("JAVA_HOME")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
            search_path: std::env::var_os("PATH"),
            vendor_roots: known_vendor_roots(),
        }
    }
}

/// Finds runtimes on the host, newest first. Every per-candidate failure is
/// a silent skip, so the worst outcome is an empty list.
pub async fn scan(deep: bool, env: ScanEnvironment, probe_timeout: Duration) -> Vec<RuntimeCandidate> {
    let depth = if deep { DEEP_DEPTH } else { SHALLOW_DEPTH };
    let paths = match tokio::task::spawn_blocking(move || collect_candidate_paths(&env, depth)).await {
        Ok(paths) => paths,
        Err(error) => {
            debug!(%error, "candidate collection aborted");
            return Vec::new();
        }
    };
    debug!(candidates = paths.len(), deep, "probing runtime candidates");

    let mut found: Vec<RuntimeCandidate> = stream::iter(paths)
        .map(|path| probe_runtime(path, probe_timeout))
        .buffer_unordered(PROBE_CONCURRENCY)
        .filter_map(|candidate| async move { candidate })
        .collect()
        .await;

    rank_candidates(&mut found);
    info!(found = found.len(), deep, "runtime scan finished");
    found
}

fn collect_candidate_paths(env: &ScanEnvironment, depth: usize) -> BTreeSet<PathBuf> {
    let mut seeds = Vec::new();

    if let Some(home) = &env.java_home {
        for name in LAUNCHER_NAMES {
            seeds.push(home.join("bin").join(name));
        }
    }

    if let Some(search_path) = &env.search_path {
        for dir in std::env::split_paths(search_path) {
            for name in LAUNCHER_NAMES {
                seeds.push(dir.join(name));
            }
        }
    }

    for root in &env.vendor_roots {
        if !root.is_dir() {
            continue;
        }
        let walker = WalkDir::new(root)
            .max_depth(depth)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(error) => {
                    debug!(%error, "skipping unreadable scan entry");
                    None
                }
            });
        for entry in walker {
            let is_launcher = entry
                .file_name()
                .to_str()
                .is_some_and(|name| LAUNCHER_NAMES.contains(&name));
            if is_launcher && entry.file_type().is_file() {
                seeds.push(entry.into_path());
            }
        }
    }

    seeds
        .into_iter()
        .filter_map(|path| fs::canonicalize(&path).ok())
        .filter(|path| is_executable(path))
        .collect()
}

/// Runs `<path> -version` and keeps it only if the output looks like a
/// runtime banner.
async fn probe_runtime(path: PathBuf, timeout: Duration) -> Option<RuntimeCandidate> {
    let mut command = tokio::process::Command::new(&path);
    command
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(error)) => {
            debug!(path = %path.display(), %error, "probe could not run");
            return None;
        }
        Err(_) => {
            debug!(path = %path.display(), "probe timed out");
            return None;
        }
    };

    let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
    text.push('\n');
    text.push_str(&String::from_utf8_lossy(&output.stdout));

    let Some((version, bitness)) = parse_version_output(&text) else {
        debug!(path = %path.display(), "probe output is not a runtime banner");
        return None;
    };
    Some(RuntimeCandidate {
        path,
        version,
        bitness,
    })
}

pub(crate) fn parse_version_output(text: &str) -> Option<(String, Bitness)> {
    let version = VERSION_LINE
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|value| value.as_str().trim().to_string())
        .filter(|value| !value.is_empty())?;

    let bitness = if BITNESS_64.is_match(text) {
        Bitness::Bits64
    } else if VM_LINE.is_match(text) {
        Bitness::Bits32
    } else {
        Bitness::Unknown
    };
    Some((version, bitness))
}

/// First file named like a runtime launcher on the search path, in path order.
pub(crate) fn find_launcher_on_path(search_path: Option<&OsString>, names: &[&str]) -> Option<PathBuf> {
    let search_path = search_path?;
    for name in names {
        for dir in std::env::split_paths(search_path) {
            let candidate = dir.join(name);
            if candidate.is_file() && is_executable(&candidate) {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn known_vendor_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    #[cfg(target_os = "windows")]
    {
        for var in ["ProgramFiles", "ProgramFiles(x86)", "ProgramW6432"] {
            if let Some(base) = std::env::var_os(var) {
                let base = PathBuf::from(base);
                for vendor in [
                    "Java",
                    "Eclipse Adoptium",
                    "Eclipse Foundation",
                    "Microsoft",
                    "Zulu",
                    "BellSoft",
                    "Amazon Corretto",
                ] {
                    roots.push(base.join(vendor));
                }
            }
        }
        if let Some(appdata) = std::env::var_os("APPDATA") {
            roots.push(PathBuf::from(appdata).join(".minecraft").join("runtime"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        let mut vm_dirs = vec![PathBuf::from("/Library/Java/JavaVirtualMachines")];
        if let Some(home) = dirs::home_dir() {
            vm_dirs.push(home.join("Library").join("Java").join("JavaVirtualMachines"));
            roots.push(home.join(".jdks"));
            roots.push(home.join(".sdkman").join("candidates").join("java"));
            roots.push(
                home.join("Library")
                    .join("Application Support")
                    .join("minecraft")
                    .join("runtime"),
            );
        }
        // Bundles keep the runtime at <bundle>/Contents/Home, deeper than a
        // shallow walk reaches from the container.
        for vm_dir in vm_dirs {
            if let Ok(entries) = fs::read_dir(&vm_dir) {
                for entry in entries.flatten() {
                    roots.push(entry.path().join("Contents").join("Home"));
                }
            }
        }
        roots.push(PathBuf::from("/opt/homebrew/opt"));
        roots.push(PathBuf::from("/usr/local/opt"));
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        for fixed in ["/usr/lib/jvm", "/usr/lib64/jvm", "/usr/java", "/opt/java", "/opt/jdk"] {
            roots.push(PathBuf::from(fixed));
        }
        if let Some(home) = dirs::home_dir() {
            roots.push(home.join(".jdks"));
            roots.push(home.join(".sdkman").join("candidates").join("java"));
            roots.push(home.join(".minecraft").join("runtime"));
        }
    }

    let mut seen = BTreeSet::new();
    roots.retain(|root| seen.insert(root.clone()));
    roots
}
