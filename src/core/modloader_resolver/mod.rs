use futures::future::BoxFuture;
use serde::Deserialize;

use crate::core::error::{CoreError, Result};
use crate::core::instance::{LoaderKind, LATEST_LOADER_VERSION};

pub const FABRIC_META_BASE: &str = "https://meta.fabricmc.net/v2";
pub const QUILT_META_BASE: &str = "https://meta.quiltmc.org/v3";

/// Entry of the loader listing served by both metadata services.
#[derive(Debug, Clone, Deserialize)]
pub struct LoaderVersionEntry {
    pub version: String,
    #[serde(default)]
    pub stable: Option<bool>,
}

/// Source of the newest loader version for a loader family.
pub trait LoaderVersionSource: Send + Sync {
    fn latest_loader_version<'a>(
        &'a self,
        kind: LoaderKind,
        game_version: &'a str,
    ) -> BoxFuture<'a, Result<String>>;
}

pub fn loader_listing_url(kind: LoaderKind) -> Option<String> {
    match kind {
        LoaderKind::Fabric => Some(format!("{FABRIC_META_BASE}/versions/loader")),
        LoaderKind::Quilt => Some(format!("{QUILT_META_BASE}/versions/loader")),
        LoaderKind::Vanilla => None,
    }
}

/// The listing is newest first; its head is what "latest" means.
pub(crate) fn newest_listed(kind: LoaderKind, listing: &[LoaderVersionEntry]) -> Result<String> {
    listing
        .first()
        .map(|entry| entry.version.trim().to_string())
        .filter(|version| !version.is_empty())
        .ok_or_else(|| CoreError::NetworkFailure(format!("{kind} loader listing is empty")))
}

/// Pins the `"latest"` sentinel to a concrete version; pinned versions pass
/// through without a lookup.
pub async fn resolve_loader_version<S>(
    source: &S,
    kind: LoaderKind,
    game_version: &str,
    requested: &str,
) -> Result<String>
where
    S: LoaderVersionSource + ?Sized,
{
    let requested = requested.trim();
    if !requested.is_empty() && requested != LATEST_LOADER_VERSION {
        return Ok(requested.to_string());
    }
    source.latest_loader_version(kind, game_version).await
}
