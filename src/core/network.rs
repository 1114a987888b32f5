use std::path::Path;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::core::config::NetworkTuning;
use crate::core::downloader::AssetFetcher;
use crate::core::error::{CoreError, Result};
use crate::core::instance::{LoaderKind, LATEST_LOADER_VERSION};
use crate::core::modloader_resolver::{
    loader_listing_url, newest_listed, LoaderVersionEntry, LoaderVersionSource,
};
use crate::core::modpack::PackSource;

pub const MODRINTH_API_BASE: &str = "https://api.modrinth.com/v2";
pub const MOJANG_VERSION_MANIFEST: &str =
    "https://piston-meta.mojang.com/mc/game/version_manifest_v2.json";

const SEARCH_LIMIT: usize = 20;
const CATALOG_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackSearchHit {
    pub title: String,
    pub author: String,
    pub project_id: String,
    #[serde(default)]
    pub icon_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchResponse {
    #[serde(default)]
    pub(crate) hits: Vec<PackSearchHit>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProjectVersion {
    #[serde(default)]
    pub(crate) files: Vec<ProjectVersionFile>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProjectVersionFile {
    pub(crate) url: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MojangVersionManifest {
    pub(crate) versions: Vec<MojangVersionEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MojangVersionEntry {
    pub(crate) id: String,
    #[serde(rename = "type")]
    pub(crate) kind: String,
}

/// Selector contents for front ends: game releases and Fabric loaders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionCatalog {
    pub game_versions: Vec<String>,
    pub loader_versions: Vec<String>,
}

/// Facet filter: modpacks built for Fabric or Quilt.
pub(crate) fn modpack_facets() -> String {
    serde_json::json!([["project_type:modpack"], ["categories:fabric", "categories:quilt"]])
        .to_string()
}

pub(crate) fn first_file_url(versions: &[ProjectVersion]) -> Option<&str> {
    versions
        .first()
        .and_then(|version| version.files.first())
        .map(|file| file.url.as_str())
}

pub(crate) fn release_ids(manifest: &MojangVersionManifest) -> Vec<String> {
    manifest
        .versions
        .iter()
        .filter(|entry| entry.kind == "release")
        .map(|entry| entry.id.clone())
        .take(CATALOG_LIMIT)
        .collect()
}

/// reqwest-backed access to the package registry and loader metadata.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    api_timeout: Duration,
}

impl HttpClient {
    pub fn new(tuning: &NetworkTuning) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(tuning.user_agent.clone())
            .connect_timeout(Duration::from_secs(tuning.connect_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            api_timeout: Duration::from_secs(tuning.api_timeout_secs.max(1)),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        debug!(url, "metadata request");
        let response = self
            .client
            .get(url)
            .query(query)
            .timeout(self.api_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    /// Free-text modpack search. An empty term lists the registry's defaults.
    pub async fn search_modpacks(&self, term: &str) -> Result<Vec<PackSearchHit>> {
        let response: SearchResponse = self
            .get_json(
                &format!("{MODRINTH_API_BASE}/search"),
                &[
                    ("query", term.trim().to_string()),
                    ("facets", modpack_facets()),
                    ("limit", SEARCH_LIMIT.to_string()),
                ],
            )
            .await?;
        info!(term, hits = response.hits.len(), "modpack search finished");
        Ok(response.hits)
    }

    /// URL of the first file of the project's first listed version.
    pub async fn latest_pack_file_url(&self, project_id: &str) -> Result<String> {
        let versions: Vec<ProjectVersion> = self
            .get_json(&format!("{MODRINTH_API_BASE}/project/{project_id}/version"), &[])
            .await?;
        first_file_url(&versions).map(str::to_string).ok_or_else(|| {
            CoreError::NetworkFailure(format!("project {project_id} has no downloadable files"))
        })
    }

    pub async fn version_catalog(&self) -> Result<VersionCatalog> {
        let manifest: MojangVersionManifest = self.get_json(MOJANG_VERSION_MANIFEST, &[]).await?;
        let listing = self.loader_listing(LoaderKind::Fabric).await?;

        let mut loader_versions = vec![LATEST_LOADER_VERSION.to_string()];
        loader_versions.extend(
            listing
                .into_iter()
                .map(|entry| entry.version)
                .take(CATALOG_LIMIT - 1),
        );
        Ok(VersionCatalog {
            game_versions: release_ids(&manifest),
            loader_versions,
        })
    }

    async fn loader_listing(&self, kind: LoaderKind) -> Result<Vec<LoaderVersionEntry>> {
        let url = loader_listing_url(kind)
            .ok_or_else(|| CoreError::ProviderFailure(format!("{kind} has no loader versions")))?;
        self.get_json(&url, &[]).await
    }

    async fn download_to(&self, url: &str, destination: &Path) -> Result<u64> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let response = self.client.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(destination).await?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

impl AssetFetcher for HttpClient {
    fn fetch<'a>(&'a self, url: &'a str, destination: &'a Path) -> BoxFuture<'a, Result<u64>> {
        Box::pin(self.download_to(url, destination))
    }
}

impl LoaderVersionSource for HttpClient {
    fn latest_loader_version<'a>(
        &'a self,
        kind: LoaderKind,
        _game_version: &'a str,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let listing = self.loader_listing(kind).await?;
            newest_listed(kind, &listing)
        })
    }
}

impl PackSource for HttpClient {
    fn latest_pack_file_url<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(HttpClient::latest_pack_file_url(self, project_id))
    }
}
