use std::path::{Path, PathBuf};

use futures::future::BoxFuture;

use crate::core::error::Result;

/// One file to fetch: a source URL and the absolute destination path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    pub url: String,
    pub destination: PathBuf,
}

/// Writes the body behind `url` to `destination`, creating parent
/// directories, and resolves to the number of bytes written.
pub trait AssetFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str, destination: &'a Path) -> BoxFuture<'a, Result<u64>>;
}
