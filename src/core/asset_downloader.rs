use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

use crate::core::downloader::{AssetFetcher, DownloadItem};
use crate::core::error::Result;

/// Fetches `items` with at most `concurrency` transfers in flight.
///
/// Completions are observed in input order, so `on_progress` receives a
/// monotonically growing `(completed, total)` pair. A concurrency of 1 is a
/// strictly sequential download in manifest order. The first failure stops
/// the whole batch; files already written stay on disk.
pub(crate) async fn download_in_order<F, P>(
    fetcher: &F,
    items: &[DownloadItem],
    concurrency: usize,
    mut on_progress: P,
) -> Result<u64>
where
    F: AssetFetcher + ?Sized,
    P: FnMut(usize, usize),
{
    let total = items.len();
    if total == 0 {
        return Ok(0);
    }

    let mut completed = 0usize;
    let mut bytes = 0u64;
    let pending: Vec<_> = items.iter().map(|item| fetch_one(fetcher, item)).collect();
    let mut transfers = stream::iter(pending).buffered(concurrency.max(1));

    while let Some(written) = transfers.try_next().await? {
        completed += 1;
        bytes += written;
        on_progress(completed, total);
    }

    Ok(bytes)
}

async fn fetch_one<F>(fetcher: &F, item: &DownloadItem) -> Result<u64>
where
    F: AssetFetcher + ?Sized,
{
    let written = fetcher.fetch(&item.url, &item.destination).await?;
    debug!(url = %item.url, written, "asset downloaded");
    Ok(written)
}
