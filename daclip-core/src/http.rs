use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use futures::{StreamExt, TryStreamExt, stream};
use once_cell::sync::Lazy;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::hf_hub::cache_dir;
use crate::progress::Emitter;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const RANGE_CHUNK_SIZE_BYTES: u64 = 16 * 1024 * 1024;
const MAX_CONCURRENT_RANGES: usize = 8;

static HTTP_CLIENT: Lazy<ClientWithMiddleware> = Lazy::new(|| {
    ClientBuilder::new(
        reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .expect("build reqwest client"),
    )
    .with(RetryTransientMiddleware::new_with_policy(
        ExponentialBackoff::builder().build_with_max_retries(3),
    ))
    .build()
});

pub fn http_client() -> &'static ClientWithMiddleware {
    &HTTP_CLIENT
}

/// File name a URL is cached under: its last non-empty path segment.
pub fn url_file_name(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    let name = path.trim_end_matches('/').rsplit('/').next()?;
    (!name.is_empty() && !name.contains(':')).then_some(name)
}

/// Download `url` into the model cache unless it is already there.
#[tracing::instrument(level = "info")]
pub async fn http_cached(url: &str) -> anyhow::Result<PathBuf> {
    let name = url_file_name(url).with_context(|| format!("cannot derive a file name from {url}"))?;
    let target = cache_dir().join("downloads").join(name);
    if target.is_file() {
        return Ok(target);
    }

    http_download(url, &target).await?;
    Ok(target)
}

/// What a HEAD request tells us about a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Remote {
    len: Option<u64>,
    ranges: bool,
}

async fn probe(url: &str) -> anyhow::Result<Remote> {
    let head = HTTP_CLIENT
        .head(url)
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("cannot download {url}"))?;
    let headers = head.headers();
    let len = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|len| *len > 0);
    let ranges = headers
        .get(ACCEPT_RANGES)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("bytes"));
    Ok(Remote { len, ranges })
}

/// Download `url` to `target`. The body lands in a `.partial` sibling first
/// and is renamed once complete, so `target` never holds a truncated file.
pub async fn http_download(url: &str, target: &Path) -> anyhow::Result<()> {
    let parent = target
        .parent()
        .with_context(|| format!("{} has no parent directory", target.display()))?;
    tokio::fs::create_dir_all(parent).await?;
    let partial = target.with_extension("partial");

    let remote = probe(url).await?;
    let emitter = Arc::new(Mutex::new(Emitter::new(url_file_name(url).unwrap_or(url))));

    let downloaded = match remote {
        Remote {
            len: Some(len),
            ranges: true,
        } => download_ranges(url, &partial, len, &emitter).await,
        _ => {
            tracing::debug!(%url, "server does not serve byte ranges, using a single request");
            download_whole(url, &partial, remote.len, &emitter).await
        }
    };
    if let Err(err) = downloaded {
        if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
            tracing::warn!(partial = %partial.display(), "failed to remove partial download: {cleanup}");
        }
        return Err(err);
    }

    if let Ok(mut emitter) = emitter.lock() {
        emitter.complete();
    }
    tokio::fs::rename(&partial, target)
        .await
        .with_context(|| format!("failed to move download into {}", target.display()))?;
    Ok(())
}

/// Fetch `len` bytes as concurrent range requests written in place.
async fn download_ranges(
    url: &str,
    partial: &Path,
    len: u64,
    emitter: &Arc<Mutex<Emitter>>,
) -> anyhow::Result<()> {
    let file = File::create(partial)
        .await
        .with_context(|| format!("failed to create {}", partial.display()))?;
    file.set_len(len).await?;
    drop(file);

    if let Ok(mut emitter) = emitter.lock() {
        emitter.begin(len);
    }

    let ranges: Vec<(u64, u64)> = (0..len)
        .step_by(RANGE_CHUNK_SIZE_BYTES as usize)
        .map(|start| (start, (start + RANGE_CHUNK_SIZE_BYTES).min(len) - 1))
        .collect();
    tracing::debug!(%url, len, ranges = ranges.len(), "downloading via HTTP range requests");

    stream::iter(ranges)
        .map(|(start, end)| download_range(url, partial, start, end, emitter))
        .buffer_unordered(MAX_CONCURRENT_RANGES)
        .try_collect::<Vec<()>>()
        .await?;
    Ok(())
}

async fn download_range(
    url: &str,
    partial: &Path,
    start: u64,
    end: u64,
    emitter: &Arc<Mutex<Emitter>>,
) -> anyhow::Result<()> {
    let response = HTTP_CLIENT
        .get(url)
        .header(RANGE, format!("bytes={start}-{end}"))
        .send()
        .await?
        .error_for_status()?;

    let mut file = OpenOptions::new().write(true).open(partial).await?;
    file.seek(SeekFrom::Start(start)).await?;

    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("failed to read range body")?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        if let Ok(mut emitter) = emitter.lock() {
            emitter.advance(chunk.len() as u64);
        }
    }
    file.flush().await?;

    let expected = end - start + 1;
    anyhow::ensure!(
        written == expected,
        "range {start}-{end} returned {written} bytes (expected {expected})"
    );
    Ok(())
}

async fn download_whole(
    url: &str,
    partial: &Path,
    len: Option<u64>,
    emitter: &Arc<Mutex<Emitter>>,
) -> anyhow::Result<()> {
    let response = HTTP_CLIENT.get(url).send().await?.error_for_status()?;
    if let Ok(mut emitter) = emitter.lock() {
        emitter.begin(len.or(response.content_length()).unwrap_or(0));
    }

    let mut file = File::create(partial)
        .await
        .with_context(|| format!("failed to create {}", partial.display()))?;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("failed to read response body")?;
        file.write_all(&chunk).await?;
        if let Ok(mut emitter) = emitter.lock() {
            emitter.advance(chunk.len() as u64);
        }
    }
    file.flush().await?;
    Ok(())
}
