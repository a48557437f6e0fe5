use std::path::PathBuf;

use hf_hub::{
    Cache, Repo,
    api::tokio::{Api, ApiBuilder},
};
use once_cell::sync::{Lazy, OnceCell};
use tracing::Instrument;

use crate::progress::Emitter;

static CACHE_DIR: OnceCell<PathBuf> = OnceCell::new();

static HF_API: Lazy<Api> = Lazy::new(|| {
    ApiBuilder::new()
        .with_cache_dir(cache_dir().to_path_buf())
        .high()
        .build()
        .expect("build HF API client")
});
static HF_CACHE: Lazy<Cache> = Lazy::new(|| Cache::new(cache_dir().to_path_buf()));

pub fn cache_dir() -> &'static PathBuf {
    CACHE_DIR.get_or_init(|| {
        dirs::cache_dir()
            .unwrap_or_default()
            .join("daclip")
            .join("models")
    })
}

pub fn set_cache_dir(path: PathBuf) -> anyhow::Result<()> {
    CACHE_DIR
        .set(path)
        .map_err(|_| anyhow::anyhow!("cache dir has already been set"))
}

pub fn repo(name: &str) -> Repo {
    Repo::model(name.to_string())
}

/// Fetch a file from the Hugging Face Hub, returning the path inside the cache.
pub async fn hf_download(repo_name: &str, filename: &str) -> anyhow::Result<PathBuf> {
    let hf_repo = repo(repo_name);
    if let Some(path) = HF_CACHE.repo(hf_repo.clone()).get(filename) {
        return Ok(path);
    }

    let path = HF_API
        .repo(hf_repo)
        .download_with_progress(filename, Emitter::new(filename))
        .instrument(tracing::info_span!("hf_download", repo = repo_name, filename))
        .await?;

    Ok(path)
}
