use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::{hf_hub::hf_download, http::http_cached};

const HF_SCHEME: &str = "hf://";

/// Where a set of pretrained weights lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModelSource {
    /// A file on disk.
    Local(PathBuf),
    /// `hf://<owner>/<repo>/<filename>` on the Hugging Face Hub.
    Hub { repo: String, filename: String },
    /// A plain `http(s)://` download.
    Url(String),
}

impl ModelSource {
    /// Make sure the weights are on disk and return their path.
    pub async fn resolve(&self) -> anyhow::Result<PathBuf> {
        match self {
            ModelSource::Local(path) => {
                if !path.is_file() {
                    bail!("model weights not found at {}", path.display());
                }
                Ok(path.clone())
            }
            ModelSource::Hub { repo, filename } => hf_download(repo, filename)
                .await
                .with_context(|| format!("failed to fetch {filename} from {repo}")),
            ModelSource::Url(url) => http_cached(url).await,
        }
    }
}

impl FromStr for ModelSource {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            bail!("model source must not be empty");
        }

        if let Some(rest) = value.strip_prefix(HF_SCHEME) {
            let mut parts = rest.splitn(3, '/');
            let (Some(owner), Some(name), Some(filename)) = (parts.next(), parts.next(), parts.next())
            else {
                bail!("expected hf://<owner>/<repo>/<filename>, got {value}");
            };
            if owner.is_empty() || name.is_empty() || filename.is_empty() {
                bail!("expected hf://<owner>/<repo>/<filename>, got {value}");
            }
            return Ok(ModelSource::Hub {
                repo: format!("{owner}/{name}"),
                filename: filename.to_string(),
            });
        }

        if value.starts_with("http://") || value.starts_with("https://") {
            return Ok(ModelSource::Url(value.to_string()));
        }

        Ok(ModelSource::Local(expand_home(Path::new(value))))
    }
}

impl TryFrom<String> for ModelSource {
    type Error = anyhow::Error;

    fn try_from(value: String) -> anyhow::Result<Self> {
        value.parse()
    }
}

impl From<ModelSource> for String {
    fn from(source: ModelSource) -> Self {
        source.to_string()
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Local(path) => write!(f, "{}", path.display()),
            ModelSource::Hub { repo, filename } => write!(f, "{HF_SCHEME}{repo}/{filename}"),
            ModelSource::Url(url) => f.write_str(url),
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hub_sources() -> anyhow::Result<()> {
        let source: ModelSource = "hf://someone/daclip/weights/daclip_ViT-B-32.pt".parse()?;
        assert_eq!(
            source,
            ModelSource::Hub {
                repo: "someone/daclip".to_string(),
                filename: "weights/daclip_ViT-B-32.pt".to_string(),
            }
        );
        assert_eq!(source.to_string(), "hf://someone/daclip/weights/daclip_ViT-B-32.pt");
        Ok(())
    }

    #[test]
    fn rejects_incomplete_hub_sources() {
        assert!("hf://someone/daclip".parse::<ModelSource>().is_err());
        assert!("hf://someone//file.pt".parse::<ModelSource>().is_err());
        assert!("   ".parse::<ModelSource>().is_err());
    }

    #[test]
    fn parses_urls_and_paths() -> anyhow::Result<()> {
        let url: ModelSource = "https://example.com/universal-ir.pth".parse()?;
        assert_eq!(url, ModelSource::Url("https://example.com/universal-ir.pth".to_string()));

        let local: ModelSource = "pretrained/universal-ir.pth".parse()?;
        assert_eq!(
            local,
            ModelSource::Local(PathBuf::from("pretrained/universal-ir.pth"))
        );
        Ok(())
    }

    #[test]
    fn expands_home_directory() -> anyhow::Result<()> {
        let Some(home) = dirs::home_dir() else {
            return Ok(());
        };
        let local: ModelSource = "~/weights/daclip.pt".parse()?;
        assert_eq!(local, ModelSource::Local(home.join("weights/daclip.pt")));
        Ok(())
    }

    #[tokio::test]
    async fn missing_local_file_fails_to_resolve() {
        let source = ModelSource::Local(PathBuf::from("/definitely/not/here.safetensors"));
        assert!(source.resolve().await.is_err());
    }
}
