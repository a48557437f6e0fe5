use std::{io::Cursor, path::Path};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use image::ImageFormat;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::{app::AppResources, result::CommandError, version};

const INDEX_HTML: &str = include_str!("../ui/index.html");
const EXAMPLE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp"];
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct ApiState {
    resources: AppResources,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        if err.is_client_error() {
            Self::bad_request(err.to_string())
        } else {
            Self::internal(format!("{err:#}"))
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, "{}", self.message);
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn build_router(resources: AppResources) -> Router {
    let state = ApiState { resources };

    Router::new()
        .route("/", get(index))
        .route("/api/app_version", get(app_version))
        .route("/api/device", get(device))
        .route("/api/examples", get(examples))
        .route("/api/examples/{name}", get(example))
        .route("/api/restore", post(restore))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::very_permissive())
}

pub async fn serve(listener: TcpListener, resources: AppResources) -> Result<()> {
    let router = build_router(resources);
    tracing::info!("HTTP server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn app_version() -> impl IntoResponse {
    Json(version::current().to_string())
}

async fn device(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.resources.ml_device.to_string())
}

async fn examples(State(state): State<ApiState>) -> ApiResult<Json<Vec<String>>> {
    let names = list_examples(&state.resources.examples)
        .await
        .map_err(CommandError::from)?;
    Ok(Json(names))
}

async fn example(
    State(state): State<ApiState>,
    UrlPath(name): UrlPath<String>,
) -> ApiResult<Response> {
    let dir = &state.resources.examples;
    // only names we listed ourselves are served
    let names = list_examples(dir).await.map_err(CommandError::from)?;
    if !names.contains(&name) {
        return Err(ApiError::not_found(format!("no example named {name}")));
    }

    let bytes = tokio::fs::read(dir.join(&name))
        .await
        .map_err(CommandError::from)?;
    let mime = ImageFormat::from_path(&name)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream");
    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}

async fn restore(State(state): State<ApiState>, mut multipart: Multipart) -> ApiResult<Response> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("image") {
            upload = Some(field.bytes().await?);
            break;
        }
    }

    let bytes = upload
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| ApiError::bad_request("expected a non-empty multipart field `image`"))?;
    let png = restore_bytes(&state.resources, bytes).await?;

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

/// Decode an uploaded image, restore it and encode the result as PNG.
pub async fn restore_bytes(resources: &AppResources, bytes: Bytes) -> crate::result::Result<Vec<u8>> {
    let image = image::load_from_memory(&bytes)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(CommandError::BadRequest("image has no pixels".to_string()));
    }

    let _permit = resources
        .queue
        .acquire()
        .await
        .context("restoration queue closed")?;
    let restorer = resources.restorer.clone();
    let restored = tokio::task::spawn_blocking(move || restorer.restore(&image)).await??;

    let mut png = Vec::new();
    restored
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("failed to encode restored image")?;
    Ok(png)
}

/// Image files directly inside `dir`, sorted by name. A missing directory
/// has no examples.
pub async fn list_examples(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let supported = Path::new(&name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| EXAMPLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if supported {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_only_images() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("b.PNG"), b"x")?;
        std::fs::write(dir.path().join("a.jpg"), b"x")?;
        std::fs::write(dir.path().join("notes.txt"), b"x")?;
        std::fs::create_dir(dir.path().join("nested.png"))?;

        assert_eq!(list_examples(dir.path()).await?, vec!["a.jpg", "b.PNG"]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_directory_has_no_examples() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(list_examples(&dir.path().join("absent")).await?.is_empty());
        Ok(())
    }

    #[test]
    fn command_errors_pick_status() {
        let err: ApiError = CommandError::BadRequest("empty".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err: ApiError = CommandError::Anyhow(anyhow::anyhow!("device lost")).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
