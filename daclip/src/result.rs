#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    File(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error("unsupported image: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Multipart(#[from] axum::extract::multipart::MultipartError),

    #[error("restoration task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    BadRequest(String),
}

impl CommandError {
    /// Whether the caller sent something unusable, as opposed to a failure on our side.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CommandError::Image(_) | CommandError::Multipart(_) | CommandError::BadRequest(_)
        )
    }
}

impl serde::Serialize for CommandError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CommandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_client_errors() {
        assert!(CommandError::BadRequest("missing field".into()).is_client_error());
        assert!(!CommandError::Anyhow(anyhow::anyhow!("boom")).is_client_error());

        let json = serde_json::to_string(&CommandError::BadRequest("nope".into())).unwrap();
        assert_eq!(json, "\"nope\"");
    }
}
