use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Telegram request error: {0}")]
    Telegram(#[from] teloxide::RequestError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Session storage error: {0}")]
    Storage(#[from] tokio_rusqlite::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Download failed with status {0}")]
    DownloadStatus(reqwest::StatusCode),

    #[error("Download produced an empty file")]
    EmptyDownload,

    #[error("{tool} failed: {detail}")]
    Tool { tool: &'static str, detail: String },

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl AppError {
    pub fn tool(tool: &'static str, detail: impl Into<String>) -> Self {
        AppError::Tool {
            tool,
            detail: detail.into(),
        }
    }
}
