use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error: {0}")]
    Server(#[from] hyper::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported source: {0}")]
    UnsupportedSource(String),

    #[error("Source not configured: {0}")]
    Unconfigured(String),

    #[error("Job setup failed: {0}")]
    Setup(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl AppError {
    /// HTTP status code this error surfaces as at the request boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::InvalidUrl(_)
            | AppError::UnsupportedSource(_)
            | AppError::Unconfigured(_)
            | AppError::Validation(_) => 400,
            AppError::NotFound(_) => 404,
            _ => 500,
        }
    }

    /// Message safe to hand back to a client. Internal failures collapse to a
    /// generic string; their detail only goes to the log.
    pub fn client_message(&self) -> String {
        match self.status_code() {
            500 => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
