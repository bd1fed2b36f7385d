use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Token signing error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("AWS SDK S3 error: {0}")]
    S3Sdk(String),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Command execution failed: {stderr}")]
    Command { stdout: String, stderr: String },

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// Wraps any AWS SDK error, keeping the full source chain in the message.
    pub fn s3<E>(err: aws_sdk_s3::error::SdkError<E>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        AppError::S3Sdk(aws_sdk_s3::error::DisplayErrorContext(&err).to_string())
    }

    /// True for errors raised before any I/O because the caller's input was unusable.
    pub fn is_configuration(&self) -> bool {
        matches!(self, AppError::Config(_) | AppError::InvalidInput(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
