use thiserror::Error;

pub type Result<T> = std::result::Result<T, SkiffError>;

#[derive(Debug, Error)]
pub enum SkiffError {
    #[error("invalid content identifier: {0}")]
    InvalidCid(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("unauthorized: missing or invalid token")]
    Unauthorized,

    #[error("rate limited: too many failed requests, retry later")]
    RateLimited,

    #[error("transient error: {0}")]
    Transient(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
