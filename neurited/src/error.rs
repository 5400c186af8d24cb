use neurite::error::SubstrateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("paths: {0}")]
    Paths(String),

    #[error("invalid daemon config: {0}")]
    Config(String),
}
