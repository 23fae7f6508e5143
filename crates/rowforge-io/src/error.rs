use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed uri '{uri}': {reason}")]
    Uri { uri: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
