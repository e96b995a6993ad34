// crates/sandbox-core/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Invalid export request: {0}")]
    InvalidRequest(String),

    #[error("Object store error: {0}")]
    Bucket(#[from] sandbox_bucket::BucketError),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV write error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("No objects matched the requested date range")]
    NoObjectsMatched,
}

pub type Result<T> = std::result::Result<T, ExportError>;
