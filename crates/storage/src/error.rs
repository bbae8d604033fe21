use std::path::PathBuf;

use shared::error::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to create parent directory '{}' for database url '{database_url}': {source}", .path.display())]
    Location {
        path: PathBuf,
        database_url: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::Storage
    }
}
