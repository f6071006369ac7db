use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlugError {
    #[error("Missing document slug")]
    Missing,
    #[error("Invalid document slug: {0}")]
    Invalid(String),
    #[error("Resolved path {} escapes its content root", .0.display())]
    Escape(PathBuf),
    #[error("Slug {0} is reserved")]
    Reserved(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("Timed out waiting for the index connection")]
    Busy,
    #[error("Index did not answer within {0:?}")]
    IndexUnavailable(std::time::Duration),
    #[error("Index store is closed")]
    Closed,
    #[error("Failed to encode links: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error(transparent)]
    Slug(#[from] SlugError),
    #[error("Invalid front matter: {0}")]
    Metadata(String),
    #[error("Document {0} not found")]
    NotFound(String),
    #[error("Slug {0} is already used by another document")]
    SlugTaken(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error("Invalid backup file name: {0}")]
    InvalidFileName(String),
    #[error("Backup secret at {} is unusable: {reason}", path.display())]
    Secret { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("A restore is already pending")]
    Conflict,
    #[error("Backup signature verification failed for {0}")]
    Verification(String),
    #[error("Backup is missing content or database")]
    Incompatible,
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
