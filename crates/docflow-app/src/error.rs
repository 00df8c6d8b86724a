//! Application-level error type shared by the binary.

use std::path::PathBuf;

use thiserror::Error;

use crate::config;
use crate::events::{CheckpointError, SpoolError, StreamError};
use crate::paths::PathError;
use crate::server;
use crate::services::{
    ConsumerError, ExtractionError, NotifyError, ObjectStoreError, RecordStoreError,
};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error(transparent)]
    Records(#[from] RecordStoreError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Spool(#[from] SpoolError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error(transparent)]
    Server(#[from] server::ServerError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("document `{0}` not found")]
    DocumentNotFound(String),
    #[error("background task failed: {0}")]
    Task(String),
}
