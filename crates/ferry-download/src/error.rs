//! Download error types

use thiserror::Error;

use crate::download::{DownloadEvent, DownloadStatus};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Download not found: {0}")]
    NotFound(String),

    #[error("Cannot apply {event} to a download that is {from}")]
    InvalidTransition {
        from: DownloadStatus,
        event: DownloadEvent,
    },

    #[error("Download {0} is not awaiting confirmation")]
    NotAwaitingConfirmation(String),

    #[error("Download {0} has no completed file")]
    NotCompleted(String),

    #[error("Storage error: {0}")]
    Storage(#[from] ferry_storage::StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {0}")]
    Http(u16),

    #[error("Transfer ended after {received} of {expected} bytes")]
    Incomplete { expected: u64, received: u64 },

    #[error("Download cancelled")]
    Cancelled,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}
