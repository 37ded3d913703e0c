//! Security error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("Signature verifier failed: {0}")]
    Verifier(String),

    #[error("Malformed provenance metadata: {0}")]
    MalformedMetadata(String),
}
