//! Ferry Core
//!
//! Wires storage, download security and the download orchestrator into one
//! `Ferry` container, and sets up logging.

mod config;
mod error;
mod ferry;

pub use config::Config;
pub use error::CoreError;
pub use ferry::{Collaborators, Ferry, MaintenanceReport};

pub use ferry_download::{
    ConfirmationHandle, ConfirmationPresenter, ConfirmationPrompt, Decision, Download,
    DownloadError, DownloadEvent, DownloadOrchestrator, DownloadRequest, DownloadSettings,
    DownloadStatus, HistoryEntry, MalwareScanner, Reputation, ReputationChecker, ScanResult,
};
pub use ferry_security::{
    FileSecurityAnalysis, ProvenanceRecord, RiskLevel, SecurityEvent, SecurityEventKind,
    SecurityPolicy, Severity, SignatureStatus,
};
pub use ferry_storage::{Database, StorageError};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
