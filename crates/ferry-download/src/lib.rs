//! Ferry Download Orchestration
//!
//! - Explicit state machine for every download
//! - Reputation, risk analysis and malware scanning around the transfer
//! - User confirmation gate for risky files
//! - Pause/resume with HTTP range requests
//! - Content hashing, provenance tagging and a bounded history

mod collaborators;
mod confirmation;
mod download;
mod error;
mod files;
mod history;
mod orchestrator;
mod settings;
mod transport;

pub use collaborators::{
    ConfirmationPresenter, ConfirmationPrompt, MalwareScanner, Reputation, ReputationChecker,
    ScanResult,
};
pub use confirmation::{ConfirmationHandle, Decision};
pub use download::{Download, DownloadEvent, DownloadStatus};
pub use error::DownloadError;
pub use files::{compute_sha256_hex, partial_path, sanitize_file_name, PARTIAL_SUFFIX};
pub use history::{HistoryEntry, HistoryLedger, HISTORY_CAPACITY};
pub use orchestrator::{DownloadOrchestrator, DownloadRequest, Services};
pub use settings::DownloadSettings;
pub use transport::{
    ChunkStream, HttpTransport, ResourceInfo, TransferStream, Transport,
    DEFAULT_CONNECTIONS_PER_HOST,
};

pub type Result<T> = std::result::Result<T, DownloadError>;
