//! Download data structure and state machine
//!
//! ```text
//! Initiated ──reputation──▶ RiskAnalyzing ──accepted──▶ Transferring ◀──▶ Paused
//!     │ unsafe                 │ blocked  │ warn              │ complete
//!     ▼                        ▼          ▼                   ▼
//!  Blocked ◀───────────────────┘   AwaitingConfirmation ◀── PostValidating
//!                                         │ proceed           │ clean
//!                                         ▼                   ▼
//!                            Transferring / Quarantining ──▶ Completed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

use ferry_security::{FileSecurityAnalysis, ProvenanceRecord};

use crate::collaborators::ScanResult;
use crate::error::DownloadError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Created, reputation check pending
    Initiated,
    /// A completed file is being re-scanned
    SafetyChecking,
    RiskAnalyzing,
    /// Suspended until the user proceeds or cancels
    AwaitingConfirmation,
    Transferring,
    Paused,
    /// Hashing and malware scan of the transferred file
    PostValidating,
    /// Applying provenance metadata
    Quarantining,
    Completed,
    Blocked,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub const ALL: [DownloadStatus; 12] = [
        DownloadStatus::Initiated,
        DownloadStatus::SafetyChecking,
        DownloadStatus::RiskAnalyzing,
        DownloadStatus::AwaitingConfirmation,
        DownloadStatus::Transferring,
        DownloadStatus::Paused,
        DownloadStatus::PostValidating,
        DownloadStatus::Quarantining,
        DownloadStatus::Completed,
        DownloadStatus::Blocked,
        DownloadStatus::Failed,
        DownloadStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Initiated => "initiated",
            DownloadStatus::SafetyChecking => "safety_checking",
            DownloadStatus::RiskAnalyzing => "risk_analyzing",
            DownloadStatus::AwaitingConfirmation => "awaiting_confirmation",
            DownloadStatus::Transferring => "transferring",
            DownloadStatus::Paused => "paused",
            DownloadStatus::PostValidating => "post_validating",
            DownloadStatus::Quarantining => "quarantining",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Blocked => "blocked",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    /// The pipeline for this download has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed
                | DownloadStatus::Blocked
                | DownloadStatus::Failed
                | DownloadStatus::Cancelled
        )
    }

    /// The single successor for `event`, or `None` when the event is not
    /// accepted in this state.
    pub fn next(self, event: DownloadEvent) -> Option<DownloadStatus> {
        use DownloadEvent as E;
        use DownloadStatus as S;

        match (self, event) {
            (S::Initiated, E::ReputationSafe | E::ReputationUnknown) => Some(S::RiskAnalyzing),
            (S::Initiated, E::ReputationUnsafe) => Some(S::Blocked),
            (S::Initiated, E::UserCancelled) => Some(S::Cancelled),

            (S::RiskAnalyzing, E::PolicyBlocked) => Some(S::Blocked),
            (S::RiskAnalyzing, E::ConfirmationRequired) => Some(S::AwaitingConfirmation),
            (S::RiskAnalyzing, E::RiskAccepted) => Some(S::Transferring),
            (S::RiskAnalyzing, E::UserCancelled) => Some(S::Cancelled),

            (S::AwaitingConfirmation, E::UserProceeded) => Some(S::Transferring),
            (S::AwaitingConfirmation, E::ProceedDespiteThreat) => Some(S::Quarantining),
            (S::AwaitingConfirmation, E::UserCancelled) => Some(S::Cancelled),

            (S::Transferring, E::Pause) => Some(S::Paused),
            (S::Transferring, E::TransferFailed) => Some(S::Failed),
            (S::Transferring, E::UserCancelled) => Some(S::Cancelled),
            (S::Transferring, E::TransferCompleted) => Some(S::PostValidating),

            (S::Paused, E::Resume) => Some(S::Transferring),
            (S::Paused, E::UserCancelled) => Some(S::Cancelled),

            (S::PostValidating, E::ThreatDetected) => Some(S::AwaitingConfirmation),
            (S::PostValidating, E::ScanClean) => Some(S::Quarantining),
            (S::PostValidating, E::ValidationFailed) => Some(S::Failed),

            (S::Quarantining, E::TaggingFinished) => Some(S::Completed),

            (S::Completed, E::RescanStarted) => Some(S::SafetyChecking),
            (S::SafetyChecking, E::ThreatDetected) => Some(S::AwaitingConfirmation),
            (S::SafetyChecking, E::ScanClean) => Some(S::Completed),

            _ => None,
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        DownloadStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("Unknown download status: {}", s))
    }
}

/// Everything that can move a download between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadEvent {
    ReputationSafe,
    ReputationUnsafe,
    ReputationUnknown,
    PolicyBlocked,
    ConfirmationRequired,
    RiskAccepted,
    UserProceeded,
    /// Proceed after the scanner flagged the already-transferred file
    ProceedDespiteThreat,
    UserCancelled,
    Pause,
    Resume,
    TransferFailed,
    TransferCompleted,
    ThreatDetected,
    ScanClean,
    ValidationFailed,
    TaggingFinished,
    RescanStarted,
}

impl DownloadEvent {
    pub const ALL: [DownloadEvent; 18] = [
        DownloadEvent::ReputationSafe,
        DownloadEvent::ReputationUnsafe,
        DownloadEvent::ReputationUnknown,
        DownloadEvent::PolicyBlocked,
        DownloadEvent::ConfirmationRequired,
        DownloadEvent::RiskAccepted,
        DownloadEvent::UserProceeded,
        DownloadEvent::ProceedDespiteThreat,
        DownloadEvent::UserCancelled,
        DownloadEvent::Pause,
        DownloadEvent::Resume,
        DownloadEvent::TransferFailed,
        DownloadEvent::TransferCompleted,
        DownloadEvent::ThreatDetected,
        DownloadEvent::ScanClean,
        DownloadEvent::ValidationFailed,
        DownloadEvent::TaggingFinished,
        DownloadEvent::RescanStarted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadEvent::ReputationSafe => "reputation_safe",
            DownloadEvent::ReputationUnsafe => "reputation_unsafe",
            DownloadEvent::ReputationUnknown => "reputation_unknown",
            DownloadEvent::PolicyBlocked => "policy_blocked",
            DownloadEvent::ConfirmationRequired => "confirmation_required",
            DownloadEvent::RiskAccepted => "risk_accepted",
            DownloadEvent::UserProceeded => "user_proceeded",
            DownloadEvent::ProceedDespiteThreat => "proceed_despite_threat",
            DownloadEvent::UserCancelled => "user_cancelled",
            DownloadEvent::Pause => "pause",
            DownloadEvent::Resume => "resume",
            DownloadEvent::TransferFailed => "transfer_failed",
            DownloadEvent::TransferCompleted => "transfer_completed",
            DownloadEvent::ThreatDetected => "threat_detected",
            DownloadEvent::ScanClean => "scan_clean",
            DownloadEvent::ValidationFailed => "validation_failed",
            DownloadEvent::TaggingFinished => "tagging_finished",
            DownloadEvent::RescanStarted => "rescan_started",
        }
    }
}

impl std::fmt::Display for DownloadEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    pub id: String,
    pub source_url: String,
    pub referrer: Option<String>,
    pub destination_path: String,
    pub suggested_filename: String,
    pub mime_type: Option<String>,
    pub status: DownloadStatus,
    /// Every status this download has been in, oldest first
    pub status_history: Vec<DownloadStatus>,
    pub bytes_transferred: u64,
    pub bytes_expected: Option<u64>,
    /// Bytes per second, smoothed. Informational only.
    pub rate: f64,
    pub security_analysis: Option<FileSecurityAnalysis>,
    pub scan_result: Option<ScanResult>,
    pub provenance_record: Option<ProvenanceRecord>,
    pub content_hash: Option<String>,
    pub security_validated: bool,
    pub error: Option<String>,
    pub history_recorded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    last_sample: Option<(Instant, u64)>,
}

impl Download {
    pub fn new(
        source_url: String,
        destination_path: String,
        suggested_filename: String,
        referrer: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            source_url,
            referrer,
            destination_path,
            suggested_filename,
            mime_type: None,
            status: DownloadStatus::Initiated,
            status_history: vec![DownloadStatus::Initiated],
            bytes_transferred: 0,
            bytes_expected: None,
            rate: 0.0,
            security_analysis: None,
            scan_result: None,
            provenance_record: None,
            content_hash: None,
            security_validated: false,
            error: None,
            history_recorded: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_sample: None,
        }
    }

    /// Apply `event`, rejecting it if the current state doesn't accept it.
    pub fn apply(&mut self, event: DownloadEvent) -> Result<DownloadStatus> {
        let next = self
            .status
            .next(event)
            .ok_or(DownloadError::InvalidTransition {
                from: self.status,
                event,
            })?;

        self.status = next;
        self.status_history.push(next);
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
            self.rate = 0.0;
        }
        Ok(next)
    }

    /// Record transfer progress. Stale (smaller) counts are ignored so
    /// `bytes_transferred` never moves backward.
    pub fn record_progress(&mut self, bytes: u64) -> bool {
        if bytes < self.bytes_transferred {
            return false;
        }

        let now = Instant::now();
        if let Some((at, previous)) = self.last_sample {
            let elapsed = now.duration_since(at).as_secs_f64();
            if elapsed > 0.0 {
                let instant_rate = (bytes - previous) as f64 / elapsed;
                self.rate = if self.rate == 0.0 {
                    instant_rate
                } else {
                    self.rate * 0.7 + instant_rate * 0.3
                };
            }
        }
        self.last_sample = Some((now, bytes));
        self.bytes_transferred = bytes;
        self.updated_at = Utc::now();
        true
    }

    /// Progress as percentage (0-100)
    pub fn progress(&self) -> f64 {
        match self.bytes_expected {
            Some(total) if total > 0 => {
                (self.bytes_transferred as f64 / total as f64 * 100.0).min(100.0)
            }
            _ => 0.0,
        }
    }

    /// Shown with a proceed action.
    pub fn can_proceed(&self) -> bool {
        self.status == DownloadStatus::AwaitingConfirmation
    }

    pub fn file_name(&self) -> &str {
        std::path::Path::new(&self.destination_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.suggested_filename)
    }
}
