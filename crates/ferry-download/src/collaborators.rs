//! External services the pipeline consults
//!
//! None of these are implemented here. Hosts plug in a reputation service,
//! a malware scanner and a confirmation UI; each is optional, and a missing
//! or unresponsive service never stalls a download.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

use ferry_security::{FileSecurityAnalysis, Severity};

use crate::confirmation::ConfirmationHandle;
use crate::download::Download;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Reputation {
    Safe,
    Unsafe { threat: String },
    Unknown,
}

#[async_trait]
pub trait ReputationChecker: Send + Sync {
    async fn check_url_safety(&self, url: &Url) -> Result<Reputation>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub is_threat: bool,
    pub severity: Severity,
    pub details: Option<String>,
    pub scanned_at: DateTime<Utc>,
}

impl ScanResult {
    pub fn clean() -> Self {
        Self {
            is_threat: false,
            severity: Severity::Info,
            details: None,
            scanned_at: Utc::now(),
        }
    }

    pub fn threat(severity: Severity, details: impl Into<String>) -> Self {
        Self {
            is_threat: true,
            severity,
            details: Some(details.into()),
            scanned_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait MalwareScanner: Send + Sync {
    async fn scan_file(&self, path: &Path, size: u64, sha256: &str) -> Result<ScanResult>;
}

/// Everything a warning dialog needs. The dialog answers through `handle`.
#[derive(Debug, Clone)]
pub struct ConfirmationPrompt {
    pub download: Download,
    pub analysis: Option<FileSecurityAnalysis>,
    pub scan_result: Option<ScanResult>,
    pub handle: ConfirmationHandle,
}

pub trait ConfirmationPresenter: Send + Sync {
    fn present(&self, prompt: ConfirmationPrompt);
}
