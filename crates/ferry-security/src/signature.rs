//! Code-signature trust
//!
//! Verification is an injected capability. On macOS the default verifier asks
//! the gatekeeper (`spctl`) for an assessment; other platforms report
//! `Unknown` unless something better is supplied.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Semaphore;

use crate::error::SecurityError;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", content = "signer", rename_all = "snake_case")]
pub enum SignatureStatus {
    SignedTrusted(String),
    Unsigned,
    Invalid,
    NotApplicable,
    Unknown,
}

impl SignatureStatus {
    pub fn is_trusted(&self) -> bool {
        matches!(self, SignatureStatus::SignedTrusted(_))
    }
}

#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(&self, path: &Path) -> Result<SignatureStatus>;
}

/// Verifier for platforms without a trust mechanism.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableVerifier;

#[async_trait]
impl SignatureVerifier for UnavailableVerifier {
    async fn verify(&self, _path: &Path) -> Result<SignatureStatus> {
        Ok(SignatureStatus::Unknown)
    }
}

/// Gatekeeper assessment through the `spctl` utility.
#[derive(Debug, Clone)]
pub struct SpctlVerifier {
    program: PathBuf,
    timeout: Duration,
}

impl SpctlVerifier {
    pub const DEFAULT_PROGRAM: &'static str = "/usr/sbin/spctl";

    pub fn new(timeout: Duration) -> Self {
        Self {
            program: PathBuf::from(Self::DEFAULT_PROGRAM),
            timeout,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn assessment_args(path: &Path) -> Vec<String> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let mut args = vec!["--assess".to_string()];
        match ext.as_str() {
            "pkg" | "mpkg" => args.extend(["--type".to_string(), "install".to_string()]),
            "dmg" => args.extend([
                "--type".to_string(),
                "open".to_string(),
                "--context".to_string(),
                "context:primary-signature".to_string(),
            ]),
            _ => args.extend(["--type".to_string(), "execute".to_string()]),
        }
        args.push("-vv".to_string());
        args.push(path.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl SignatureVerifier for SpctlVerifier {
    async fn verify(&self, path: &Path) -> Result<SignatureStatus> {
        let output = tokio::process::Command::new(&self.program)
            .args(Self::assessment_args(path))
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| SecurityError::Timeout("signature verification".to_string()))?
            .map_err(|e| SecurityError::Verifier(e.to_string()))?;

        // spctl reports on stderr; stdout is normally empty
        let mut report = String::from_utf8_lossy(&output.stderr).into_owned();
        report.push_str(&String::from_utf8_lossy(&output.stdout));

        Ok(parse_assessment(&report, output.status.success()))
    }
}

/// Classify `spctl --assess -vv` output.
pub fn parse_assessment(report: &str, accepted: bool) -> SignatureStatus {
    let lower = report.to_lowercase();
    let field = |name: &str| {
        report.lines().find_map(|line| {
            line.trim()
                .strip_prefix(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
    };

    if accepted && lower.contains("accepted") {
        let signer = field("origin=")
            .or_else(|| field("source="))
            .unwrap_or_else(|| "unknown signer".to_string());
        return SignatureStatus::SignedTrusted(signer);
    }

    if lower.contains("rejected") || !accepted {
        if lower.contains("no usable signature")
            || lower.contains("not signed at all")
            || lower.contains("unsigned")
        {
            return SignatureStatus::Unsigned;
        }
        if lower.contains("rejected") || lower.contains("invalid") {
            return SignatureStatus::Invalid;
        }
    }

    SignatureStatus::Unknown
}

/// The default verifier for this platform.
pub fn platform_verifier(timeout: Duration) -> Arc<dyn SignatureVerifier> {
    if cfg!(target_os = "macos") {
        Arc::new(SpctlVerifier::new(timeout))
    } else {
        Arc::new(UnavailableVerifier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: PathBuf,
    len: u64,
    modified: Option<SystemTime>,
}

/// Caches verifier results per file and limits concurrent verifications per
/// extension class, so a burst of risky downloads doesn't fork a process each.
pub struct CachedVerifier {
    inner: Arc<dyn SignatureVerifier>,
    ttl: Duration,
    per_class_limit: usize,
    cache: Mutex<HashMap<CacheKey, (SignatureStatus, Instant)>>,
    limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl CachedVerifier {
    pub fn new(inner: Arc<dyn SignatureVerifier>, ttl: Duration, per_class_limit: usize) -> Self {
        Self {
            inner,
            ttl,
            per_class_limit: per_class_limit.max(1),
            cache: Mutex::new(HashMap::new()),
            limits: Mutex::new(HashMap::new()),
        }
    }

    fn class_limit(&self, path: &Path) -> Arc<Semaphore> {
        let class = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        self.limits
            .lock()
            .entry(class)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_class_limit)))
            .clone()
    }

    fn cached(&self, key: &CacheKey) -> Option<SignatureStatus> {
        let cache = self.cache.lock();
        cache
            .get(key)
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(status, _)| status.clone())
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|_, (_, at)| at.elapsed() < self.ttl);
        before - cache.len()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }
}

#[async_trait]
impl SignatureVerifier for CachedVerifier {
    async fn verify(&self, path: &Path) -> Result<SignatureStatus> {
        let metadata = tokio::fs::metadata(path).await?;
        let key = CacheKey {
            path: path.to_path_buf(),
            len: metadata.len(),
            modified: metadata.modified().ok(),
        };

        if let Some(status) = self.cached(&key) {
            return Ok(status);
        }

        let limit = self.class_limit(path);
        let _permit = limit
            .acquire_owned()
            .await
            .map_err(|e| SecurityError::Verifier(e.to_string()))?;

        // Another waiter may have filled the cache while we queued.
        if let Some(status) = self.cached(&key) {
            return Ok(status);
        }

        let status = self.inner.verify(path).await?;
        if status != SignatureStatus::Unknown {
            self.cache
                .lock()
                .insert(key, (status.clone(), Instant::now()));
        }
        Ok(status)
    }
}
