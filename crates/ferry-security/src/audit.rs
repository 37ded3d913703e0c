//! Security audit events
//!
//! Every security-relevant decision is reported to an [`AuditSink`].
//! Sinks are fire-and-forget: they never fail the caller.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::analyzer::RiskLevel;

pub const AUDIT_TARGET: &str = "ferry::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    /// A download was refused by reputation or policy, or its file removed.
    ThreatBlocked,
    /// A non-safe verdict that the user was warned about.
    DownloadWarning,
    /// The user chose to proceed past a warning.
    UserOverride,
    /// A protective service was unavailable or returned garbage.
    SuspiciousActivity,
    /// The malware scanner flagged a transferred file.
    MalwareDetected,
    DownloadFailed,
    ProvenanceTagged,
    ProvenanceInspected,
    ProvenanceRemoved,
    ProvenanceRemovalRefused,
    ProvenanceError,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::ThreatBlocked => "threat blocked",
            SecurityEventKind::DownloadWarning => "download warning",
            SecurityEventKind::UserOverride => "user override",
            SecurityEventKind::SuspiciousActivity => "suspicious activity",
            SecurityEventKind::MalwareDetected => "malware detected",
            SecurityEventKind::DownloadFailed => "download failed",
            SecurityEventKind::ProvenanceTagged => "provenance tagged",
            SecurityEventKind::ProvenanceInspected => "provenance inspected",
            SecurityEventKind::ProvenanceRemoved => "provenance removed",
            SecurityEventKind::ProvenanceRemovalRefused => "provenance removal refused",
            SecurityEventKind::ProvenanceError => "provenance error",
        }
    }
}

impl std::fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl From<RiskLevel> for Severity {
    fn from(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Safe => Severity::Info,
            RiskLevel::Low => Severity::Low,
            RiskLevel::Medium => Severity::Medium,
            RiskLevel::High => Severity::High,
            RiskLevel::Critical => Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub file_name: String,
    pub source_url: Option<String>,
    pub severity: Severity,
    pub details: String,
    pub occurred_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, file_name: impl Into<String>, severity: Severity) -> Self {
        Self {
            kind,
            file_name: file_name.into(),
            source_url: None,
            severity,
            details: String::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn log_security_event(&self, event: SecurityEvent);
}

/// Writes events as structured `tracing` records on the audit target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log_security_event(&self, event: SecurityEvent) {
        let url = event.source_url.as_deref().unwrap_or("-");
        match event.severity {
            Severity::Info | Severity::Low => tracing::info!(
                target: AUDIT_TARGET,
                kind = %event.kind,
                file = %event.file_name,
                url = %url,
                severity = event.severity.as_str(),
                "{}",
                event.details
            ),
            Severity::Medium | Severity::High => tracing::warn!(
                target: AUDIT_TARGET,
                kind = %event.kind,
                file = %event.file_name,
                url = %url,
                severity = event.severity.as_str(),
                "{}",
                event.details
            ),
            Severity::Critical => tracing::error!(
                target: AUDIT_TARGET,
                kind = %event.kind,
                file = %event.file_name,
                url = %url,
                severity = event.severity.as_str(),
                "{}",
                event.details
            ),
        }
    }
}

/// Keeps events in memory, for inspection by UI panels and tests.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: SecurityEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

impl AuditSink for RecordingAuditSink {
    fn log_security_event(&self, event: SecurityEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink() {
        let sink = RecordingAuditSink::new();
        sink.log_security_event(
            SecurityEvent::new(SecurityEventKind::ThreatBlocked, "payload.scr", Severity::Critical)
                .with_source_url("https://bad.example/payload.scr")
                .with_details("blocked by policy"),
        );
        sink.log_security_event(SecurityEvent::new(
            SecurityEventKind::ProvenanceTagged,
            "photo.jpg",
            Severity::Info,
        ));

        assert_eq!(sink.count(SecurityEventKind::ThreatBlocked), 1);
        assert_eq!(sink.count(SecurityEventKind::UserOverride), 0);

        let events = sink.events();
        assert_eq!(events[0].kind.as_str(), "threat blocked");
        assert_eq!(
            events[0].source_url.as_deref(),
            Some("https://bad.example/payload.scr")
        );
    }

    #[test]
    fn test_severity_from_risk() {
        assert_eq!(Severity::from(RiskLevel::Safe), Severity::Info);
        assert_eq!(Severity::from(RiskLevel::Critical), Severity::Critical);
        assert!(Severity::from(RiskLevel::High) > Severity::Medium);
    }
}
