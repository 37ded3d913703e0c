//! Provenance tagging (quarantine)
//!
//! Marks downloaded files with where they came from, so the OS gatekeeper
//! and later tooling treat them as untrusted. The quarantine attribute uses
//! the `flags;timestamp;agent;event` layout macOS expects; origin and
//! referrer URLs go in the freedesktop `user.xdg.*` attributes.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::analyzer::SecurityPolicy;
use crate::attributes::AttributeStore;
use crate::audit::{AuditSink, SecurityEvent, SecurityEventKind, Severity};
use crate::classifier::is_gatekept_extension;
use crate::error::SecurityError;
use crate::signature::{SignatureStatus, SignatureVerifier};

#[cfg(target_os = "macos")]
pub const QUARANTINE_ATTR: &str = "com.apple.quarantine";
#[cfg(not(target_os = "macos"))]
pub const QUARANTINE_ATTR: &str = "user.ferry.quarantine";

pub const ORIGIN_URL_ATTR: &str = "user.xdg.origin.url";
pub const REFERRER_URL_ATTR: &str = "user.xdg.referrer.url";

/// Quarantine flags for a file fetched by a web browser.
pub const WEB_DOWNLOAD_FLAGS: u16 = 0x0081;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagType {
    WebDownload,
    Other(u16),
}

impl TagType {
    fn from_flags(flags: u16) -> Self {
        if flags == WEB_DOWNLOAD_FLAGS {
            TagType::WebDownload
        } else {
            TagType::Other(flags)
        }
    }
}

/// Parsed quarantine attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineValue {
    pub flags: u16,
    pub tagged_at: DateTime<Utc>,
    pub agent: String,
    pub event_id: String,
}

impl QuarantineValue {
    pub fn web_download(agent: &str) -> Self {
        Self {
            flags: WEB_DOWNLOAD_FLAGS,
            tagged_at: Utc::now(),
            agent: agent.replace(';', "_"),
            event_id: Uuid::new_v4().to_string().to_uppercase(),
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{:04x};{:08x};{};{}",
            self.flags,
            self.tagged_at.timestamp().max(0),
            self.agent,
            self.event_id
        )
    }

    pub fn parse(raw: &str) -> Result<Self, SecurityError> {
        let mut parts = raw.trim_end_matches('\0').splitn(4, ';');
        let malformed = || SecurityError::MalformedMetadata(raw.to_string());

        let flags = parts
            .next()
            .and_then(|f| u16::from_str_radix(f, 16).ok())
            .ok_or_else(malformed)?;
        let tagged_at = parts
            .next()
            .and_then(|t| i64::from_str_radix(t, 16).ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(malformed)?;
        let agent = parts.next().unwrap_or_default().to_string();
        let event_id = parts.next().unwrap_or_default().to_string();

        Ok(Self {
            flags,
            tagged_at,
            agent,
            event_id,
        })
    }
}

/// What is known about a file's origin and trust.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub is_tagged: bool,
    pub tag_type: Option<TagType>,
    pub source_url: Option<String>,
    pub referrer_url: Option<String>,
    pub agent_identity: Option<String>,
    pub tagged_at: Option<DateTime<Utc>>,
    pub can_remove_safely: bool,
    pub signature_status: SignatureStatus,
}

impl ProvenanceRecord {
    fn untagged(signature_status: SignatureStatus) -> Self {
        Self {
            is_tagged: false,
            tag_type: None,
            source_url: None,
            referrer_url: None,
            agent_identity: None,
            tagged_at: None,
            can_remove_safely: removal_is_safe(&signature_status),
            signature_status,
        }
    }
}

fn removal_is_safe(status: &SignatureStatus) -> bool {
    match status {
        SignatureStatus::NotApplicable => true,
        other => other.is_trusted(),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub struct ProvenanceTagger {
    store: Arc<dyn AttributeStore>,
    verifier: Arc<dyn SignatureVerifier>,
    audit: Arc<dyn AuditSink>,
    agent_identity: String,
    policy: RwLock<SecurityPolicy>,
}

impl ProvenanceTagger {
    pub fn new(
        store: Arc<dyn AttributeStore>,
        verifier: Arc<dyn SignatureVerifier>,
        audit: Arc<dyn AuditSink>,
        agent_identity: impl Into<String>,
    ) -> Self {
        Self {
            store,
            verifier,
            audit,
            agent_identity: agent_identity.into(),
            policy: RwLock::new(SecurityPolicy::default()),
        }
    }

    pub fn set_policy(&self, policy: SecurityPolicy) {
        *self.policy.write() = policy;
    }

    pub fn policy(&self) -> SecurityPolicy {
        *self.policy.read()
    }

    pub fn agent_identity(&self) -> &str {
        &self.agent_identity
    }

    /// Attach provenance metadata to `path`. Re-tagging overwrites.
    pub fn tag(&self, path: &Path, source_url: &str, referrer: Option<&str>) -> bool {
        let name = display_name(path);
        let value = QuarantineValue::web_download(&self.agent_identity);

        let result = self
            .store
            .set(path, QUARANTINE_ATTR, value.encode().as_bytes())
            .and_then(|_| self.store.set(path, ORIGIN_URL_ATTR, source_url.as_bytes()))
            .and_then(|_| match referrer {
                Some(referrer) => self.store.set(path, REFERRER_URL_ATTR, referrer.as_bytes()),
                None => self.store.remove(path, REFERRER_URL_ATTR),
            });

        match result {
            Ok(()) => {
                tracing::debug!(file = %name, url = %source_url, "Tagged download provenance");
                self.audit.log_security_event(
                    SecurityEvent::new(SecurityEventKind::ProvenanceTagged, name, Severity::Info)
                        .with_source_url(source_url)
                        .with_details(format!("event {}", value.event_id)),
                );
                true
            }
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "Failed to tag download provenance");
                self.audit.log_security_event(
                    SecurityEvent::new(SecurityEventKind::ProvenanceError, name, Severity::Medium)
                        .with_source_url(source_url)
                        .with_details(format!("tagging failed: {}", e)),
                );
                false
            }
        }
    }

    /// Read provenance metadata and, for gatekept types, signature trust.
    pub async fn inspect(&self, path: &Path) -> ProvenanceRecord {
        let name = display_name(path);
        let signature_status = self.signature_status(path, &name).await;
        let mut record = ProvenanceRecord::untagged(signature_status);

        match self.store.get(path, QUARANTINE_ATTR) {
            Ok(Some(raw)) => match QuarantineValue::parse(&String::from_utf8_lossy(&raw)) {
                Ok(value) => {
                    record.is_tagged = true;
                    record.tag_type = Some(TagType::from_flags(value.flags));
                    record.agent_identity = Some(value.agent).filter(|a| !a.is_empty());
                    record.tagged_at = Some(value.tagged_at);
                }
                Err(e) => {
                    // Something set the attribute; treat the file as tagged
                    // even though we can't read the details.
                    record.is_tagged = true;
                    tracing::warn!(file = %name, error = %e, "Unreadable quarantine attribute");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "Failed to read provenance metadata");
                self.audit.log_security_event(
                    SecurityEvent::new(SecurityEventKind::ProvenanceError, name.clone(), Severity::Low)
                        .with_details(format!("inspect failed: {}", e)),
                );
            }
        }

        if record.is_tagged {
            record.source_url = self.read_text(path, ORIGIN_URL_ATTR);
            record.referrer_url = self.read_text(path, REFERRER_URL_ATTR);
        }

        let mut event = SecurityEvent::new(SecurityEventKind::ProvenanceInspected, name, Severity::Info)
            .with_details(format!(
                "tagged={} signature={:?} removable={}",
                record.is_tagged, record.signature_status, record.can_remove_safely
            ));
        if let Some(url) = &record.source_url {
            event = event.with_source_url(url.clone());
        }
        self.audit.log_security_event(event);

        record
    }

    /// Remove provenance metadata. Refuses without side effects when the
    /// policy is strict or the file isn't trusted, unless the user confirmed.
    pub async fn untag(&self, path: &Path, user_confirmed: bool) -> bool {
        let name = display_name(path);
        let policy = self.policy();

        if policy.is_strict() && !user_confirmed {
            self.refuse(&name, None, format!("{} policy requires confirmation", policy));
            return false;
        }

        let record = self.inspect(path).await;
        if !record.can_remove_safely && !user_confirmed {
            self.refuse(
                &name,
                record.source_url.as_deref(),
                format!("signature {:?} is not trusted", record.signature_status),
            );
            return false;
        }

        let result = self
            .store
            .remove(path, QUARANTINE_ATTR)
            .and_then(|_| self.store.remove(path, ORIGIN_URL_ATTR))
            .and_then(|_| self.store.remove(path, REFERRER_URL_ATTR));

        let mut event = match &result {
            Ok(()) => SecurityEvent::new(
                SecurityEventKind::ProvenanceRemoved,
                name.clone(),
                if record.can_remove_safely {
                    Severity::Low
                } else {
                    Severity::High
                },
            )
            .with_details(if record.is_tagged {
                "provenance removed"
            } else {
                "no provenance present"
            }),
            Err(e) => SecurityEvent::new(SecurityEventKind::ProvenanceError, name.clone(), Severity::Medium)
                .with_details(format!("untag failed: {}", e)),
        };
        if let Some(url) = record.source_url {
            event = event.with_source_url(url);
        }
        self.audit.log_security_event(event);

        match result {
            Ok(()) => {
                tracing::info!(file = %name, confirmed = user_confirmed, "Removed download provenance");
                true
            }
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "Failed to remove download provenance");
                false
            }
        }
    }

    async fn signature_status(&self, path: &Path, name: &str) -> SignatureStatus {
        let gatekept = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(is_gatekept_extension);
        if !gatekept {
            return SignatureStatus::NotApplicable;
        }

        match self.verifier.verify(path).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "Signature verification unavailable");
                self.audit.log_security_event(
                    SecurityEvent::new(SecurityEventKind::ProvenanceError, name, Severity::Low)
                        .with_details(format!("signature check failed: {}", e)),
                );
                SignatureStatus::Unknown
            }
        }
    }

    fn read_text(&self, path: &Path, attr: &str) -> Option<String> {
        self.store
            .get(path, attr)
            .ok()
            .flatten()
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
            .filter(|s| !s.is_empty())
    }

    fn refuse(&self, name: &str, source_url: Option<&str>, reason: String) {
        tracing::info!(file = %name, reason = %reason, "Refused to remove provenance");
        let mut event = SecurityEvent::new(
            SecurityEventKind::ProvenanceRemovalRefused,
            name,
            Severity::Medium,
        )
        .with_details(reason);
        if let Some(url) = source_url {
            event = event.with_source_url(url);
        }
        self.audit.log_security_event(event);
    }
}
