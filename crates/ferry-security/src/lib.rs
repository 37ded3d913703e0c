//! Ferry Download Security
//!
//! - Extension and content-type classification
//! - Policy-driven risk analysis with spoofing detection
//! - Provenance (quarantine) tagging and code-signature trust
//! - Security audit events

mod analyzer;
mod attributes;
mod audit;
mod classifier;
mod error;
mod provenance;
mod signature;

pub use analyzer::{
    resolve_file_name, AnalyzerConfig, FileSecurityAnalysis, RiskAnalyzer, RiskLevel,
    SecurityPolicy, DEFAULT_MAX_FILE_SIZE,
};
pub use attributes::{platform_store, AttributeStore, MemoryAttributeStore};
#[cfg(unix)]
pub use attributes::XattrStore;
pub use audit::{
    AuditSink, RecordingAuditSink, SecurityEvent, SecurityEventKind, Severity, TracingAuditSink,
    AUDIT_TARGET,
};
pub use classifier::{
    classify_extension, extension_of, is_gatekept_extension, strip_bidi_controls, FileCategory,
};
pub use error::SecurityError;
pub use provenance::{
    ProvenanceRecord, ProvenanceTagger, QuarantineValue, TagType, ORIGIN_URL_ATTR,
    QUARANTINE_ATTR, REFERRER_URL_ATTR,
};
pub use signature::{
    parse_assessment, platform_verifier, CachedVerifier, SignatureStatus, SignatureVerifier,
    SpctlVerifier, UnavailableVerifier,
};

pub type Result<T> = std::result::Result<T, SecurityError>;
