//! Risk analysis for downloads
//!
//! The verdict is the maximum of independent signals (size, extension,
//! spoofing, declared type), each carrying its own reasons, then adjusted
//! for the active [`SecurityPolicy`].

use serde::{Deserialize, Serialize};
use url::Url;

use crate::classifier::{
    classify_extension, contains_bidi_controls, expected_extensions, extension_of, trim_name_end,
    is_dangerous_content_type, is_unknown_binary_content_type, normalize_content_type,
    FileCategory,
};

/// Default ceiling above which a declared size is itself suspicious (2 GiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn raised(self) -> Self {
        match self {
            RiskLevel::Safe => RiskLevel::Low,
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium => RiskLevel::High,
            RiskLevel::High | RiskLevel::Critical => RiskLevel::Critical,
        }
    }

    pub fn lowered(self) -> Self {
        match self {
            RiskLevel::Safe | RiskLevel::Low => RiskLevel::Safe,
            RiskLevel::Medium => RiskLevel::Low,
            RiskLevel::High => RiskLevel::Medium,
            RiskLevel::Critical => RiskLevel::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "safe" => Ok(RiskLevel::Safe),
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            _ => Err(format!("Unknown risk level: {}", s)),
        }
    }
}

/// Download security policy, ordered from least to most strict.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SecurityPolicy {
    Permissive,
    #[default]
    Balanced,
    Strict,
    Enterprise,
}

impl SecurityPolicy {
    pub const ALL: [SecurityPolicy; 4] = [
        SecurityPolicy::Permissive,
        SecurityPolicy::Balanced,
        SecurityPolicy::Strict,
        SecurityPolicy::Enterprise,
    ];

    /// Lowest risk level this policy refuses outright.
    ///
    /// Permissive and Balanced share the `Critical` threshold; Permissive is
    /// looser only through the one-level risk reduction it applies.
    pub fn block_threshold(&self) -> RiskLevel {
        match self {
            SecurityPolicy::Permissive => RiskLevel::Critical,
            SecurityPolicy::Balanced => RiskLevel::Critical,
            SecurityPolicy::Strict => RiskLevel::High,
            SecurityPolicy::Enterprise => RiskLevel::Medium,
        }
    }

    /// Lowest risk level that asks the user before transferring.
    pub fn confirm_threshold(&self) -> RiskLevel {
        match self {
            SecurityPolicy::Permissive => RiskLevel::High,
            SecurityPolicy::Balanced => RiskLevel::Medium,
            SecurityPolicy::Strict => RiskLevel::Low,
            SecurityPolicy::Enterprise => RiskLevel::Low,
        }
    }

    pub fn blocks(&self, risk: RiskLevel) -> bool {
        risk >= self.block_threshold()
    }

    pub fn requires_confirmation(&self, risk: RiskLevel) -> bool {
        !self.blocks(risk) && risk >= self.confirm_threshold()
    }

    /// Strict mode forbids silent provenance removal.
    pub fn is_strict(&self) -> bool {
        *self >= SecurityPolicy::Strict
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityPolicy::Permissive => "permissive",
            SecurityPolicy::Balanced => "balanced",
            SecurityPolicy::Strict => "strict",
            SecurityPolicy::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SecurityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "permissive" => Ok(SecurityPolicy::Permissive),
            "balanced" => Ok(SecurityPolicy::Balanced),
            "strict" => Ok(SecurityPolicy::Strict),
            "enterprise" => Ok(SecurityPolicy::Enterprise),
            _ => Err(format!("Unknown security policy: {}", s)),
        }
    }
}

/// Result of analysing one file. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSecurityAnalysis {
    pub file_name: String,
    pub extension: Option<String>,
    pub category: FileCategory,
    pub content_type: Option<String>,
    pub declared_size: Option<u64>,
    pub policy: SecurityPolicy,
    pub risk_level: RiskLevel,
    pub reasons: Vec<String>,
    pub recommendations: Vec<String>,
    pub is_executable: bool,
    pub is_archive: bool,
    pub is_spoofed: bool,
}

impl FileSecurityAnalysis {
    pub fn is_blocked(&self) -> bool {
        self.policy.blocks(self.risk_level)
    }

    pub fn requires_confirmation(&self) -> bool {
        self.policy.requires_confirmation(self.risk_level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Declared sizes above this contribute at least `Medium`.
    pub max_file_size: u64,
    /// Treat unrecognized extensions as `Safe` instead of `Medium`.
    pub allow_unknown_types: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allow_unknown_types: false,
        }
    }
}

/// Running max over the independent signals.
#[derive(Default)]
struct Verdict {
    risk: Option<RiskLevel>,
    reasons: Vec<String>,
    recommendations: Vec<String>,
}

impl Verdict {
    fn raise(&mut self, level: RiskLevel, reason: String) {
        self.risk = Some(self.risk.map_or(level, |current| current.max(level)));
        self.reasons.push(reason);
    }

    fn recommend(&mut self, recommendation: &str) {
        if !self.recommendations.iter().any(|r| r == recommendation) {
            self.recommendations.push(recommendation.to_string());
        }
    }

    fn level(&self) -> RiskLevel {
        self.risk.unwrap_or(RiskLevel::Safe)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RiskAnalyzer {
    config: AnalyzerConfig,
}

impl RiskAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn analyze(
        &self,
        file_name: &str,
        declared_type: Option<&str>,
        declared_size: Option<u64>,
        policy: SecurityPolicy,
    ) -> FileSecurityAnalysis {
        let extension = extension_of(file_name);
        let category = extension
            .as_deref()
            .map(classify_extension)
            .unwrap_or(FileCategory::Unknown);
        let content_type = declared_type
            .map(normalize_content_type)
            .filter(|t| !t.is_empty());

        let mut verdict = Verdict::default();

        // 1. Size
        if let Some(size) = declared_size {
            if size > self.config.max_file_size {
                verdict.raise(
                    RiskLevel::Medium,
                    format!(
                        "File size ({} bytes) exceeds the configured limit of {} bytes",
                        size, self.config.max_file_size
                    ),
                );
                verdict.recommend("Confirm that a file this large is expected");
            }
        }

        // 2. Extension
        match category {
            FileCategory::Blocked => {
                verdict.raise(
                    RiskLevel::Critical,
                    format!(
                        "File type .{} is blocked because it is commonly used to deliver malware",
                        extension.as_deref().unwrap_or_default()
                    ),
                );
                verdict.recommend("Do not open this file");
            }
            FileCategory::Executable => {
                verdict.raise(RiskLevel::High, "File is an executable program".to_string());
                verdict.recommend("Only run programs from publishers you trust");
            }
            FileCategory::Script => {
                verdict.raise(
                    RiskLevel::Medium,
                    "File is a script that can run commands on this computer".to_string(),
                );
                verdict.recommend("Review the script contents before running it");
            }
            FileCategory::Archive => {
                verdict.raise(
                    RiskLevel::Low,
                    "Archive contents cannot be inspected before extraction".to_string(),
                );
                verdict.recommend("Check extracted files before opening them");
            }
            FileCategory::Document | FileCategory::Media => {}
            FileCategory::Unknown => {
                if !self.config.allow_unknown_types {
                    let reason = match extension.as_deref() {
                        Some(ext) => format!("Unrecognized file type .{}", ext),
                        None => "File has no extension".to_string(),
                    };
                    verdict.raise(RiskLevel::Medium, reason);
                    verdict.recommend("Verify the file type before opening it");
                }
            }
        }

        // 3. Spoofing
        let mut is_spoofed = false;
        if category.is_executable() {
            if let Some(disguise) = double_extension_disguise(file_name) {
                is_spoofed = true;
                verdict.raise(
                    RiskLevel::High,
                    format!(
                        "File name ends in .{} but is made to look like a .{} file",
                        extension.as_deref().unwrap_or_default(),
                        disguise
                    ),
                );
            }
        }
        if contains_bidi_controls(file_name) {
            is_spoofed = true;
            verdict.raise(
                RiskLevel::High,
                "File name contains text-direction control characters that hide its real extension"
                    .to_string(),
            );
        }
        if let Some(content_type) = content_type.as_deref() {
            let expected = expected_extensions(content_type);
            let matches = extension
                .as_deref()
                .is_some_and(|ext| expected.contains(&ext));
            if !expected.is_empty() && !matches {
                is_spoofed = true;
                verdict.raise(
                    RiskLevel::High,
                    format!(
                        "Declared type {} does not match the file extension",
                        content_type
                    ),
                );
            }
        }
        if is_spoofed {
            verdict.recommend("Delete this file; its name is disguising its real type");
        }

        // 4. Declared type
        if let Some(content_type) = content_type.as_deref() {
            if is_dangerous_content_type(content_type) {
                verdict.raise(
                    RiskLevel::High,
                    format!("Declared type {} is executable content", content_type),
                );
            } else if is_unknown_binary_content_type(content_type) {
                verdict.raise(
                    RiskLevel::Medium,
                    "Server did not identify the file type".to_string(),
                );
            }
        }

        // 5. Policy
        let base = verdict.level();
        let mut risk = match policy {
            SecurityPolicy::Permissive => base.lowered(),
            SecurityPolicy::Balanced => base,
            SecurityPolicy::Strict if category.is_executable() => base.raised(),
            SecurityPolicy::Strict => base,
            SecurityPolicy::Enterprise if base > RiskLevel::Safe => base.raised(),
            SecurityPolicy::Enterprise => base,
        };
        // Blocked extensions stay blocked under every policy.
        if category == FileCategory::Blocked {
            risk = RiskLevel::Critical;
        }
        if risk != base {
            verdict.reasons.push(format!(
                "Risk adjusted from {} to {} by the {} policy",
                base, risk, policy
            ));
        }

        FileSecurityAnalysis {
            file_name: file_name.to_string(),
            extension,
            category,
            content_type,
            declared_size,
            policy,
            risk_level: risk,
            reasons: verdict.reasons,
            recommendations: verdict.recommendations,
            is_executable: category.is_executable(),
            is_archive: category == FileCategory::Archive,
            is_spoofed,
        }
    }
}

/// The safe-looking inner extension of a name like `invoice.pdf.exe`.
fn double_extension_disguise(file_name: &str) -> Option<String> {
    let segments: Vec<&str> = trim_name_end(file_name).split('.').collect();
    if segments.len() < 3 {
        return None;
    }

    // Skip the stem and the real extension.
    segments[1..segments.len() - 1]
        .iter()
        .map(|segment| segment.trim().to_ascii_lowercase())
        .find(|segment| !segment.is_empty() && classify_extension(segment).looks_safe())
}

/// The name a download should be analysed and stored under.
///
/// Uses the suggested name's last path component; falls back to the URL's
/// trailing path segment, then to `"download"`.
pub fn resolve_file_name(suggested: Option<&str>, url: &Url) -> String {
    suggested
        .and_then(last_component)
        .or_else(|| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back())
                .and_then(|segment| {
                    let decoded = percent_decode(segment);
                    last_component(&decoded)
                })
        })
        .unwrap_or_else(|| "download".to_string())
}

fn last_component(name: &str) -> Option<String> {
    let name = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim_matches(|c: char| c.is_whitespace() || c == '\0');

    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

fn percent_decode(segment: &str) -> String {
    match urlencoding::decode(segment) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(segment.as_bytes()))
            .into_owned(),
    }
}
