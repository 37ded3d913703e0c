//! Download settings, persisted under `downloads.*` keys

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use ferry_security::{AnalyzerConfig, SecurityPolicy, DEFAULT_MAX_FILE_SIZE};
use ferry_storage::Database;

use crate::Result;

const PREFIX: &str = "downloads.";
const POLICY: &str = "downloads.policy";
const SCANNING_ENABLED: &str = "downloads.scanning_enabled";
const WARNINGS_ENABLED: &str = "downloads.warnings_enabled";
const AUTO_TAGGING_ENABLED: &str = "downloads.auto_tagging_enabled";
const MAX_FILE_SIZE: &str = "downloads.max_file_size";
const ALLOW_UNKNOWN_TYPES: &str = "downloads.allow_unknown_types";
const REPUTATION_TIMEOUT_MS: &str = "downloads.reputation_timeout_ms";
const SCAN_TIMEOUT_MS: &str = "downloads.scan_timeout_ms";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSettings {
    pub policy: SecurityPolicy,
    pub scanning_enabled: bool,
    /// When off, files that would need confirmation proceed without a prompt.
    /// Blocking is unaffected.
    pub warnings_enabled: bool,
    pub auto_tagging_enabled: bool,
    pub max_file_size: u64,
    pub allow_unknown_types: bool,
    pub reputation_timeout_ms: u64,
    pub scan_timeout_ms: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            policy: SecurityPolicy::Balanced,
            scanning_enabled: true,
            warnings_enabled: true,
            auto_tagging_enabled: true,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allow_unknown_types: false,
            reputation_timeout_ms: 10_000,
            scan_timeout_ms: 60_000,
        }
    }
}

fn parsed<T: FromStr>(stored: &HashMap<String, String>, key: &str, default: T) -> T {
    match stored.get(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring invalid download setting");
            default
        }),
        None => default,
    }
}

impl DownloadSettings {
    /// Stored values over defaults. Unparsable values fall back to the default.
    pub fn load(db: &Database) -> Result<Self> {
        let stored = db.settings_with_prefix(PREFIX)?;
        let defaults = Self::default();

        Ok(Self {
            policy: parsed(&stored, POLICY, defaults.policy),
            scanning_enabled: parsed(&stored, SCANNING_ENABLED, defaults.scanning_enabled),
            warnings_enabled: parsed(&stored, WARNINGS_ENABLED, defaults.warnings_enabled),
            auto_tagging_enabled: parsed(
                &stored,
                AUTO_TAGGING_ENABLED,
                defaults.auto_tagging_enabled,
            ),
            max_file_size: parsed(&stored, MAX_FILE_SIZE, defaults.max_file_size),
            allow_unknown_types: parsed(
                &stored,
                ALLOW_UNKNOWN_TYPES,
                defaults.allow_unknown_types,
            ),
            reputation_timeout_ms: parsed(
                &stored,
                REPUTATION_TIMEOUT_MS,
                defaults.reputation_timeout_ms,
            ),
            scan_timeout_ms: parsed(&stored, SCAN_TIMEOUT_MS, defaults.scan_timeout_ms),
        })
    }

    pub fn save(&self, db: &Database) -> Result<()> {
        db.set_settings(&[
            (POLICY, self.policy.as_str().to_string()),
            (SCANNING_ENABLED, self.scanning_enabled.to_string()),
            (WARNINGS_ENABLED, self.warnings_enabled.to_string()),
            (AUTO_TAGGING_ENABLED, self.auto_tagging_enabled.to_string()),
            (MAX_FILE_SIZE, self.max_file_size.to_string()),
            (ALLOW_UNKNOWN_TYPES, self.allow_unknown_types.to_string()),
            (REPUTATION_TIMEOUT_MS, self.reputation_timeout_ms.to_string()),
            (SCAN_TIMEOUT_MS, self.scan_timeout_ms.to_string()),
        ])?;
        Ok(())
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            max_file_size: self.max_file_size,
            allow_unknown_types: self.allow_unknown_types,
        }
    }

    pub fn reputation_timeout(&self) -> Duration {
        Duration::from_millis(self.reputation_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}
