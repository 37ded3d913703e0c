//! Bounded download history ledger

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use ferry_security::RiskLevel;
use ferry_storage::Database;

use crate::download::{Download, DownloadStatus};
use crate::Result;

pub const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub url: String,
    pub file_name: String,
    pub file_path: String,
    pub size: u64,
    pub recorded_at: DateTime<Utc>,
    pub mime_type: Option<String>,
    pub security_validated: bool,
    pub risk_level: Option<RiskLevel>,
    pub hash: Option<String>,
    pub outcome: DownloadStatus,
}

impl HistoryEntry {
    pub fn from_download(download: &Download) -> Self {
        Self {
            id: download.id.clone(),
            url: download.source_url.clone(),
            file_name: download.file_name().to_string(),
            file_path: download.destination_path.clone(),
            size: download.bytes_transferred,
            recorded_at: Utc::now(),
            mime_type: download.mime_type.clone(),
            security_validated: download.security_validated,
            risk_level: download.security_analysis.as_ref().map(|a| a.risk_level),
            hash: download.content_hash.clone(),
            outcome: download.status,
        }
    }
}

/// The most recent finished downloads, newest first, persisted in the
/// `download_history` table and mirrored in memory.
#[derive(Clone)]
pub struct HistoryLedger {
    db: Database,
    capacity: usize,
    entries: Arc<RwLock<VecDeque<HistoryEntry>>>,
}

impl HistoryLedger {
    pub fn new(db: Database) -> Self {
        Self::with_capacity(db, HISTORY_CAPACITY)
    }

    pub fn with_capacity(db: Database, capacity: usize) -> Self {
        Self {
            db,
            capacity: capacity.max(1),
            entries: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Replace the in-memory view with what is stored.
    pub fn load(&self) -> Result<()> {
        let capacity = self.capacity as i64;
        let loaded = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, url, file_name, file_path, size, recorded_at, mime_type,
                        security_validated, risk_level, hash, outcome
                 FROM download_history
                 ORDER BY seq DESC
                 LIMIT ?1",
            )?;

            let entries: Vec<HistoryEntry> = stmt
                .query_map([capacity], |row| {
                    let recorded_str: String = row.get(5)?;
                    let recorded_at = DateTime::parse_from_rfc3339(&recorded_str)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now());
                    let risk_level: Option<String> = row.get(8)?;
                    let outcome: String = row.get(10)?;

                    Ok(HistoryEntry {
                        id: row.get(0)?,
                        url: row.get(1)?,
                        file_name: row.get(2)?,
                        file_path: row.get(3)?,
                        size: row.get::<_, i64>(4)? as u64,
                        recorded_at,
                        mime_type: row.get(6)?,
                        security_validated: row.get(7)?,
                        risk_level: risk_level.and_then(|r| r.parse().ok()),
                        hash: row.get(9)?,
                        outcome: outcome.parse().unwrap_or(DownloadStatus::Failed),
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();

            Ok(entries)
        })?;

        tracing::debug!(entries = loaded.len(), "Loaded download history");
        *self.entries.write() = loaded.into();
        Ok(())
    }

    /// Record `entry` and evict the oldest beyond capacity, atomically.
    pub fn append(&self, entry: HistoryEntry) -> Result<()> {
        let mut entries = self.entries.write();
        let capacity = self.capacity as i64;

        self.db.transaction(|conn| {
            conn.execute(
                "INSERT INTO download_history
                 (id, url, file_name, file_path, size, recorded_at, mime_type,
                  security_validated, risk_level, hash, outcome)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    entry.id,
                    entry.url,
                    entry.file_name,
                    entry.file_path,
                    entry.size as i64,
                    entry.recorded_at.to_rfc3339(),
                    entry.mime_type,
                    entry.security_validated,
                    entry.risk_level.map(|r| r.as_str()),
                    entry.hash,
                    entry.outcome.as_str(),
                ],
            )?;
            conn.execute(
                "DELETE FROM download_history WHERE seq NOT IN
                 (SELECT seq FROM download_history ORDER BY seq DESC LIMIT ?1)",
                [capacity],
            )?;
            Ok(())
        })?;

        tracing::debug!(
            download_id = %entry.id,
            outcome = %entry.outcome,
            "Recorded download history"
        );

        entries.push_front(entry);
        entries.truncate(self.capacity);
        Ok(())
    }

    /// Newest first
    pub fn all(&self) -> Vec<HistoryEntry> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
