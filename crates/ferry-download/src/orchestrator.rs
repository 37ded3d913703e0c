//! Download orchestrator
//!
//! Each download gets one tokio task that walks it through reputation,
//! risk analysis, the confirmation gate, transfer, post-validation and
//! tagging. Public entry points only signal that task (through a watch
//! channel or the confirmation gate); the task applies every transition.

use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use url::Url;

use ferry_security::{
    resolve_file_name, AuditSink, FileSecurityAnalysis, ProvenanceTagger, RiskAnalyzer,
    RiskLevel, SecurityEvent, SecurityEventKind, Severity,
};
use ferry_storage::Database;

use crate::collaborators::{
    ConfirmationPresenter, ConfirmationPrompt, MalwareScanner, Reputation, ReputationChecker,
    ScanResult,
};
use crate::confirmation::{ConfirmationHandle, Decision};
use crate::download::{Download, DownloadEvent, DownloadStatus};
use crate::error::DownloadError;
use crate::files::{compute_sha256_hex, partial_path, sanitize_file_name, unique_destination};
use crate::history::{HistoryEntry, HistoryLedger};
use crate::settings::DownloadSettings;
use crate::transport::{ResourceInfo, Transport};
use crate::Result;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const UPDATE_CAPACITY: usize = 256;

/// Collaborators injected into the orchestrator.
#[derive(Clone)]
pub struct Services {
    pub transport: Arc<dyn Transport>,
    pub tagger: Arc<ProvenanceTagger>,
    pub audit: Arc<dyn AuditSink>,
    pub reputation: Option<Arc<dyn ReputationChecker>>,
    pub scanner: Option<Arc<dyn MalwareScanner>>,
    pub presenter: Option<Arc<dyn ConfirmationPresenter>>,
}

impl Services {
    pub fn new(
        transport: Arc<dyn Transport>,
        tagger: Arc<ProvenanceTagger>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            transport,
            tagger,
            audit,
            reputation: None,
            scanner: None,
            presenter: None,
        }
    }

    pub fn with_reputation(mut self, checker: Arc<dyn ReputationChecker>) -> Self {
        self.reputation = Some(checker);
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn MalwareScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_presenter(mut self, presenter: Arc<dyn ConfirmationPresenter>) -> Self {
        self.presenter = Some(presenter);
        self
    }
}

/// A download request with whatever the caller already knows about the
/// resource (typically from the navigation response headers).
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub url: String,
    pub suggested_name: Option<String>,
    pub referrer: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn suggested_name(mut self, name: impl Into<String>) -> Self {
        self.suggested_name = Some(name.into());
        self
    }

    pub fn referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Continue,
    Pause,
    Cancel,
}

struct Job {
    control: watch::Sender<Control>,
    gate: Option<ConfirmationHandle>,
    remove_when_finished: bool,
}

enum ScanOutcome {
    Skipped,
    Unavailable,
    Scanned(ScanResult),
}

struct Inner {
    db: Database,
    downloads: RwLock<HashMap<String, Download>>,
    jobs: Mutex<HashMap<String, Job>>,
    services: Services,
    history: HistoryLedger,
    settings: RwLock<DownloadSettings>,
    download_dir: PathBuf,
    updates: broadcast::Sender<Download>,
}

#[derive(Clone)]
pub struct DownloadOrchestrator {
    inner: Arc<Inner>,
}

impl DownloadOrchestrator {
    /// Load persisted settings and history and get ready to accept requests.
    pub fn open(db: Database, download_dir: PathBuf, services: Services) -> Result<Self> {
        let settings = DownloadSettings::load(&db)?;
        let history = HistoryLedger::new(db.clone());
        history.load()?;
        services.tagger.set_policy(settings.policy);

        tracing::info!(
            dir = %download_dir.display(),
            policy = %settings.policy,
            history = history.len(),
            "Download orchestrator ready"
        );

        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                downloads: RwLock::new(HashMap::new()),
                jobs: Mutex::new(HashMap::new()),
                services,
                history,
                settings: RwLock::new(settings),
                download_dir,
                updates,
            }),
        })
    }

    pub fn start(&self, url: &str, suggested_name: Option<&str>) -> Result<Download> {
        let mut request = DownloadRequest::new(url);
        request.suggested_name = suggested_name.map(str::to_string);
        self.start_request(request)
    }

    /// Create a download and spawn its pipeline. Must be called from
    /// within a tokio runtime.
    pub fn start_request(&self, request: DownloadRequest) -> Result<Download> {
        let url = Url::parse(&request.url)
            .map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", request.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidUrl(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }

        let file_name = resolve_file_name(request.suggested_name.as_deref(), &url);

        let download = {
            let mut downloads = self.inner.downloads.write();
            let taken: HashSet<PathBuf> = downloads
                .values()
                .map(|d| PathBuf::from(&d.destination_path))
                .collect();
            let destination = unique_destination(
                &self.inner.download_dir,
                &sanitize_file_name(&file_name),
                &taken,
            );

            let mut download = Download::new(
                url.to_string(),
                destination.to_string_lossy().into_owned(),
                file_name,
                request.referrer.clone(),
            );
            download.mime_type = request.content_type.clone();
            download.bytes_expected = request.content_length;
            downloads.insert(download.id.clone(), download.clone());
            download
        };

        tracing::info!(
            download_id = %download.id,
            url = %download.source_url,
            destination = %download.destination_path,
            "Download requested"
        );
        self.inner.emit(&download);

        let hints = ResourceInfo {
            content_type: request.content_type,
            content_length: request.content_length,
        };
        self.spawn_job(&download.id, move |inner, id, control| async move {
            let outcome = inner.run_download(&id, &url, hints, control).await;
            inner.settle(&id, outcome).await;
        });

        Ok(download)
    }

    pub fn pause(&self, id: &str) -> Result<Download> {
        let download = self.require(id, DownloadEvent::Pause)?;
        self.signal(id, Control::Pause)?;
        tracing::info!(download_id = %id, "Pause requested");
        Ok(download)
    }

    pub fn resume(&self, id: &str) -> Result<Download> {
        let download = self.require(id, DownloadEvent::Resume)?;
        self.signal(id, Control::Continue)?;
        tracing::info!(download_id = %id, "Resume requested");
        Ok(download)
    }

    /// Abort a download. A no-op once it has finished; rejected while the
    /// file is being validated or tagged.
    pub fn cancel(&self, id: &str) -> Result<Download> {
        let download = self.get(id)?;
        if download.status.is_terminal() {
            return Ok(download);
        }
        let download = self.require(id, DownloadEvent::UserCancelled)?;

        let gate = self.inner.jobs.lock().get(id).and_then(|job| job.gate.clone());
        let resolved = match gate {
            Some(gate) if download.status == DownloadStatus::AwaitingConfirmation => gate.cancel(),
            _ => false,
        };
        if !resolved {
            self.signal(id, Control::Cancel)?;
        }

        tracing::info!(download_id = %id, status = %download.status, "Cancellation requested");
        Ok(download)
    }

    /// Drop a download from the active set. Running downloads are cancelled
    /// and dropped once their task ends.
    pub fn remove(&self, id: &str) -> Result<()> {
        {
            let mut jobs = self.inner.jobs.lock();
            if let Some(job) = jobs.get_mut(id) {
                job.remove_when_finished = true;
                drop(jobs);
                match self.cancel(id) {
                    Ok(_) | Err(DownloadError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e),
                }
                return Ok(());
            }
        }

        self.inner
            .downloads
            .write()
            .remove(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        tracing::info!(download_id = %id, "Removed download");
        Ok(())
    }

    /// Answer a pending confirmation. Only the first answer counts.
    pub fn resolve_confirmation(&self, id: &str, proceed: bool) -> Result<Download> {
        let download = self.get(id)?;
        let gate = self
            .inner
            .jobs
            .lock()
            .get(id)
            .and_then(|job| job.gate.clone())
            .ok_or_else(|| DownloadError::NotAwaitingConfirmation(id.to_string()))?;

        let decision = if proceed {
            Decision::Proceed
        } else {
            Decision::Cancel
        };
        if !gate.resolve(decision) {
            return Err(DownloadError::NotAwaitingConfirmation(id.to_string()));
        }

        tracing::info!(download_id = %id, ?decision, "Confirmation resolved");
        Ok(download)
    }

    /// Scan a completed file again using its recorded hash.
    pub fn rescan(&self, id: &str) -> Result<Download> {
        let download = self.get(id)?;
        if download.status != DownloadStatus::Completed
            || !Path::new(&download.destination_path).exists()
        {
            return Err(DownloadError::NotCompleted(id.to_string()));
        }

        let download = {
            let jobs = self.inner.jobs.lock();
            if jobs.contains_key(id) {
                return Err(DownloadError::InvalidTransition {
                    from: download.status,
                    event: DownloadEvent::RescanStarted,
                });
            }
            self.inner.transition(id, DownloadEvent::RescanStarted)?
        };

        self.spawn_job(id, |inner, id, control| async move {
            let outcome = inner.rescan_file(&id, control).await;
            inner.settle(&id, outcome).await;
        });
        Ok(download)
    }

    /// Remove provenance metadata from a completed file at the user's request.
    pub async fn untag_provenance(&self, id: &str) -> Result<bool> {
        let download = self.get(id)?;
        if download.status != DownloadStatus::Completed {
            return Err(DownloadError::NotCompleted(id.to_string()));
        }

        let path = PathBuf::from(&download.destination_path);
        let tagger = &self.inner.services.tagger;
        let removed = tagger.untag(&path, true).await;
        let record = tagger.inspect(&path).await;
        self.inner.update(id, |d| {
            d.provenance_record = Some(record);
            Ok(())
        })?;

        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Result<Download> {
        self.inner.snapshot(id)
    }

    /// Newest first
    pub fn list(&self) -> Vec<Download> {
        let mut downloads: Vec<Download> = self.inner.downloads.read().values().cloned().collect();
        downloads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        downloads
    }

    pub fn active(&self) -> Vec<Download> {
        self.list()
            .into_iter()
            .filter(|d| !d.status.is_terminal())
            .collect()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.all()
    }

    pub fn settings(&self) -> DownloadSettings {
        self.inner.settings.read().clone()
    }

    /// Persist and apply new settings. Running downloads keep the settings
    /// they started with.
    pub fn update_settings(&self, settings: DownloadSettings) -> Result<()> {
        let mut current = self.inner.settings.write();
        settings.save(&self.inner.db)?;
        self.inner.services.tagger.set_policy(settings.policy);
        tracing::info!(policy = %settings.policy, "Updated download settings");
        *current = settings;
        Ok(())
    }

    /// Snapshots of every download whenever it changes.
    pub fn subscribe(&self) -> broadcast::Receiver<Download> {
        self.inner.updates.subscribe()
    }

    /// Drop finished downloads that are already in history and older than
    /// `older_than`. Returns how many were dropped.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());

        let jobs = self.inner.jobs.lock();
        let mut downloads = self.inner.downloads.write();
        let before = downloads.len();
        downloads.retain(|id, d| {
            let stale = d.status.is_terminal()
                && d.history_recorded
                && !jobs.contains_key(id)
                && d.completed_at.is_some_and(|at| at <= cutoff);
            !stale
        });

        let pruned = before - downloads.len();
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned finished downloads");
        }
        pruned
    }

    fn require(&self, id: &str, event: DownloadEvent) -> Result<Download> {
        let download = self.get(id)?;
        if download.status.next(event).is_none() {
            return Err(DownloadError::InvalidTransition {
                from: download.status,
                event,
            });
        }
        Ok(download)
    }

    fn signal(&self, id: &str, control: Control) -> Result<()> {
        let jobs = self.inner.jobs.lock();
        let job = jobs
            .get(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        let _ = job.control.send(control);
        Ok(())
    }

    fn spawn_job<F, Fut>(&self, id: &str, run: F)
    where
        F: FnOnce(Arc<Inner>, String, watch::Receiver<Control>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (control, rx) = watch::channel(Control::Continue);
        self.inner.jobs.lock().insert(
            id.to_string(),
            Job {
                control,
                gate: None,
                remove_when_finished: false,
            },
        );

        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        let task = run(Arc::clone(&inner), id.clone(), rx);
        tokio::spawn(async move {
            task.await;
            inner.finish_job(&id);
        });
    }
}

impl Inner {
    fn snapshot(&self, id: &str) -> Result<Download> {
        self.downloads
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))
    }

    fn emit(&self, download: &Download) {
        let _ = self.updates.send(download.clone());
    }

    fn update<F>(&self, id: &str, f: F) -> Result<Download>
    where
        F: FnOnce(&mut Download) -> Result<()>,
    {
        let snapshot = {
            let mut downloads = self.downloads.write();
            let download = downloads
                .get_mut(id)
                .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
            f(download)?;
            download.updated_at = Utc::now();
            download.clone()
        };
        self.emit(&snapshot);
        Ok(snapshot)
    }

    fn transition(&self, id: &str, event: DownloadEvent) -> Result<Download> {
        let download = self.update(id, |d| d.apply(event).map(|_| ()))?;
        tracing::info!(
            download_id = %id,
            %event,
            status = %download.status,
            "Download transition"
        );
        Ok(download)
    }

    fn report_progress(&self, id: &str, bytes: u64) {
        if let Err(e) = self.update(id, |d| {
            d.record_progress(bytes);
            Ok(())
        }) {
            tracing::debug!(download_id = %id, error = %e, "Dropped progress update");
        }
    }

    fn audit(
        &self,
        download: &Download,
        kind: SecurityEventKind,
        severity: Severity,
        details: impl Into<String>,
    ) {
        self.services.audit.log_security_event(
            SecurityEvent::new(kind, download.file_name(), severity)
                .with_source_url(download.source_url.clone())
                .with_details(details),
        );
    }

    fn collaborator_unavailable(&self, id: &str, service: &str, reason: String) {
        tracing::warn!(
            download_id = %id,
            service,
            reason = %reason,
            "Collaborator unavailable, treating result as unknown"
        );
        if let Ok(download) = self.snapshot(id) {
            self.audit(
                &download,
                SecurityEventKind::SuspiciousActivity,
                Severity::Low,
                format!("{} unavailable: {}", service, reason),
            );
        }
    }

    async fn run_download(
        &self,
        id: &str,
        url: &Url,
        hints: ResourceInfo,
        mut control: watch::Receiver<Control>,
    ) -> Result<()> {
        let settings = self.settings.read().clone();

        let reputation = unless_cancelled(&mut control, self.check_reputation(id, url, &settings))
            .await?;
        let mut trusted = match reputation {
            Some(Reputation::Unsafe { threat }) => {
                let download = self.update(id, |d| {
                    d.apply(DownloadEvent::ReputationUnsafe)?;
                    d.error = Some(format!("Blocked by reputation check: {}", threat));
                    Ok(())
                })?;
                tracing::warn!(download_id = %id, url = %url, threat = %threat, "Download blocked by reputation check");
                self.audit(
                    &download,
                    SecurityEventKind::ThreatBlocked,
                    Severity::Critical,
                    format!("reputation: {}", threat),
                );
                return Ok(());
            }
            Some(Reputation::Safe) => {
                self.transition(id, DownloadEvent::ReputationSafe)?;
                true
            }
            Some(Reputation::Unknown) => {
                self.transition(id, DownloadEvent::ReputationUnknown)?;
                false
            }
            // nothing to ask
            None => {
                self.transition(id, DownloadEvent::ReputationUnknown)?;
                true
            }
        };

        let info = unless_cancelled(&mut control, self.resolve_info(url, hints)).await?;
        let download = self.snapshot(id)?;
        let analysis = RiskAnalyzer::new(settings.analyzer_config()).analyze(
            &download.suggested_filename,
            info.content_type.as_deref(),
            info.content_length,
            settings.policy,
        );
        let download = self.update(id, |d| {
            d.security_analysis = Some(analysis.clone());
            d.mime_type = info.content_type.clone().or(d.mime_type.take());
            d.bytes_expected = info.content_length.or(d.bytes_expected);
            Ok(())
        })?;
        tracing::info!(
            download_id = %id,
            risk = %analysis.risk_level,
            policy = %settings.policy,
            spoofed = analysis.is_spoofed,
            "Risk analysis complete"
        );
        check_cancel(&control)?;

        if analysis.is_blocked() {
            let reasons = analysis.reasons.join("; ");
            let download = self.update(id, |d| {
                d.apply(DownloadEvent::PolicyBlocked)?;
                d.error = Some(format!("Blocked by {} policy: {}", settings.policy, reasons));
                Ok(())
            })?;
            tracing::warn!(download_id = %id, risk = %analysis.risk_level, "Download blocked by policy");
            self.audit(
                &download,
                SecurityEventKind::ThreatBlocked,
                analysis.risk_level.into(),
                reasons,
            );
            return Ok(());
        }

        if analysis.risk_level > RiskLevel::Safe {
            self.audit(
                &download,
                SecurityEventKind::DownloadWarning,
                analysis.risk_level.into(),
                analysis.reasons.join("; "),
            );
        }

        if analysis.requires_confirmation() && settings.warnings_enabled {
            let decision = self
                .confirm(
                    id,
                    DownloadEvent::ConfirmationRequired,
                    Some(analysis.clone()),
                    None,
                    &mut control,
                )
                .await?;
            if decision == Decision::Cancel {
                return Err(DownloadError::Cancelled);
            }
            let download = self.transition(id, DownloadEvent::UserProceeded)?;
            self.audit(
                &download,
                SecurityEventKind::UserOverride,
                analysis.risk_level.into(),
                "proceeded past pre-transfer warning",
            );
            trusted = false;
        } else {
            self.transition(id, DownloadEvent::RiskAccepted)?;
        }

        let destination = PathBuf::from(&download.destination_path);
        let partial = partial_path(&destination);
        if let Err(e) = self.transfer(id, url, &partial, &mut control).await {
            discard(&partial).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&partial, &destination).await {
            discard(&partial).await;
            return Err(e.into());
        }
        if check_cancel(&control).is_err() {
            discard(&destination).await;
            return Err(DownloadError::Cancelled);
        }
        self.transition(id, DownloadEvent::TransferCompleted)?;

        self.post_validate(id, &destination, &settings, trusted, &mut control)
            .await
    }

    async fn rescan_file(&self, id: &str, mut control: watch::Receiver<Control>) -> Result<()> {
        let settings = self.settings.read().clone();
        let download = self.snapshot(id)?;
        let destination = PathBuf::from(&download.destination_path);
        self.post_validate(
            id,
            &destination,
            &settings,
            download.security_validated,
            &mut control,
        )
        .await
    }

    async fn check_reputation(
        &self,
        id: &str,
        url: &Url,
        settings: &DownloadSettings,
    ) -> Option<Reputation> {
        let checker = self.services.reputation.as_ref()?;
        match tokio::time::timeout(settings.reputation_timeout(), checker.check_url_safety(url))
            .await
        {
            Ok(Ok(reputation)) => {
                tracing::debug!(download_id = %id, ?reputation, "Reputation check finished");
                Some(reputation)
            }
            Ok(Err(e)) => {
                self.collaborator_unavailable(id, "reputation check", e.to_string());
                Some(Reputation::Unknown)
            }
            Err(_) => {
                self.collaborator_unavailable(id, "reputation check", "timed out".to_string());
                Some(Reputation::Unknown)
            }
        }
    }

    async fn resolve_info(&self, url: &Url, hints: ResourceInfo) -> ResourceInfo {
        if hints.is_complete() {
            return hints;
        }

        match tokio::time::timeout(PROBE_TIMEOUT, self.services.transport.probe(url)).await {
            Ok(Ok(probed)) => hints.or(probed),
            Ok(Err(e)) => {
                tracing::debug!(url = %url, error = %e, "Metadata probe failed");
                hints
            }
            Err(_) => {
                tracing::debug!(url = %url, "Metadata probe timed out");
                hints
            }
        }
    }

    /// Suspend on the confirmation gate. The gate is registered before the
    /// transition so a cancel racing the transition still finds it; a cancel
    /// signalled before that arrives on `control` instead.
    async fn confirm(
        &self,
        id: &str,
        event: DownloadEvent,
        analysis: Option<FileSecurityAnalysis>,
        scan_result: Option<ScanResult>,
        control: &mut watch::Receiver<Control>,
    ) -> Result<Decision> {
        let (handle, decision) = ConfirmationHandle::new(id);
        {
            let mut jobs = self.jobs.lock();
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
            job.gate = Some(handle.clone());
        }
        if check_cancel(control).is_err() {
            self.clear_gate(id);
            return Ok(Decision::Cancel);
        }

        let download = match self.transition(id, event) {
            Ok(download) => download,
            Err(e) => {
                self.clear_gate(id);
                return Err(e);
            }
        };

        match &self.services.presenter {
            Some(presenter) => presenter.present(ConfirmationPrompt {
                download,
                analysis,
                scan_result,
                handle,
            }),
            None => {
                tracing::info!(download_id = %id, "Awaiting confirmation with no presenter attached")
            }
        }

        let decision = match unless_cancelled(control, decision).await {
            Ok(answer) => answer.unwrap_or(Decision::Cancel),
            Err(_) => Decision::Cancel,
        };
        self.clear_gate(id);
        Ok(decision)
    }

    fn clear_gate(&self, id: &str) {
        if let Some(job) = self.jobs.lock().get_mut(id) {
            job.gate = None;
        }
    }

    async fn transfer(
        &self,
        id: &str,
        url: &Url,
        partial: &Path,
        control: &mut watch::Receiver<Control>,
    ) -> Result<()> {
        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(partial)
            .await?;

        let mut written: u64 = 0;
        let mut last_report = Instant::now();

        loop {
            let stream =
                unless_cancelled(control, self.services.transport.open(url, written)).await??;

            // Server ignored the range: discard what we already have
            let mut skip = written.saturating_sub(stream.offset);
            if skip > 0 {
                tracing::debug!(download_id = %id, skip, "Range not honoured, skipping prefix");
            }

            let info = stream.info;
            self.update(id, |d| {
                if info.content_length.is_some() {
                    d.bytes_expected = info.content_length;
                }
                if d.mime_type.is_none() {
                    d.mime_type = info.content_type.clone();
                }
                Ok(())
            })?;

            let mut chunks = stream.chunks;
            let paused = loop {
                let action = *control.borrow_and_update();
                match action {
                    Control::Pause => break true,
                    Control::Cancel => return Err(DownloadError::Cancelled),
                    Control::Continue => {}
                }

                tokio::select! {
                    biased;
                    changed = control.changed() => {
                        if changed.is_err() {
                            return Err(DownloadError::Cancelled);
                        }
                    }
                    chunk = chunks.next() => match chunk {
                        Some(Ok(bytes)) => {
                            let start = skip.min(bytes.len() as u64) as usize;
                            skip -= start as u64;
                            let data = &bytes[start..];
                            if data.is_empty() {
                                continue;
                            }

                            file.write_all(data).await?;
                            written += data.len() as u64;

                            if last_report.elapsed() >= PROGRESS_INTERVAL {
                                last_report = Instant::now();
                                self.report_progress(id, written);
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => break false,
                    }
                }
            };
            drop(chunks);
            file.flush().await?;
            self.report_progress(id, written);

            if !paused {
                break;
            }

            self.transition(id, DownloadEvent::Pause)?;
            self.wait_for_resume(id, control).await?;
        }

        file.sync_all().await?;

        let expected = self.snapshot(id)?.bytes_expected;
        if let Some(expected) = expected {
            if written < expected {
                return Err(DownloadError::Incomplete {
                    expected,
                    received: written,
                });
            }
        }

        tracing::debug!(download_id = %id, bytes = written, "Transfer finished");
        Ok(())
    }

    async fn wait_for_resume(&self, id: &str, control: &mut watch::Receiver<Control>) -> Result<()> {
        loop {
            let action = *control.borrow_and_update();
            match action {
                Control::Continue => {
                    self.transition(id, DownloadEvent::Resume)?;
                    return Ok(());
                }
                Control::Cancel => return Err(DownloadError::Cancelled),
                Control::Pause => {}
            }

            if control.changed().await.is_err() {
                return Err(DownloadError::Cancelled);
            }
        }
    }

    /// Hash, scan and hand over to tagging. Shared by fresh downloads
    /// (from `PostValidating`) and rescans (from `SafetyChecking`).
    async fn post_validate(
        &self,
        id: &str,
        destination: &Path,
        settings: &DownloadSettings,
        mut trusted: bool,
        control: &mut watch::Receiver<Control>,
    ) -> Result<()> {
        let download = self.snapshot(id)?;
        let rescanning = download.status == DownloadStatus::SafetyChecking;

        let hash = match download.content_hash {
            Some(hash) => hash,
            None => {
                let hash = match compute_sha256_hex(destination.to_path_buf()).await {
                    Ok(hash) => hash,
                    Err(e) => {
                        discard(destination).await;
                        return Err(e.into());
                    }
                };
                self.update(id, |d| {
                    d.content_hash = Some(hash.clone());
                    Ok(())
                })?;
                tracing::debug!(download_id = %id, hash = %hash, "Computed content hash");
                hash
            }
        };

        let outcome = if settings.scanning_enabled || rescanning {
            self.scan(id, destination, download.bytes_transferred, &hash, settings)
                .await
        } else {
            ScanOutcome::Skipped
        };

        let threat = match outcome {
            ScanOutcome::Scanned(result) => {
                self.update(id, |d| {
                    d.scan_result = Some(result.clone());
                    Ok(())
                })?;
                Some(result).filter(|r| r.is_threat)
            }
            ScanOutcome::Unavailable => {
                trusted = false;
                None
            }
            ScanOutcome::Skipped => None,
        };

        match threat {
            Some(result) => {
                let download = self.snapshot(id)?;
                tracing::warn!(
                    download_id = %id,
                    severity = result.severity.as_str(),
                    "Malware scan flagged download"
                );
                self.audit(
                    &download,
                    SecurityEventKind::MalwareDetected,
                    result.severity,
                    result.details.clone().unwrap_or_else(|| "scanner reported a threat".to_string()),
                );

                let decision = self
                    .confirm(
                        id,
                        DownloadEvent::ThreatDetected,
                        download.security_analysis.clone(),
                        Some(result.clone()),
                        control,
                    )
                    .await?;
                if decision == Decision::Cancel {
                    return Err(DownloadError::Cancelled);
                }

                let download = self.transition(id, DownloadEvent::ProceedDespiteThreat)?;
                self.audit(
                    &download,
                    SecurityEventKind::UserOverride,
                    result.severity,
                    "kept file flagged by malware scan",
                );
                trusted = false;
            }
            None => {
                let download = self.transition(id, DownloadEvent::ScanClean)?;
                if download.status == DownloadStatus::Completed {
                    return Ok(());
                }
            }
        }

        self.quarantine(id, destination, settings, trusted).await
    }

    async fn scan(
        &self,
        id: &str,
        path: &Path,
        size: u64,
        hash: &str,
        settings: &DownloadSettings,
    ) -> ScanOutcome {
        let Some(scanner) = self.services.scanner.as_ref() else {
            return ScanOutcome::Skipped;
        };

        match tokio::time::timeout(settings.scan_timeout(), scanner.scan_file(path, size, hash))
            .await
        {
            Ok(Ok(result)) => {
                tracing::debug!(download_id = %id, threat = result.is_threat, "Malware scan finished");
                ScanOutcome::Scanned(result)
            }
            Ok(Err(e)) => {
                self.collaborator_unavailable(id, "malware scan", e.to_string());
                ScanOutcome::Unavailable
            }
            Err(_) => {
                self.collaborator_unavailable(id, "malware scan", "timed out".to_string());
                ScanOutcome::Unavailable
            }
        }
    }

    async fn quarantine(
        &self,
        id: &str,
        destination: &Path,
        settings: &DownloadSettings,
        trusted: bool,
    ) -> Result<()> {
        let download = self.snapshot(id)?;
        let tagger = &self.services.tagger;

        let provenance = if settings.auto_tagging_enabled {
            let tagged = {
                let tagger = Arc::clone(tagger);
                let path = destination.to_path_buf();
                let source_url = download.source_url.clone();
                let referrer = download.referrer.clone();
                // extended attribute writes are blocking syscalls
                tokio::task::spawn_blocking(move || {
                    tagger.tag(&path, &source_url, referrer.as_deref())
                })
                .await
                .unwrap_or(false)
            };
            if !tagged {
                tracing::warn!(download_id = %id, "Provenance tagging failed, completing untagged");
            }
            Some(tagger.inspect(destination).await)
        } else {
            tracing::debug!(download_id = %id, "Auto-tagging disabled");
            None
        };

        let download = self.update(id, |d| {
            d.apply(DownloadEvent::TaggingFinished)?;
            if let Some(record) = provenance {
                d.provenance_record = Some(record);
            }
            d.security_validated = trusted;
            Ok(())
        })?;

        tracing::info!(
            download_id = %id,
            path = %download.destination_path,
            hash = ?download.content_hash,
            validated = download.security_validated,
            "Download completed"
        );
        Ok(())
    }

    async fn settle(&self, id: &str, outcome: Result<()>) {
        match outcome {
            Ok(()) => {}
            Err(DownloadError::Cancelled) => self.cancelled(id).await,
            Err(e) => self.fail(id, e),
        }
    }

    async fn cancelled(&self, id: &str) {
        let Ok(download) = self.snapshot(id) else {
            return;
        };

        let destination = PathBuf::from(&download.destination_path);
        discard(&partial_path(&destination)).await;
        // A hashed file was fully written and then rejected
        let removed = download.content_hash.is_some();
        if removed {
            discard(&destination).await;
        }

        // A rescanned file already has a Completed entry; its removal gets one of its own
        let result = self.update(id, |d| {
            d.apply(DownloadEvent::UserCancelled)?;
            if removed {
                d.history_recorded = false;
                d.security_validated = false;
            }
            Ok(())
        });
        let download = match result {
            Ok(download) => download,
            Err(e) => {
                tracing::warn!(download_id = %id, error = %e, "Could not cancel download");
                return;
            }
        };
        tracing::info!(download_id = %id, removed, "Download cancelled");

        if removed {
            let severity = download
                .scan_result
                .as_ref()
                .filter(|r| r.is_threat)
                .map(|r| r.severity)
                .unwrap_or(Severity::Medium);
            let details = if download.status_history.contains(&DownloadStatus::SafetyChecking) {
                "file removed after rescan"
            } else {
                "file removed after validation"
            };
            self.audit(&download, SecurityEventKind::ThreatBlocked, severity, details);
        }
    }

    fn fail(&self, id: &str, err: DownloadError) {
        let Ok(download) = self.snapshot(id) else {
            tracing::debug!(download_id = %id, error = %err, "Pipeline error for removed download");
            return;
        };

        let event = match download.status {
            DownloadStatus::Transferring => DownloadEvent::TransferFailed,
            DownloadStatus::PostValidating => DownloadEvent::ValidationFailed,
            status => {
                tracing::error!(download_id = %id, %status, error = %err, "Download pipeline error");
                self.audit(
                    &download,
                    SecurityEventKind::DownloadFailed,
                    Severity::Medium,
                    format!("pipeline error while {}: {}", status, err),
                );
                return;
            }
        };

        let message = err.to_string();
        match self.update(id, |d| {
            d.apply(event)?;
            d.error = Some(message.clone());
            Ok(())
        }) {
            Ok(download) => {
                tracing::warn!(download_id = %id, error = %message, "Download failed");
                self.audit(
                    &download,
                    SecurityEventKind::DownloadFailed,
                    Severity::Medium,
                    message,
                );
            }
            Err(e) => tracing::error!(download_id = %id, error = %e, "Could not mark download failed"),
        }
    }

    fn finish_job(&self, id: &str) {
        let job = self.jobs.lock().remove(id);
        self.record_history(id);

        if job.is_some_and(|job| job.remove_when_finished) {
            self.downloads.write().remove(id);
            tracing::info!(download_id = %id, "Removed download");
        }
    }

    /// Append the terminal snapshot to history, once per download.
    fn record_history(&self, id: &str) {
        let entry = {
            let mut downloads = self.downloads.write();
            let Some(download) = downloads.get_mut(id) else {
                return;
            };
            if !download.status.is_terminal() || download.history_recorded {
                return;
            }
            download.history_recorded = true;
            HistoryEntry::from_download(download)
        };

        if let Err(e) = self.history.append(entry) {
            tracing::error!(download_id = %id, error = %e, "Failed to record download history");
        }
    }
}

fn check_cancel(control: &watch::Receiver<Control>) -> Result<()> {
    if *control.borrow() == Control::Cancel {
        Err(DownloadError::Cancelled)
    } else {
        Ok(())
    }
}

/// Run `fut` unless a cancel arrives first.
async fn unless_cancelled<F: Future>(
    control: &mut watch::Receiver<Control>,
    fut: F,
) -> Result<F::Output> {
    tokio::pin!(fut);
    loop {
        check_cancel(control)?;
        tokio::select! {
            output = &mut fut => return Ok(output),
            changed = control.changed() => {
                if changed.is_err() {
                    return Ok(fut.await);
                }
            }
        }
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Discarded file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to discard file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ferry_security::{
        MemoryAttributeStore, RecordingAuditSink, SecurityPolicy, UnavailableVerifier,
    };
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    use crate::transport::TransferStream;

    const BODY: &[u8] = b"0123456789";

    struct MemoryTransport {
        body: Vec<u8>,
        chunk_size: usize,
        delay: Duration,
        honor_range: bool,
        content_type: Option<String>,
        /// Advertised length when it differs from what is served
        declared_length: Option<u64>,
        fail: bool,
        opens: AtomicUsize,
    }

    impl MemoryTransport {
        fn new(body: &[u8], content_type: Option<&str>) -> Self {
            Self {
                body: body.to_vec(),
                chunk_size: 4,
                delay: Duration::ZERO,
                honor_range: true,
                content_type: content_type.map(str::to_string),
                declared_length: None,
                fail: false,
                opens: AtomicUsize::new(0),
            }
        }

        fn slow(mut self, chunk_size: usize, delay: Duration) -> Self {
            self.chunk_size = chunk_size;
            self.delay = delay;
            self
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn info(&self) -> ResourceInfo {
            ResourceInfo {
                content_type: self.content_type.clone(),
                content_length: Some(self.declared_length.unwrap_or(self.body.len() as u64)),
            }
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn probe(&self, _url: &Url) -> Result<ResourceInfo> {
            Ok(self.info())
        }

        async fn open(&self, _url: &Url, offset: u64) -> Result<TransferStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DownloadError::Http(503));
            }

            let offset = if self.honor_range {
                offset.min(self.body.len() as u64)
            } else {
                0
            };
            let pieces: Vec<Vec<u8>> = self.body[offset as usize..]
                .chunks(self.chunk_size)
                .map(|c| c.to_vec())
                .collect();
            let delay = self.delay;
            let chunks = futures_util::stream::iter(pieces)
                .then(move |piece| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok::<_, DownloadError>(piece)
                })
                .boxed();

            Ok(TransferStream {
                info: self.info(),
                offset,
                chunks,
            })
        }
    }

    struct FixedReputation(Reputation);

    #[async_trait]
    impl ReputationChecker for FixedReputation {
        async fn check_url_safety(&self, _url: &Url) -> Result<Reputation> {
            Ok(self.0.clone())
        }
    }

    struct BrokenReputation;

    #[async_trait]
    impl ReputationChecker for BrokenReputation {
        async fn check_url_safety(&self, _url: &Url) -> Result<Reputation> {
            Err(DownloadError::Network("reputation service down".to_string()))
        }
    }

    #[derive(Default)]
    struct ScriptedScanner {
        threat: AtomicBool,
        broken: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MalwareScanner for ScriptedScanner {
        async fn scan_file(&self, path: &Path, _size: u64, sha256: &str) -> Result<ScanResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(path.exists());
            assert_eq!(sha256.len(), 64);
            if self.broken {
                return Err(DownloadError::Network("scanner offline".to_string()));
            }
            if self.threat.load(Ordering::SeqCst) {
                Ok(ScanResult::threat(Severity::High, "Test.Trojan"))
            } else {
                Ok(ScanResult::clean())
            }
        }
    }

    /// Keeps prompts so the test can answer them.
    #[derive(Default)]
    struct CollectingPresenter {
        prompts: parking_lot::Mutex<Vec<ConfirmationPrompt>>,
    }

    impl ConfirmationPresenter for CollectingPresenter {
        fn present(&self, prompt: ConfirmationPrompt) {
            self.prompts.lock().push(prompt);
        }
    }

    struct AnsweringPresenter(Decision);

    impl ConfirmationPresenter for AnsweringPresenter {
        fn present(&self, prompt: ConfirmationPrompt) {
            assert!(prompt.handle.resolve(self.0));
        }
    }

    /// Cancels every active download when a pre-transfer warning is logged,
    /// i.e. while still in `RiskAnalyzing`.
    struct CancelOnWarning {
        recorded: Arc<RecordingAuditSink>,
        orchestrator: Arc<std::sync::OnceLock<DownloadOrchestrator>>,
    }

    impl AuditSink for CancelOnWarning {
        fn log_security_event(&self, event: SecurityEvent) {
            let warning = event.kind == SecurityEventKind::DownloadWarning;
            self.recorded.log_security_event(event);
            if !warning {
                return;
            }
            if let Some(orchestrator) = self.orchestrator.get() {
                for download in orchestrator.active() {
                    assert_eq!(download.status, DownloadStatus::RiskAnalyzing);
                    orchestrator.cancel(&download.id).unwrap();
                }
            }
        }
    }

    struct Harness {
        orchestrator: DownloadOrchestrator,
        transport: Arc<MemoryTransport>,
        audit: Arc<RecordingAuditSink>,
        db: Database,
        dir: TempDir,
    }

    fn harness(transport: MemoryTransport, configure: impl FnOnce(Services) -> Services) -> Harness {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let audit = Arc::new(RecordingAuditSink::new());
        let tagger = Arc::new(ProvenanceTagger::new(
            Arc::new(MemoryAttributeStore::new()),
            Arc::new(UnavailableVerifier),
            audit.clone(),
            "Ferry/Test",
        ));
        let transport = Arc::new(transport);
        let services = configure(Services::new(transport.clone(), tagger, audit.clone()));
        let orchestrator =
            DownloadOrchestrator::open(db.clone(), dir.path().join("downloads"), services).unwrap();

        Harness {
            orchestrator,
            transport,
            audit,
            db,
            dir,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_for(h: &Harness, id: &str, status: DownloadStatus) -> Download {
        eventually(|| h.orchestrator.get(id).map(|d| d.status == status).unwrap_or(false)).await;
        h.orchestrator.get(id).unwrap()
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    #[tokio::test]
    async fn test_safe_download_completes() {
        let h = harness(
            MemoryTransport::new(BODY, Some("application/pdf")),
            |s| {
                s.with_reputation(Arc::new(FixedReputation(Reputation::Safe)))
                    .with_scanner(Arc::new(ScriptedScanner::default()))
            },
        );

        let started = h
            .orchestrator
            .start("https://example.com/files/notes.pdf", None)
            .unwrap();
        assert_eq!(started.status, DownloadStatus::Initiated);

        let done = wait_for(&h, &started.id, DownloadStatus::Completed).await;
        assert_eq!(
            done.status_history,
            vec![
                DownloadStatus::Initiated,
                DownloadStatus::RiskAnalyzing,
                DownloadStatus::Transferring,
                DownloadStatus::PostValidating,
                DownloadStatus::Quarantining,
                DownloadStatus::Completed,
            ]
        );
        assert!(done.security_validated);
        assert_eq!(done.bytes_transferred, 10);
        assert_eq!(done.content_hash.as_deref(), Some(sha256_hex(BODY).as_str()));
        assert_eq!(
            done.security_analysis.as_ref().map(|a| a.risk_level),
            Some(RiskLevel::Safe)
        );

        let path = PathBuf::from(&done.destination_path);
        assert_eq!(std::fs::read(&path).unwrap(), BODY);
        assert!(!partial_path(&path).exists());

        let provenance = done.provenance_record.unwrap();
        assert!(provenance.is_tagged);
        assert_eq!(
            provenance.source_url.as_deref(),
            Some("https://example.com/files/notes.pdf")
        );

        eventually(|| h.orchestrator.history().len() == 1).await;
        let entry = &h.orchestrator.history()[0];
        assert_eq!(entry.id, started.id);
        assert_eq!(entry.outcome, DownloadStatus::Completed);
        assert!(entry.security_validated);
        assert_eq!(entry.hash, done.content_hash);
        assert_eq!(h.audit.count(SecurityEventKind::ProvenanceTagged), 1);
    }

    #[tokio::test]
    async fn test_unsafe_reputation_blocks_before_transfer() {
        let h = harness(MemoryTransport::new(BODY, Some("application/pdf")), |s| {
            s.with_reputation(Arc::new(FixedReputation(Reputation::Unsafe {
                threat: "phishing".to_string(),
            })))
        });

        let started = h
            .orchestrator
            .start("https://bad.example/notes.pdf", None)
            .unwrap();
        let blocked = wait_for(&h, &started.id, DownloadStatus::Blocked).await;

        assert_eq!(
            blocked.status_history,
            vec![DownloadStatus::Initiated, DownloadStatus::Blocked]
        );
        assert_eq!(blocked.bytes_transferred, 0);
        assert!(!blocked.can_proceed());
        assert!(blocked.error.unwrap().contains("phishing"));
        assert_eq!(h.transport.opens(), 0);
        assert!(!Path::new(&blocked.destination_path).exists());
        assert_eq!(h.audit.count(SecurityEventKind::ThreatBlocked), 1);

        eventually(|| h.orchestrator.history().len() == 1).await;
        assert_eq!(h.orchestrator.history()[0].outcome, DownloadStatus::Blocked);
    }

    #[tokio::test]
    async fn test_blocked_extension_never_transfers() {
        let h = harness(MemoryTransport::new(BODY, None), |s| s);

        let started = h
            .orchestrator
            .start("https://example.com/payload.scr", None)
            .unwrap();
        let blocked = wait_for(&h, &started.id, DownloadStatus::Blocked).await;

        assert_eq!(
            blocked.status_history,
            vec![
                DownloadStatus::Initiated,
                DownloadStatus::RiskAnalyzing,
                DownloadStatus::Blocked
            ]
        );
        assert_eq!(
            blocked.security_analysis.map(|a| a.risk_level),
            Some(RiskLevel::Critical)
        );
        assert_eq!(h.transport.opens(), 0);
        assert_eq!(h.audit.count(SecurityEventKind::ThreatBlocked), 1);
    }

    #[tokio::test]
    async fn test_confirmation_proceed_transfers_once() {
        let presenter = Arc::new(CollectingPresenter::default());
        let h = harness(MemoryTransport::new(BODY, None), |s| {
            s.with_presenter(presenter.clone())
        });

        let started = h
            .orchestrator
            .start("https://example.com/setup.exe", None)
            .unwrap();
        let waiting = wait_for(&h, &started.id, DownloadStatus::AwaitingConfirmation).await;
        assert!(waiting.can_proceed());
        assert_eq!(h.transport.opens(), 0);

        {
            let prompts = presenter.prompts.lock();
            assert_eq!(prompts.len(), 1);
            assert_eq!(prompts[0].handle.download_id(), started.id);
            assert_eq!(
                prompts[0].analysis.as_ref().map(|a| a.risk_level),
                Some(RiskLevel::High)
            );
        }

        // Other entry points stay consistent while suspended
        assert!(matches!(
            h.orchestrator.pause(&started.id),
            Err(DownloadError::InvalidTransition { .. })
        ));

        h.orchestrator.resolve_confirmation(&started.id, true).unwrap();
        assert!(matches!(
            h.orchestrator.resolve_confirmation(&started.id, false),
            Err(DownloadError::NotAwaitingConfirmation(_))
        ));

        let done = wait_for(&h, &started.id, DownloadStatus::Completed).await;
        assert!(!done.security_validated);
        assert_eq!(h.transport.opens(), 1);
        assert_eq!(h.audit.count(SecurityEventKind::UserOverride), 1);
        assert!(presenter.prompts.lock()[0].handle.is_resolved());
    }

    #[tokio::test]
    async fn test_confirmation_cancel_never_transfers() {
        let h = harness(MemoryTransport::new(BODY, None), |s| {
            s.with_presenter(Arc::new(AnsweringPresenter(Decision::Cancel)))
        });

        let started = h
            .orchestrator
            .start("https://example.com/setup.exe", None)
            .unwrap();
        let cancelled = wait_for(&h, &started.id, DownloadStatus::Cancelled).await;

        assert_eq!(
            cancelled.status_history.last(),
            Some(&DownloadStatus::Cancelled)
        );
        assert!(cancelled
            .status_history
            .contains(&DownloadStatus::AwaitingConfirmation));
        assert_eq!(h.transport.opens(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_confirmation() {
        let h = harness(MemoryTransport::new(BODY, None), |s| s);

        let started = h
            .orchestrator
            .start("https://example.com/setup.exe", None)
            .unwrap();
        wait_for(&h, &started.id, DownloadStatus::AwaitingConfirmation).await;

        h.orchestrator.cancel(&started.id).unwrap();
        wait_for(&h, &started.id, DownloadStatus::Cancelled).await;
        assert_eq!(h.transport.opens(), 0);
        assert!(matches!(
            h.orchestrator.resolve_confirmation(&started.id, true),
            Err(DownloadError::NotAwaitingConfirmation(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_risk_analysis_is_not_lost() {
        let presenter = Arc::new(CollectingPresenter::default());
        let slot = Arc::new(std::sync::OnceLock::new());
        let recorded = Arc::new(RecordingAuditSink::new());
        let h = harness(MemoryTransport::new(BODY, None), |mut s| {
            s.audit = Arc::new(CancelOnWarning {
                recorded: recorded.clone(),
                orchestrator: slot.clone(),
            });
            s.with_presenter(presenter.clone())
        });
        assert!(slot.set(h.orchestrator.clone()).is_ok());

        let started = h
            .orchestrator
            .start("https://example.com/setup.exe", None)
            .unwrap();
        let cancelled = wait_for(&h, &started.id, DownloadStatus::Cancelled).await;

        assert_eq!(recorded.count(SecurityEventKind::DownloadWarning), 1);
        assert_eq!(
            cancelled.status_history,
            vec![
                DownloadStatus::Initiated,
                DownloadStatus::RiskAnalyzing,
                DownloadStatus::Cancelled,
            ]
        );
        assert!(presenter.prompts.lock().is_empty());
        assert_eq!(h.transport.opens(), 0);
        assert!(matches!(
            h.orchestrator.resolve_confirmation(&started.id, true),
            Err(DownloadError::NotAwaitingConfirmation(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_warnings_skip_the_gate() {
        let h = harness(MemoryTransport::new(BODY, None), |s| s);
        h.orchestrator
            .update_settings(DownloadSettings {
                warnings_enabled: false,
                ..Default::default()
            })
            .unwrap();

        let started = h
            .orchestrator
            .start("https://example.com/setup.exe", None)
            .unwrap();
        let done = wait_for(&h, &started.id, DownloadStatus::Completed).await;
        assert!(!done
            .status_history
            .contains(&DownloadStatus::AwaitingConfirmation));
        assert_eq!(h.audit.count(SecurityEventKind::DownloadWarning), 1);
    }

    #[tokio::test]
    async fn test_scan_threat_reenters_gate_and_retags() {
        let presenter = Arc::new(CollectingPresenter::default());
        let scanner = Arc::new(ScriptedScanner::default());
        scanner.threat.store(true, Ordering::SeqCst);
        let h = harness(MemoryTransport::new(BODY, Some("application/pdf")), |s| {
            s.with_scanner(scanner.clone())
                .with_presenter(presenter.clone())
        });

        let started = h
            .orchestrator
            .start("https://example.com/report.pdf", None)
            .unwrap();
        let waiting = wait_for(&h, &started.id, DownloadStatus::AwaitingConfirmation).await;
        assert!(waiting.content_hash.is_some());
        assert!(waiting.scan_result.as_ref().is_some_and(|r| r.is_threat));
        assert_eq!(
            &waiting.status_history[waiting.status_history.len() - 2..],
            &[
                DownloadStatus::PostValidating,
                DownloadStatus::AwaitingConfirmation
            ]
        );
        assert!(presenter.prompts.lock()[0].scan_result.is_some());

        h.orchestrator.resolve_confirmation(&started.id, true).unwrap();
        let done = wait_for(&h, &started.id, DownloadStatus::Completed).await;

        assert!(!done.security_validated);
        assert!(done.provenance_record.is_some_and(|p| p.is_tagged));
        assert_eq!(done.content_hash, waiting.content_hash);
        assert_eq!(h.audit.count(SecurityEventKind::MalwareDetected), 1);
    }

    #[tokio::test]
    async fn test_scan_threat_cancel_deletes_file() {
        let scanner = Arc::new(ScriptedScanner::default());
        scanner.threat.store(true, Ordering::SeqCst);
        let h = harness(MemoryTransport::new(BODY, Some("application/pdf")), |s| {
            s.with_scanner(scanner.clone())
        });

        let started = h
            .orchestrator
            .start("https://example.com/report.pdf", None)
            .unwrap();
        let waiting = wait_for(&h, &started.id, DownloadStatus::AwaitingConfirmation).await;
        assert!(Path::new(&waiting.destination_path).exists());

        h.orchestrator.resolve_confirmation(&started.id, false).unwrap();
        let cancelled = wait_for(&h, &started.id, DownloadStatus::Cancelled).await;
        assert!(!Path::new(&cancelled.destination_path).exists());
        assert_eq!(cancelled.content_hash, waiting.content_hash);
        assert_eq!(h.audit.count(SecurityEventKind::ThreatBlocked), 1);
    }

    #[tokio::test]
    async fn test_unavailable_collaborators_are_permissive() {
        let h = harness(MemoryTransport::new(BODY, Some("application/pdf")), |s| {
            s.with_reputation(Arc::new(BrokenReputation))
                .with_scanner(Arc::new(ScriptedScanner {
                    broken: true,
                    ..Default::default()
                }))
        });

        let started = h
            .orchestrator
            .start("https://example.com/notes.pdf", None)
            .unwrap();
        let done = wait_for(&h, &started.id, DownloadStatus::Completed).await;

        assert_eq!(done.status_history[1], DownloadStatus::RiskAnalyzing);
        assert!(!done.security_validated);
        assert!(done.scan_result.is_none());
        assert_eq!(h.audit.count(SecurityEventKind::SuspiciousActivity), 2);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let body: Vec<u8> = (0..200u8).collect();
        let h = harness(
            MemoryTransport::new(&body, Some("application/pdf"))
                .slow(4, Duration::from_millis(20)),
            |s| s,
        );

        let started = h
            .orchestrator
            .start("https://example.com/big.pdf", None)
            .unwrap();
        wait_for(&h, &started.id, DownloadStatus::Transferring).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.orchestrator.pause(&started.id).unwrap();
        let paused = wait_for(&h, &started.id, DownloadStatus::Paused).await;
        assert!(paused.bytes_transferred > 0);
        assert!(paused.bytes_transferred < body.len() as u64);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let still = h.orchestrator.get(&started.id).unwrap();
        assert_eq!(still.status, DownloadStatus::Paused);
        assert_eq!(still.bytes_transferred, paused.bytes_transferred);
        assert!(matches!(
            h.orchestrator.pause(&started.id),
            Err(DownloadError::InvalidTransition { .. })
        ));

        h.orchestrator.resume(&started.id).unwrap();
        let done = wait_for(&h, &started.id, DownloadStatus::Completed).await;

        assert_eq!(std::fs::read(&done.destination_path).unwrap(), body);
        assert_eq!(done.content_hash.as_deref(), Some(sha256_hex(&body).as_str()));
        assert_eq!(h.transport.opens(), 2);
    }

    #[tokio::test]
    async fn test_resume_without_range_support_keeps_progress_monotonic() {
        let body: Vec<u8> = (0..200u8).collect();
        let mut transport = MemoryTransport::new(&body, Some("application/pdf"))
            .slow(4, Duration::from_millis(20));
        transport.honor_range = false;
        let h = harness(transport, |s| s);
        let mut updates = h.orchestrator.subscribe();

        let started = h
            .orchestrator
            .start("https://example.com/big.pdf", None)
            .unwrap();
        wait_for(&h, &started.id, DownloadStatus::Transferring).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.orchestrator.pause(&started.id).unwrap();
        wait_for(&h, &started.id, DownloadStatus::Paused).await;
        h.orchestrator.resume(&started.id).unwrap();
        let done = wait_for(&h, &started.id, DownloadStatus::Completed).await;

        assert_eq!(std::fs::read(&done.destination_path).unwrap(), body);

        let mut last = 0;
        while let Ok(snapshot) = updates.try_recv() {
            assert!(snapshot.bytes_transferred >= last);
            last = snapshot.bytes_transferred;
        }
        assert_eq!(last, body.len() as u64);
    }

    #[tokio::test]
    async fn test_cancel_discards_partial_bytes() {
        let body: Vec<u8> = (0..200u8).collect();
        let h = harness(
            MemoryTransport::new(&body, Some("application/pdf"))
                .slow(4, Duration::from_millis(20)),
            |s| s,
        );

        let started = h
            .orchestrator
            .start("https://example.com/big.pdf", None)
            .unwrap();
        wait_for(&h, &started.id, DownloadStatus::Transferring).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        h.orchestrator.cancel(&started.id).unwrap();
        let cancelled = wait_for(&h, &started.id, DownloadStatus::Cancelled).await;
        let path = PathBuf::from(&cancelled.destination_path);
        assert!(!path.exists());
        assert!(!partial_path(&path).exists());

        // terminal: further cancels are no-ops
        let again = h.orchestrator.cancel(&started.id).unwrap();
        assert_eq!(again.status, DownloadStatus::Cancelled);

        eventually(|| h.orchestrator.history().len() == 1).await;
        assert_eq!(h.orchestrator.history()[0].outcome, DownloadStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_transport_error_fails() {
        let mut transport = MemoryTransport::new(BODY, Some("application/pdf"));
        transport.fail = true;
        let h = harness(transport, |s| s);

        let started = h
            .orchestrator
            .start("https://example.com/notes.pdf", None)
            .unwrap();
        let failed = wait_for(&h, &started.id, DownloadStatus::Failed).await;

        assert_eq!(failed.error.as_deref(), Some("HTTP 503"));
        assert_eq!(h.audit.count(SecurityEventKind::DownloadFailed), 1);
        assert!(!partial_path(Path::new(&failed.destination_path)).exists());
        eventually(|| h.orchestrator.history().len() == 1).await;
        assert_eq!(h.orchestrator.history()[0].outcome, DownloadStatus::Failed);
    }

    #[tokio::test]
    async fn test_short_transfer_fails() {
        let mut transport = MemoryTransport::new(BODY, Some("application/pdf"));
        transport.declared_length = Some(20);
        let h = harness(transport, |s| s);

        let started = h
            .orchestrator
            .start("https://example.com/notes.pdf", None)
            .unwrap();
        let failed = wait_for(&h, &started.id, DownloadStatus::Failed).await;
        assert_eq!(
            failed.error.as_deref(),
            Some("Transfer ended after 10 of 20 bytes")
        );
        assert!(!Path::new(&failed.destination_path).exists());
    }

    #[tokio::test]
    async fn test_rescan_keeps_hash() {
        let scanner = Arc::new(ScriptedScanner::default());
        let presenter = Arc::new(CollectingPresenter::default());
        let h = harness(MemoryTransport::new(BODY, Some("application/pdf")), |s| {
            s.with_scanner(scanner.clone())
                .with_presenter(presenter.clone())
        });

        let started = h
            .orchestrator
            .start("https://example.com/notes.pdf", None)
            .unwrap();
        let done = wait_for(&h, &started.id, DownloadStatus::Completed).await;
        eventually(|| h.orchestrator.history().len() == 1).await;

        h.orchestrator.rescan(&started.id).unwrap();
        eventually(|| {
            let d = h.orchestrator.get(&started.id).unwrap();
            d.status == DownloadStatus::Completed
                && d.status_history.contains(&DownloadStatus::SafetyChecking)
        })
        .await;
        let rescanned = h.orchestrator.get(&started.id).unwrap();
        assert_eq!(rescanned.content_hash, done.content_hash);
        assert_eq!(scanner.calls.load(Ordering::SeqCst), 2);

        // A threat found on rescan goes back through the gate
        scanner.threat.store(true, Ordering::SeqCst);
        eventually(|| h.orchestrator.rescan(&started.id).is_ok()).await;
        wait_for(&h, &started.id, DownloadStatus::AwaitingConfirmation).await;
        h.orchestrator.resolve_confirmation(&started.id, true).unwrap();
        eventually(|| {
            let d = h.orchestrator.get(&started.id).unwrap();
            d.status == DownloadStatus::Completed
                && d.status_history.ends_with(&[
                    DownloadStatus::Quarantining,
                    DownloadStatus::Completed,
                ])
                && d.status_history.len() > rescanned.status_history.len() + 2
        })
        .await;

        let after = h.orchestrator.get(&started.id).unwrap();
        assert_eq!(after.content_hash, done.content_hash);
        assert_eq!(h.orchestrator.history().len(), 1);
    }

    #[tokio::test]
    async fn test_rescan_threat_cancel_records_removal() {
        let scanner = Arc::new(ScriptedScanner::default());
        let h = harness(MemoryTransport::new(BODY, Some("application/pdf")), |s| {
            s.with_scanner(scanner.clone())
        });

        let started = h
            .orchestrator
            .start("https://example.com/notes.pdf", None)
            .unwrap();
        let done = wait_for(&h, &started.id, DownloadStatus::Completed).await;
        eventually(|| h.orchestrator.history().len() == 1).await;
        assert_eq!(h.audit.count(SecurityEventKind::ThreatBlocked), 0);

        scanner.threat.store(true, Ordering::SeqCst);
        h.orchestrator.rescan(&started.id).unwrap();
        wait_for(&h, &started.id, DownloadStatus::AwaitingConfirmation).await;
        h.orchestrator.resolve_confirmation(&started.id, false).unwrap();

        let cancelled = wait_for(&h, &started.id, DownloadStatus::Cancelled).await;
        assert!(!Path::new(&cancelled.destination_path).exists());
        assert!(!cancelled.security_validated);

        let removals: Vec<SecurityEvent> = h
            .audit
            .events()
            .into_iter()
            .filter(|e| e.kind == SecurityEventKind::ThreatBlocked)
            .collect();
        assert_eq!(removals.len(), 1);
        assert_eq!(removals[0].details, "file removed after rescan");
        assert_eq!(removals[0].severity, Severity::High);

        eventually(|| h.orchestrator.history().len() == 2).await;
        let history = h.orchestrator.history();
        assert_eq!(history[0].outcome, DownloadStatus::Cancelled);
        assert!(!history[0].security_validated);
        assert_eq!(history[1].outcome, DownloadStatus::Completed);
        assert_eq!(history[0].hash, done.content_hash);

        // the ledger reloads both entries
        let reloaded = HistoryLedger::new(h.db.clone());
        reloaded.load().unwrap();
        assert_eq!(reloaded.len(), 2);
    }

    #[tokio::test]
    async fn test_rescan_requires_completed_file() {
        let h = harness(MemoryTransport::new(BODY, None), |s| s);
        let started = h
            .orchestrator
            .start("https://example.com/setup.exe", None)
            .unwrap();
        wait_for(&h, &started.id, DownloadStatus::AwaitingConfirmation).await;

        assert!(matches!(
            h.orchestrator.rescan(&started.id),
            Err(DownloadError::NotCompleted(_))
        ));
        assert!(matches!(
            h.orchestrator.rescan("missing"),
            Err(DownloadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_untag_provenance() {
        let h = harness(MemoryTransport::new(BODY, Some("application/pdf")), |s| s);
        let started = h
            .orchestrator
            .start("https://example.com/notes.pdf", None)
            .unwrap();
        wait_for(&h, &started.id, DownloadStatus::Completed).await;

        assert!(h.orchestrator.untag_provenance(&started.id).await.unwrap());
        let untagged = h.orchestrator.get(&started.id).unwrap();
        assert!(!untagged.provenance_record.unwrap().is_tagged);
        assert_eq!(h.audit.count(SecurityEventKind::ProvenanceRemoved), 1);

        // idempotent
        assert!(h.orchestrator.untag_provenance(&started.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_destinations_are_unique() {
        let h = harness(MemoryTransport::new(BODY, None), |s| s);

        let first = h
            .orchestrator
            .start("https://example.com/setup.exe", None)
            .unwrap();
        let second = h
            .orchestrator
            .start("https://mirror.example/setup.exe", None)
            .unwrap();

        assert_ne!(first.destination_path, second.destination_path);
        assert!(Path::new(&first.destination_path).starts_with(h.dir.path()));
        assert!(second.destination_path.ends_with("setup (1).exe"));
        assert_eq!(second.suggested_filename, "setup.exe");
        assert_eq!(h.orchestrator.active().len(), 2);
    }

    #[tokio::test]
    async fn test_remove() {
        let h = harness(MemoryTransport::new(BODY, Some("application/pdf")), |s| s);

        let done = h
            .orchestrator
            .start("https://example.com/notes.pdf", None)
            .unwrap();
        wait_for(&h, &done.id, DownloadStatus::Completed).await;
        eventually(|| h.orchestrator.history().len() == 1).await;
        h.orchestrator.remove(&done.id).unwrap();
        assert!(matches!(
            h.orchestrator.get(&done.id),
            Err(DownloadError::NotFound(_))
        ));
        assert!(Path::new(&done.destination_path).exists());

        let waiting = h
            .orchestrator
            .start("https://example.com/setup.exe", None)
            .unwrap();
        wait_for(&h, &waiting.id, DownloadStatus::AwaitingConfirmation).await;
        h.orchestrator.remove(&waiting.id).unwrap();
        eventually(|| h.orchestrator.get(&waiting.id).is_err()).await;

        eventually(|| h.orchestrator.history().len() == 2).await;
        assert_eq!(h.orchestrator.history()[0].outcome, DownloadStatus::Cancelled);
        assert!(matches!(
            h.orchestrator.remove(&waiting.id),
            Err(DownloadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_request_hints_skip_probe_and_referrer_is_tagged() {
        let h = harness(MemoryTransport::new(BODY, Some("text/html")), |s| s);

        let request = DownloadRequest::new("https://example.com/download?id=7")
            .suggested_name("photo.jpg")
            .referrer("https://example.com/gallery")
            .content_type("image/jpeg")
            .content_length(10);
        let started = h.orchestrator.start_request(request).unwrap();
        let done = wait_for(&h, &started.id, DownloadStatus::Completed).await;

        assert_eq!(done.mime_type.as_deref(), Some("image/jpeg"));
        let analysis = done.security_analysis.unwrap();
        assert_eq!(analysis.risk_level, RiskLevel::Safe);
        assert!(!analysis.is_spoofed);
        assert_eq!(
            done.provenance_record.unwrap().referrer_url.as_deref(),
            Some("https://example.com/gallery")
        );
    }

    #[tokio::test]
    async fn test_invalid_urls_are_rejected() {
        let h = harness(MemoryTransport::new(BODY, None), |s| s);
        assert!(matches!(
            h.orchestrator.start("not a url", None),
            Err(DownloadError::InvalidUrl(_))
        ));
        assert!(matches!(
            h.orchestrator.start("file:///etc/passwd", None),
            Err(DownloadError::InvalidUrl(_))
        ));
        assert!(h.orchestrator.list().is_empty());
    }

    #[tokio::test]
    async fn test_settings_persist_and_reach_the_tagger() {
        let h = harness(MemoryTransport::new(BODY, None), |s| s);
        let settings = DownloadSettings {
            policy: SecurityPolicy::Strict,
            auto_tagging_enabled: false,
            ..Default::default()
        };
        h.orchestrator.update_settings(settings.clone()).unwrap();

        assert_eq!(h.orchestrator.settings(), settings);
        assert_eq!(DownloadSettings::load(&h.db).unwrap(), settings);
    }

    #[tokio::test]
    async fn test_prune_finished() {
        let h = harness(MemoryTransport::new(BODY, Some("application/pdf")), |s| s);
        let started = h
            .orchestrator
            .start("https://example.com/notes.pdf", None)
            .unwrap();
        wait_for(&h, &started.id, DownloadStatus::Completed).await;
        eventually(|| h.orchestrator.history().len() == 1).await;
        eventually(|| h.orchestrator.inner.jobs.lock().is_empty()).await;

        assert_eq!(h.orchestrator.prune_finished(Duration::from_secs(3600)), 0);
        assert_eq!(h.orchestrator.prune_finished(Duration::ZERO), 1);
        assert!(h.orchestrator.list().is_empty());
    }
}
