//! Service container
//!
//! Builds every collaborator explicitly and hands them to the download
//! orchestrator. Hosts (a UI shell, a CLI) hold one `Ferry` and clone it
//! freely.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use ferry_download::{
    ConfirmationPresenter, DownloadOrchestrator, DownloadSettings, HttpTransport, MalwareScanner,
    ReputationChecker, Services, Transport,
};
use ferry_security::{
    platform_store, platform_verifier, AttributeStore, AuditSink, CachedVerifier,
    ProvenanceTagger, SignatureVerifier, TracingAuditSink,
};
use ferry_storage::Database;

use crate::config::Config;
use crate::Result;

const SIGNATURE_TIMEOUT: Duration = Duration::from_secs(30);
const SIGNATURE_CACHE_TTL: Duration = Duration::from_secs(300);
const SIGNATURE_CHECKS_PER_CLASS: usize = 2;
/// Finished downloads stay visible this long before being pruned.
const FINISHED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Optional overrides for the collaborators `Ferry` would otherwise build
/// itself. Reputation, scanning and presentation have no default.
#[derive(Default, Clone)]
pub struct Collaborators {
    pub transport: Option<Arc<dyn Transport>>,
    pub attributes: Option<Arc<dyn AttributeStore>>,
    pub verifier: Option<Arc<dyn SignatureVerifier>>,
    pub audit: Option<Arc<dyn AuditSink>>,
    pub reputation: Option<Arc<dyn ReputationChecker>>,
    pub scanner: Option<Arc<dyn MalwareScanner>>,
    pub presenter: Option<Arc<dyn ConfirmationPresenter>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub signatures_purged: usize,
    pub downloads_pruned: usize,
}

#[derive(Clone)]
pub struct Ferry {
    config: Config,
    db: Database,
    tagger: Arc<ProvenanceTagger>,
    signatures: Arc<CachedVerifier>,
    downloads: DownloadOrchestrator,
}

impl Ferry {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_collaborators(config, Collaborators::default())
    }

    pub fn with_collaborators(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.download_dir)?;
        let db = Database::open(&config.database_path)?;

        let audit = collaborators
            .audit
            .unwrap_or_else(|| Arc::new(TracingAuditSink));
        let signatures = Arc::new(CachedVerifier::new(
            collaborators
                .verifier
                .unwrap_or_else(|| platform_verifier(SIGNATURE_TIMEOUT)),
            SIGNATURE_CACHE_TTL,
            SIGNATURE_CHECKS_PER_CLASS,
        ));
        let tagger = Arc::new(ProvenanceTagger::new(
            collaborators.attributes.unwrap_or_else(platform_store),
            signatures.clone(),
            audit.clone(),
            config.agent_identity.clone(),
        ));
        let transport: Arc<dyn Transport> = match collaborators.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config.agent_identity)?),
        };

        let mut services = Services::new(transport, tagger.clone(), audit);
        services.reputation = collaborators.reputation;
        services.scanner = collaborators.scanner;
        services.presenter = collaborators.presenter;

        let downloads =
            DownloadOrchestrator::open(db.clone(), config.download_dir.clone(), services)?;

        tracing::info!(
            database = %config.database_path.display(),
            agent = %config.agent_identity,
            "Ferry initialized"
        );

        Ok(Self {
            config,
            db,
            tagger,
            signatures,
            downloads,
        })
    }

    pub fn downloads(&self) -> &DownloadOrchestrator {
        &self.downloads
    }

    pub fn tagger(&self) -> &Arc<ProvenanceTagger> {
        &self.tagger
    }

    pub fn settings(&self) -> DownloadSettings {
        self.downloads.settings()
    }

    /// Persist new settings and apply them to the orchestrator and tagger.
    pub fn update_settings(&self, settings: DownloadSettings) -> Result<()> {
        Ok(self.downloads.update_settings(settings)?)
    }

    /// Purge stale signature verdicts and drop long-finished downloads.
    pub fn run_maintenance(&self, retention: Duration) -> MaintenanceReport {
        let report = MaintenanceReport {
            signatures_purged: self.signatures.purge_expired(),
            downloads_pruned: self.downloads.prune_finished(retention),
        };
        if report != MaintenanceReport::default() {
            tracing::debug!(
                signatures = report.signatures_purged,
                downloads = report.downloads_pruned,
                "Maintenance pass"
            );
        }
        report
    }

    /// Run maintenance every `period` until the handle is aborted.
    pub fn spawn_maintenance(&self, period: Duration) -> JoinHandle<()> {
        let ferry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                ferry.run_maintenance(FINISHED_RETENTION);
            }
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}
