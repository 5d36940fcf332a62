//! Collection orchestration: configuration, quality gate, backup estimates,
//! job registry, scheduler, runner, and notifications.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sportsync_adapters::{
    AdapterRegistry, FeedAdapter, FeedSource, HtmlTableParser, JsonFeedParser, RecordParser,
};
use sportsync_core::CollectionResult;
use sportsync_storage::{RateLimitedClient, ResultStore, StoredResult};
use tracing::{info, warn};

pub mod backup;
pub mod config;
pub mod notify;
pub mod quality;
pub mod registry;
pub mod runner;
pub mod scheduler;

pub use backup::{BackupCalculator, BackupError, Estimate, MetricEstimator};
pub use config::{AppConfig, ConfigError, SourceConfig, SourceFormat};
pub use notify::{Channel, NotificationChain, NotifyError, NotifyOn, NotifyStrategy};
pub use quality::{GateDecision, QualityGate, QualityRules, QualityVerdict};
pub use registry::{JobRegistry, JobSnapshot, JobState, RegistryError};
pub use runner::CollectionRunner;
pub use scheduler::{shutdown_signal, Scheduler};

/// Build one feed adapter per configured source, sharing a rate-limited client.
pub fn build_adapters(config: &AppConfig, client: Arc<RateLimitedClient>) -> AdapterRegistry {
    let mut adapters = AdapterRegistry::new();
    for source in &config.sources {
        let parser: Arc<dyn RecordParser> = match source.format {
            SourceFormat::Json => Arc::new(JsonFeedParser),
            SourceFormat::HtmlTable => Arc::new(HtmlTableParser::new(
                source.table_selector.clone().unwrap_or_else(|| "table".to_string()),
                source.columns.clone(),
            )),
        };
        let feed = FeedSource {
            source_id: source.source_id.clone(),
            base_url: source.base_url.clone(),
            endpoints: source.endpoints.clone(),
        };
        adapters.register(Arc::new(
            FeedAdapter::new(feed, Arc::clone(&client), parser).with_backoff(config.backoff()),
        ));
    }
    adapters
}

pub fn build_quality_gate(config: &AppConfig) -> QualityGate {
    config
        .quality
        .iter()
        .fold(QualityGate::new(config.duplicate_tolerance), |gate, (record_type, rule_override)| {
            gate.with_override(*record_type, rule_override)
        })
}

/// A fully wired process: store, registry, runner, and scheduler.
#[derive(Debug)]
pub struct SyncApp {
    config: AppConfig,
    store: ResultStore,
    registry: Arc<JobRegistry>,
    runner: Arc<CollectionRunner>,
}

impl SyncApp {
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let store = ResultStore::open(&config.database_path)
            .await
            .with_context(|| format!("opening database {}", config.database_path.display()))?;
        let client = Arc::new(
            RateLimitedClient::new(config.http_client_config()).context("building http client")?,
        );
        let adapters = build_adapters(&config, client);
        Self::assemble(config, store, adapters).await
    }

    /// Wire the app around an existing store and adapter set.
    pub async fn assemble(
        config: AppConfig,
        store: ResultStore,
        adapters: AdapterRegistry,
    ) -> Result<Self> {
        let registry = JobRegistry::new(config.collection_jobs()).context("registering jobs")?;
        let persisted = store.load_jobs().await.context("loading persisted job state")?;
        let merged = registry.merge_persisted(&persisted);
        info!(jobs = config.jobs.len(), merged, "job registry ready");
        for snapshot in registry.snapshot() {
            store
                .save_job(&snapshot.job)
                .await
                .with_context(|| format!("saving job {}", snapshot.job.job_id))?;
        }

        let notifier = Arc::new(NotificationChain::from_channels(
            &config.notifications.channels,
            config.notifications.notify_on,
        ));
        let runner = Arc::new(CollectionRunner::new(
            adapters,
            build_quality_gate(&config),
            BackupCalculator::default(),
            store.clone(),
            notifier,
            config.run_timeout(),
        ));

        Ok(Self {
            config,
            store,
            registry: Arc::new(registry),
            runner,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.runner),
            self.config.tick_interval(),
            self.config.max_concurrent_runs,
        ))
    }

    /// Run one job now, regardless of its schedule.
    pub async fn run_once(&self, job_id: &str) -> Result<CollectionResult> {
        let job = self.registry.try_claim(job_id)?;
        if !job.enabled {
            warn!(job_id, "running a disabled job on request");
        }
        let result = self.runner.run(&job).await;
        let updated = self.registry.complete(job_id, &result)?;
        self.store
            .save_job(&updated)
            .await
            .with_context(|| format!("saving job {job_id}"))?;
        Ok(result)
    }

    pub fn status(&self) -> Vec<JobSnapshot> {
        self.registry.snapshot()
    }

    pub async fn history(&self, job_id: &str, limit: usize) -> Result<Vec<StoredResult>> {
        if self.registry.get(job_id).is_none() {
            bail!("unknown job `{job_id}`");
        }
        self.store
            .recent_results(job_id, limit)
            .await
            .with_context(|| format!("reading history for {job_id}"))
    }
}
