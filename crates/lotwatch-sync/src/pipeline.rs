use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use lotwatch_adapters::{adapter_for_source, AdapterContext, AdapterRegistry, SourceAdapter, SourceUnavailable};
use lotwatch_classify::Classifier;
use lotwatch_core::{RunCounts, RunRecord};
use lotwatch_storage::{HttpClientConfig, HttpFetcher, ItemStore, MemoryItemStore, PgItemStore};
use tracing::{info, warn};

use crate::config::{SourceConfig, SourceRegistry, SyncConfig, MAINTENANCE_JOB_ID};
use crate::estimate::{EstimateCache, Estimator};
use crate::maintenance::MaintenanceJob;
use crate::reconcile::ReconciliationEngine;
use crate::scheduler::{JobError, JobTask, Scheduler, SchedulerConfig, Trigger};

/// One scheduled pass for one source: fetch a batch, then reconcile it.
pub struct SourceJob {
    adapter: Arc<dyn SourceAdapter>,
    http: Arc<HttpFetcher>,
    engine: Arc<ReconciliationEngine>,
    max_items: usize,
    adapter_timeout: Duration,
}

impl SourceJob {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        http: Arc<HttpFetcher>,
        engine: Arc<ReconciliationEngine>,
        max_items: usize,
        adapter_timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            http,
            engine,
            max_items,
            adapter_timeout,
        }
    }
}

#[async_trait]
impl JobTask for SourceJob {
    async fn run(&self) -> Result<RunCounts, JobError> {
        let source_id = self.adapter.source_id().to_string();
        let ctx = AdapterContext::new(Utc::now());
        let fetch = self.adapter.fetch_batch(&self.http, &ctx, self.max_items);
        let batch = tokio::time::timeout(self.adapter_timeout, fetch)
            .await
            .map_err(|_| {
                SourceUnavailable::new(
                    &source_id,
                    format!("adapter timed out after {}s", self.adapter_timeout.as_secs()),
                )
            })??;
        if batch.truncated {
            warn!(source_id = %source_id, items = batch.items.len(), "batch truncated");
        }
        let report = self.engine.reconcile(&batch, Utc::now()).await?;
        Ok(report.counts)
    }
}

/// Everything a running ingestion process needs, wired once at startup.
pub struct Pipeline {
    config: SyncConfig,
    store: Arc<dyn ItemStore>,
    http: Arc<HttpFetcher>,
    engine: Arc<ReconciliationEngine>,
    adapters: AdapterRegistry,
    sources: Vec<SourceConfig>,
    scheduler: Scheduler,
}

impl Pipeline {
    /// Connects the store named by `DATABASE_URL` (or an in-memory store)
    /// and loads the source list.
    pub async fn bootstrap(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn ItemStore> = match &config.database_url {
            Some(url) => {
                let store = PgItemStore::connect(url, config.database_max_connections)
                    .await
                    .context("connecting to postgres")?;
                store.migrate().await.context("running migrations")?;
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory store");
                Arc::new(MemoryItemStore::new())
            }
        };
        let sources = SourceRegistry::from_config(&config)?;
        let classifier = Classifier::builtin().context("loading classifier rules")?;
        Self::assemble(config, store, classifier, sources)
    }

    /// Builds adapters from `sources` and registers one job per source plus
    /// the maintenance job. Adapters come from the built-in map.
    pub fn assemble(
        config: SyncConfig,
        store: Arc<dyn ItemStore>,
        classifier: Classifier,
        sources: SourceRegistry,
    ) -> Result<Self> {
        let mut adapters = AdapterRegistry::new();
        for source in &sources.sources {
            let adapter = adapter_for_source(&source.source_id, &source.options)
                .ok_or_else(|| anyhow!("no adapter available for source `{}`", source.source_id))?;
            adapters.register(adapter);
        }
        Self::with_adapters(config, store, classifier, sources, adapters)
    }

    /// Like [`Pipeline::assemble`] with a caller-supplied adapter registry.
    pub fn with_adapters(
        config: SyncConfig,
        store: Arc<dyn ItemStore>,
        classifier: Classifier,
        sources: SourceRegistry,
        adapters: AdapterRegistry,
    ) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            default_requests_per_second: (config.requests_per_second > 0.0)
                .then_some(config.requests_per_second),
            source_rates: sources.request_rates(),
            ..Default::default()
        })?);
        let engine = Arc::new(
            ReconciliationEngine::new(store.clone(), Arc::new(classifier))
                .with_absent_pass_limit(config.absent_pass_limit),
        );
        let scheduler = Scheduler::with_recorder(
            SchedulerConfig {
                tick_interval: config.tick_interval,
                run_timeout: config.run_timeout,
                history_limit: config.history_limit,
            },
            store.clone(),
        );

        for source in &sources.sources {
            let Some(adapter) = adapters.get(&source.source_id) else {
                bail!("no adapter registered for source `{}`", source.source_id);
            };
            let job = SourceJob::new(
                adapter,
                http.clone(),
                engine.clone(),
                source.max_items.unwrap_or(config.default_max_items),
                config.adapter_timeout,
            );
            scheduler.register_source(&source.source_id, source.interval_minutes, Arc::new(job))?;
        }
        scheduler.register(
            MAINTENANCE_JOB_ID,
            "Expire ended items and take daily price snapshots",
            config.maintenance_interval_minutes,
            Arc::new(MaintenanceJob::new(store.clone())),
        )?;

        let pipeline = Self {
            config,
            store,
            http,
            engine,
            adapters,
            sources: sources.sources,
            scheduler,
        };
        if pipeline.config.auto_start {
            pipeline.enable_configured()?;
        }
        Ok(pipeline)
    }

    /// Enables every source marked `enabled`, plus maintenance.
    pub fn enable_configured(&self) -> Result<()> {
        for source in self.sources.iter().filter(|s| s.enabled) {
            self.scheduler.enable(&source.source_id, None)?;
        }
        self.scheduler.enable(MAINTENANCE_JOB_ID, None)?;
        info!(active = self.scheduler.status().active_jobs, "configured jobs enabled");
        Ok(())
    }

    /// Runs one source to completion through the scheduler, so the pass is
    /// single-flight and recorded like any scheduled run.
    pub async fn run_source_once(&self, source_id: &str) -> Result<RunRecord> {
        match self.scheduler.run_now(source_id)? {
            Trigger::Dispatched(handle) => handle.await.context("job task panicked"),
            Trigger::Skipped(record) => Ok(record),
        }
    }

    pub fn estimate_cache(&self, estimator: Arc<dyn Estimator>) -> EstimateCache {
        EstimateCache::new(self.store.clone(), estimator)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn store(&self) -> Arc<dyn ItemStore> {
        self.store.clone()
    }

    pub fn engine(&self) -> Arc<ReconciliationEngine> {
        self.engine.clone()
    }

    pub fn http(&self) -> Arc<HttpFetcher> {
        self.http.clone()
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotwatch_core::RunOutcome;

    fn pipeline(yaml: &str, auto_start: bool) -> Result<Pipeline> {
        let config = SyncConfig {
            auto_start,
            ..SyncConfig::default()
        };
        Pipeline::assemble(
            config,
            Arc::new(MemoryItemStore::new()),
            Classifier::builtin()?,
            SourceRegistry::from_yaml_str(yaml)?,
        )
    }

    #[tokio::test]
    async fn auto_start_enables_only_enabled_sources() {
        let p = pipeline(
            "sources:\n  - {source_id: cardhobby, interval_minutes: 30}\n  - {source_id: queencity, interval_minutes: 60, enabled: false}\n",
            true,
        )
        .unwrap();
        let active: Vec<_> = p.scheduler().list_jobs().into_iter().map(|j| j.id).collect();
        assert_eq!(active, vec!["cardhobby".to_string(), MAINTENANCE_JOB_ID.to_string()]);
        assert_eq!(p.scheduler().available_jobs().len(), 3);
    }

    #[tokio::test]
    async fn without_auto_start_nothing_is_active() {
        let p = pipeline("sources:\n  - {source_id: gregmorris, interval_minutes: 30}\n", false).unwrap();
        assert_eq!(p.scheduler().status().active_jobs, 0);
    }

    #[tokio::test]
    async fn request_pacing_reaches_the_fetcher() {
        let p = pipeline(
            "sources:\n  - {source_id: pristine, interval_minutes: 30, requests_per_second: 2}\n  - {source_id: cardhobby, interval_minutes: 30}\n",
            false,
        )
        .unwrap();
        let pristine = p.http.pacer("pristine").await.unwrap();
        assert_eq!(pristine.min_interval().as_millis(), 500);
        let cardhobby = p.http.pacer("cardhobby").await.unwrap();
        assert_eq!(cardhobby.min_interval().as_millis(), 100);
    }

    #[test]
    fn unknown_source_is_a_startup_error() {
        assert!(pipeline("sources:\n  - {source_id: ebay, interval_minutes: 30}\n", false).is_err());
    }

    #[tokio::test]
    async fn manual_source_failure_becomes_failed_run() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        let yaml = format!(
            "sources:\n  - source_id: manual\n    interval_minutes: 60\n    path: {}\n",
            missing.display()
        );
        let p = pipeline(&yaml, false).unwrap();
        let record = p.run_source_once("manual").await.unwrap();
        assert_eq!(record.outcome, RunOutcome::Failed);
        assert!(record.error.unwrap().contains("manual"));
        assert_eq!(p.store().recent_runs("manual", 5).await.unwrap().len(), 1);
    }
}
