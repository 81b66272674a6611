//! Ingestion runtime: per-source scheduling, reconciliation into the item
//! store, daily maintenance and the read-through value-estimate cache.

mod config;
mod estimate;
mod maintenance;
mod pipeline;
mod reconcile;
mod scheduler;

pub use config::{SourceConfig, SourceRegistry, SyncConfig, MAINTENANCE_JOB_ID};
pub use estimate::{EstimateCache, EstimateOutcome, EstimationError, Estimator};
pub use maintenance::{price_history, MaintenanceJob};
pub use pipeline::{Pipeline, SourceJob};
pub use reconcile::{
    ItemError, ReconcileError, ReconcileReport, ReconciliationEngine, DEFAULT_ABSENT_PASS_LIMIT,
};
pub use scheduler::{
    JobError, JobInfo, JobTask, Scheduler, SchedulerConfig, SchedulerError, SchedulerStatus,
    Trigger,
};

pub const CRATE_NAME: &str = "lotwatch-sync";

/// Bootstraps from the environment and runs one source to completion.
pub async fn run_source_once_from_env(source_id: &str) -> anyhow::Result<lotwatch_core::RunRecord> {
    let pipeline = Pipeline::bootstrap(SyncConfig::from_env()).await?;
    pipeline.run_source_once(source_id).await
}
