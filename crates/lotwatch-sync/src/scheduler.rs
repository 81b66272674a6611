//! Per-source job registry: cadence, pause/resume, single-flight runs and
//! bounded run history. A tokio-cron-scheduler repeated job drives `tick`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotwatch_adapters::SourceUnavailable;
use lotwatch_core::{JobState, RunCounts, RunOutcome, RunRecord};
use lotwatch_storage::{ItemStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reconcile::ReconcileError;

/// Why a run failed. Partial counts survive so the run record can report them.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    SourceUnavailable(#[from] SourceUnavailable),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl JobError {
    pub fn partial_counts(&self) -> RunCounts {
        match self {
            Self::Reconcile(err) => err.counts(),
            Self::SourceUnavailable(_) | Self::Storage(_) => RunCounts::default(),
        }
    }
}

/// The work behind one job.
#[async_trait]
pub trait JobTask: Send + Sync {
    async fn run(&self) -> Result<RunCounts, JobError>;
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job `{0}` is not registered")]
    UnknownJob(String),
    #[error("job `{0}` is already registered")]
    AlreadyRegistered(String),
    #[error("job `{0}` is not enabled")]
    NotEnabled(String),
    #[error("interval must be at least one minute")]
    InvalidInterval,
    #[error("scheduler driver: {0}")]
    Driver(String),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub run_timeout: Duration,
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            run_timeout: Duration::from_secs(900),
            history_limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub description: String,
    pub default_interval_minutes: u32,
    pub interval_minutes: u32,
    pub enabled: bool,
    pub paused: bool,
    pub state: JobState,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<RunRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub active_jobs: usize,
    pub registered_jobs: usize,
}

/// Result of a manual trigger.
#[derive(Debug)]
pub enum Trigger {
    Dispatched(JoinHandle<RunRecord>),
    /// The job was already running; nothing new was started.
    Skipped(RunRecord),
}

struct JobEntry {
    description: String,
    default_interval_minutes: u32,
    interval_minutes: u32,
    enabled: bool,
    paused: bool,
    next_run: Option<DateTime<Utc>>,
    running: bool,
    history: VecDeque<RunRecord>,
    task: Arc<dyn JobTask>,
}

impl JobEntry {
    fn state(&self) -> JobState {
        if self.running {
            JobState::Running
        } else if !self.enabled || self.paused {
            JobState::Inactive
        } else {
            JobState::Idle
        }
    }

    fn push_history(&mut self, record: RunRecord, limit: usize) {
        self.history.push_back(record);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    fn info(&self, id: &str) -> JobInfo {
        JobInfo {
            id: id.to_string(),
            description: self.description.clone(),
            default_interval_minutes: self.default_interval_minutes,
            interval_minutes: self.interval_minutes,
            enabled: self.enabled,
            paused: self.paused,
            state: self.state(),
            next_run: self.next_run,
            last_run: self.history.back().cloned(),
        }
    }
}

fn interval(minutes: u32) -> chrono::Duration {
    chrono::Duration::minutes(i64::from(minutes))
}

fn driver_err(err: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::Driver(err.to_string())
}

struct SchedulerInner {
    config: SchedulerConfig,
    jobs: Mutex<BTreeMap<String, JobEntry>>,
    events: broadcast::Sender<RunRecord>,
    recorder: Option<Arc<dyn ItemStore>>,
    driver: tokio::sync::Mutex<Option<JobScheduler>>,
    started: AtomicBool,
}

impl SchedulerInner {
    fn jobs(&self) -> MutexGuard<'_, BTreeMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clears the running flag and appends the record.
    fn complete(&self, record: RunRecord) {
        if let Some(job) = self.jobs().get_mut(&record.job_id) {
            job.running = false;
            job.push_history(record.clone(), self.config.history_limit);
        }
        match record.outcome {
            RunOutcome::Success => info!(
                job_id = %record.job_id,
                run_id = %record.run_id,
                created = record.counts.created,
                updated = record.counts.updated,
                ended = record.counts.ended,
                "job run succeeded"
            ),
            RunOutcome::Failed => error!(
                job_id = %record.job_id,
                run_id = %record.run_id,
                error = record.error.as_deref().unwrap_or_default(),
                "job run failed"
            ),
            RunOutcome::Skipped => debug!(job_id = %record.job_id, "job run skipped"),
        }
        let _ = self.events.send(record);
    }
}

/// Clears the running flag on every exit path. A run that never reaches
/// `finish` (panic, cancellation) is recorded as failed.
struct RunGuard {
    inner: Arc<SchedulerInner>,
    job_id: String,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished: bool,
}

impl RunGuard {
    fn record(&self, outcome: RunOutcome, counts: RunCounts, error: Option<String>) -> RunRecord {
        RunRecord {
            run_id: self.run_id,
            job_id: self.job_id.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            outcome,
            counts,
            error,
        }
    }

    fn finish(mut self, result: Result<Result<RunCounts, JobError>, tokio::time::error::Elapsed>) -> RunRecord {
        let record = match result {
            Ok(Ok(counts)) => self.record(RunOutcome::Success, counts, None),
            Ok(Err(err)) => self.record(RunOutcome::Failed, err.partial_counts(), Some(err.to_string())),
            Err(_) => self.record(
                RunOutcome::Failed,
                RunCounts::default(),
                Some(format!(
                    "timed out after {}s",
                    self.inner.config.run_timeout.as_secs_f64()
                )),
            ),
        };
        self.finished = true;
        self.inner.complete(record.clone());
        record
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            let record = self.record(
                RunOutcome::Failed,
                RunCounts::default(),
                Some("run aborted before completion".to_string()),
            );
            self.inner.complete(record);
        }
    }
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::build(config, None)
    }

    /// Also persists every run record to `store`.
    pub fn with_recorder(config: SchedulerConfig, store: Arc<dyn ItemStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: SchedulerConfig, recorder: Option<Arc<dyn ItemStore>>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                jobs: Mutex::new(BTreeMap::new()),
                events,
                recorder,
                driver: tokio::sync::Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Registers a disabled job. Use [`Scheduler::enable`] to put it on a cadence.
    pub fn register(
        &self,
        id: &str,
        description: impl Into<String>,
        default_interval_minutes: u32,
        task: Arc<dyn JobTask>,
    ) -> Result<(), SchedulerError> {
        if default_interval_minutes == 0 {
            return Err(SchedulerError::InvalidInterval);
        }
        let mut jobs = self.inner.jobs();
        if jobs.contains_key(id) {
            return Err(SchedulerError::AlreadyRegistered(id.to_string()));
        }
        jobs.insert(
            id.to_string(),
            JobEntry {
                description: description.into(),
                default_interval_minutes,
                interval_minutes: default_interval_minutes,
                enabled: false,
                paused: false,
                next_run: None,
                running: false,
                history: VecDeque::new(),
                task,
            },
        );
        Ok(())
    }

    pub fn register_source(
        &self,
        source_id: &str,
        default_interval_minutes: u32,
        task: Arc<dyn JobTask>,
    ) -> Result<(), SchedulerError> {
        self.register(
            source_id,
            format!("Scrape {source_id} listings"),
            default_interval_minutes,
            task,
        )
    }

    /// Enables (or re-enables with a new interval) and schedules the next
    /// run one interval from now. History is kept.
    pub fn enable(&self, id: &str, interval_minutes: Option<u32>) -> Result<JobInfo, SchedulerError> {
        self.enable_at(id, interval_minutes, Utc::now())
    }

    pub(crate) fn enable_at(
        &self,
        id: &str,
        interval_minutes: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<JobInfo, SchedulerError> {
        if interval_minutes == Some(0) {
            return Err(SchedulerError::InvalidInterval);
        }
        let mut jobs = self.inner.jobs();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;
        job.interval_minutes = interval_minutes.unwrap_or(job.default_interval_minutes);
        job.enabled = true;
        job.paused = false;
        job.next_run = Some(now + interval(job.interval_minutes));
        info!(job_id = id, interval_minutes = job.interval_minutes, next_run = ?job.next_run, "job enabled");
        Ok(job.info(id))
    }

    /// Removes the job from the active set. A run in progress finishes.
    pub fn disable(&self, id: &str) -> Result<JobInfo, SchedulerError> {
        let mut jobs = self.inner.jobs();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;
        job.enabled = false;
        job.paused = false;
        job.next_run = None;
        info!(job_id = id, "job disabled");
        Ok(job.info(id))
    }

    /// Stops future runs but keeps the cadence and next-run time.
    pub fn pause(&self, id: &str) -> Result<JobInfo, SchedulerError> {
        let mut jobs = self.inner.jobs();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;
        if !job.enabled {
            return Err(SchedulerError::NotEnabled(id.to_string()));
        }
        job.paused = true;
        info!(job_id = id, "job paused");
        Ok(job.info(id))
    }

    /// Resumes on the original next-run time. An overdue job fires once on
    /// the next tick; missed intervals are not replayed.
    pub fn resume(&self, id: &str) -> Result<JobInfo, SchedulerError> {
        let mut jobs = self.inner.jobs();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;
        if !job.enabled {
            return Err(SchedulerError::NotEnabled(id.to_string()));
        }
        job.paused = false;
        info!(job_id = id, next_run = ?job.next_run, "job resumed");
        Ok(job.info(id))
    }

    /// Starts a run outside the cadence. Works on paused and disabled jobs;
    /// never starts a second concurrent run.
    pub fn run_now(&self, id: &str) -> Result<Trigger, SchedulerError> {
        let task = {
            let mut jobs = self.inner.jobs();
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;
            if job.running {
                let record = RunRecord::skipped(id, Utc::now());
                job.push_history(record.clone(), self.inner.config.history_limit);
                drop(jobs);
                warn!(job_id = id, "manual trigger skipped; job already running");
                let _ = self.inner.events.send(record.clone());
                return Ok(Trigger::Skipped(record));
            }
            job.running = true;
            job.task.clone()
        };
        Ok(Trigger::Dispatched(self.spawn_run(id.to_string(), task)))
    }

    /// Dispatches every enabled, unpaused job whose next run is due.
    pub fn tick(&self) -> Vec<JoinHandle<RunRecord>> {
        self.tick_at(Utc::now())
    }

    pub(crate) fn tick_at(&self, now: DateTime<Utc>) -> Vec<JoinHandle<RunRecord>> {
        let mut due = Vec::new();
        let mut skipped = Vec::new();
        {
            let limit = self.inner.config.history_limit;
            let mut jobs = self.inner.jobs();
            for (id, job) in jobs.iter_mut() {
                if !job.enabled || job.paused || job.next_run.is_none_or(|next| next > now) {
                    continue;
                }
                job.next_run = Some(now + interval(job.interval_minutes));
                if job.running {
                    let record = RunRecord::skipped(id.as_str(), now);
                    job.push_history(record.clone(), limit);
                    skipped.push(record);
                    continue;
                }
                job.running = true;
                due.push((id.clone(), job.task.clone()));
            }
        }
        for record in skipped {
            warn!(job_id = %record.job_id, "scheduled run skipped; previous run still in progress");
            let _ = self.inner.events.send(record);
        }
        due.into_iter()
            .map(|(id, task)| self.spawn_run(id, task))
            .collect()
    }

    /// The guard exists before the task does, so a task dropped unpolled
    /// still releases the job.
    fn spawn_run(&self, job_id: String, task: Arc<dyn JobTask>) -> JoinHandle<RunRecord> {
        let inner = self.inner.clone();
        let guard = RunGuard {
            inner: inner.clone(),
            job_id: job_id.clone(),
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished: false,
        };
        tokio::spawn(async move {
            let span = info_span!("job_run", job_id = %job_id, run_id = %guard.run_id);
            let result = tokio::time::timeout(inner.config.run_timeout, task.run())
                .instrument(span)
                .await;
            let record = guard.finish(result);

            if let Some(store) = &inner.recorder {
                if let Err(err) = store.record_run(&record).await {
                    warn!(job_id = %job_id, error = %err, "failed to persist run record");
                }
            }
            record
        })
    }

    pub fn status(&self) -> SchedulerStatus {
        let jobs = self.inner.jobs();
        SchedulerStatus {
            running: self.inner.started.load(Ordering::SeqCst),
            active_jobs: jobs.values().filter(|j| j.enabled).count(),
            registered_jobs: jobs.len(),
        }
    }

    /// Jobs in the active set.
    pub fn list_jobs(&self) -> Vec<JobInfo> {
        self.inner
            .jobs()
            .iter()
            .filter(|(_, job)| job.enabled)
            .map(|(id, job)| job.info(id))
            .collect()
    }

    /// Every registered job, active or not.
    pub fn available_jobs(&self) -> Vec<JobInfo> {
        self.inner
            .jobs()
            .iter()
            .map(|(id, job)| job.info(id))
            .collect()
    }

    pub fn job(&self, id: &str) -> Option<JobInfo> {
        self.inner.jobs().get(id).map(|job| job.info(id))
    }

    /// Newest first.
    pub fn history(&self, id: &str, limit: usize) -> Result<Vec<RunRecord>, SchedulerError> {
        let jobs = self.inner.jobs();
        let job = jobs
            .get(id)
            .ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;
        Ok(job.history.iter().rev().take(limit).cloned().collect())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunRecord> {
        self.inner.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Starts the background tick driver. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut driver = self.inner.driver.lock().await;
        if driver.is_some() {
            return Ok(());
        }
        let sched = JobScheduler::new().await.map_err(driver_err)?;
        let weak = Arc::downgrade(&self.inner);
        let tick_job = Job::new_repeated_async(self.inner.config.tick_interval, move |_uuid, _l| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    let dispatched = Scheduler { inner }.tick();
                    if !dispatched.is_empty() {
                        debug!(jobs = dispatched.len(), "tick dispatched jobs");
                    }
                }
            })
        })
        .map_err(driver_err)?;
        sched.add(tick_job).await.map_err(driver_err)?;
        sched.start().await.map_err(driver_err)?;
        *driver = Some(sched);
        self.inner.started.store(true, Ordering::SeqCst);
        info!(
            tick_secs = self.inner.config.tick_interval.as_secs(),
            "scheduler started"
        );
        Ok(())
    }

    /// Stops the tick driver. Runs already dispatched complete on their own.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let taken = self.inner.driver.lock().await.take();
        self.inner.started.store(false, Ordering::SeqCst);
        if let Some(mut sched) = taken {
            sched.shutdown().await.map_err(driver_err)?;
            info!("scheduler stopped");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("status", &self.status())
            .finish()
    }
}
